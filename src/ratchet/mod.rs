mod chain;
mod message;
mod skipped;

use crate::Error;
use crate::cipher;
use crate::proto::{ChainProto, RatchetProto, SkippedKeyProto};
use crate::types::{SymmetricKey, X25519PublicKey, X25519Secret, to_array};
use crate::x3dh::X3DHSharedSecret;
pub(crate) use chain::{derive, Chain};
pub use message::{MessageHeader, RatchetMessage};
use skipped::SkippedKeys;
use hkdf::Hkdf;
use sha2::Sha256;
use std::collections::VecDeque;
use tracing::{debug, trace};
use x25519_dalek::SharedSecret;
use zeroize::Zeroizing;

const ROOT_KDF_INFO: &[u8] = b"Hushwire-Ratchet-Root";
const MESSAGE_KEY_INFO: &[u8] = b"Hushwire-Message-Keys";
const MAX_RETIRED_RATCHET_KEYS: usize = 16;

/// Length of the session associated data: initiator identity || responder identity.
pub const AD_LEN: usize = 64;

#[derive(Clone)]
struct RatchetState {
    dh_pair: X25519Secret,
    remote_ratchet_key: Option<X25519PublicKey>,
    root_key: SymmetricKey,
    sending_chain: Option<Chain>,
    receiving_chain: Option<Chain>,
    previous_sending_chain_length: u32,
    ad: [u8; AD_LEN],
}

/// Double Ratchet session keying.
///
/// The Double Ratchet algorithm provides forward secrecy (compromise of current keys
/// does not compromise past messages) and break-in recovery (compromise of current
/// keys does not compromise future messages as long as a DH ratchet step happens).
///
/// It manages:
/// - A root key that evolves with each DH ratchet step
/// - Separate sending and receiving chain keys for message encryption
/// - A bounded cache of skipped message keys for out-of-order delivery
///
/// Decryption is transactional: it runs on a copy of the state and only
/// replaces the live state once the AEAD tag verified. A failed decryption
/// never advances any chain.
#[derive(Clone)]
pub struct DoubleRatchet {
    state: RatchetState,
    skipped: SkippedKeys,
    // Superseded peer ratchet keys; their chains can only be served from `skipped`.
    retired_ratchet_keys: VecDeque<[u8; 32]>,
    max_skip: u32,
}

impl DoubleRatchet {
    /// Initializes a ratchet for the initiator of the X3DH handshake.
    ///
    /// The responder's signed pre-key doubles as its first ratchet key, so the
    /// initiator can send right away.
    pub(crate) fn initialize_as_initiator(
        shared_secret: X3DHSharedSecret,
        remote_signed_pre_key: &X25519PublicKey,
        ad: [u8; AD_LEN],
        max_skip: u32,
    ) -> Result<Self, Error> {
        let dh_pair = X25519Secret::generate()?;
        let (root_key, chain_key) = kdf_rk(&shared_secret.0, dh_pair.dh(remote_signed_pre_key))?;

        Ok(Self {
            state: RatchetState {
                dh_pair,
                remote_ratchet_key: Some(*remote_signed_pre_key),
                root_key,
                sending_chain: Some(Chain::new(chain_key)),
                receiving_chain: None,
                previous_sending_chain_length: 0,
                ad,
            },
            skipped: SkippedKeys::new(max_skip as usize),
            retired_ratchet_keys: VecDeque::new(),
            max_skip,
        })
    }

    /// Initializes a ratchet for the responder.
    ///
    /// The responder cannot send until it received the initiator's first
    /// message, which carries the initiator's ratchet key.
    pub(crate) fn initialize_as_responder(
        shared_secret: X3DHSharedSecret,
        signed_pre_key: X25519Secret,
        ad: [u8; AD_LEN],
        max_skip: u32,
    ) -> Self {
        Self {
            state: RatchetState {
                dh_pair: signed_pre_key,
                remote_ratchet_key: None,
                root_key: Zeroizing::new(*shared_secret.0),
                sending_chain: None,
                receiving_chain: None,
                previous_sending_chain_length: 0,
                ad,
            },
            skipped: SkippedKeys::new(max_skip as usize),
            retired_ratchet_keys: VecDeque::new(),
            max_skip,
        }
    }

    /// Current local ratchet public key.
    pub fn public_key(&self) -> X25519PublicKey {
        self.state.dh_pair.public_key()
    }

    /// Whether the sending chain exists yet.
    pub fn can_send(&self) -> bool {
        self.state.sending_chain.is_some()
    }

    /// Number of the next outgoing message in the current sending chain.
    pub fn sending_index(&self) -> u32 {
        self.state.sending_chain.as_ref().map_or(0, Chain::index)
    }

    /// Number of the next expected message in the current receiving chain.
    pub fn receiving_index(&self) -> u32 {
        self.state.receiving_chain.as_ref().map_or(0, Chain::index)
    }

    pub fn skipped_keys(&self) -> usize {
        self.skipped.len()
    }

    pub fn associated_data(&self) -> &[u8; AD_LEN] {
        &self.state.ad
    }

    /// Encrypts a message.
    ///
    /// Derives the message key from the sending chain, advances the chain,
    /// and authenticates the header together with the session AD. The message
    /// key is wiped before returning.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<RatchetMessage, Error> {
        let header = MessageHeader {
            ratchet_key: self.public_key(),
            previous_chain_length: self.state.previous_sending_chain_length,
            message_number: self.sending_index(),
        };

        let sending_chain = self.state.sending_chain.as_mut().ok_or_else(|| {
            Error::Protocol("no sending chain before the first received message".to_string())
        })?;
        let message_key = sending_chain.next()?;
        let ciphertext = cipher::seal(
            &message_key,
            MESSAGE_KEY_INFO,
            plaintext,
            &self.aad(&header),
        )?;

        trace!(n = header.message_number, "ratchet message encrypted");
        Ok(RatchetMessage { header, ciphertext })
    }

    /// Decrypts a message.
    ///
    /// This performs the following steps:
    /// 1. Tries the skipped message keys first
    /// 2. Rejects counters that were already consumed or evicted
    /// 3. Performs a DH ratchet step if the header carries a new ratchet key
    /// 4. Caches the keys of any skipped messages
    /// 5. Derives the message key and decrypts the message
    pub fn decrypt(&mut self, message: &RatchetMessage) -> Result<Vec<u8>, Error> {
        let header = &message.header;
        let aad = self.aad(header);

        let key_id = (header.ratchet_key.to_bytes(), header.message_number);
        if let Some(message_key) = self.skipped.get(&key_id) {
            let plaintext = cipher::open(message_key, MESSAGE_KEY_INFO, &message.ciphertext, &aad)?;
            self.skipped.remove(&key_id);
            trace!(n = header.message_number, "decrypted with skipped message key");
            return Ok(plaintext);
        }

        let is_current_chain = self.state.remote_ratchet_key == Some(header.ratchet_key);
        if (is_current_chain && header.message_number < self.receiving_index())
            || self.retired_ratchet_keys.contains(&key_id.0)
        {
            return Err(Error::MessageKeyNotCached(header.message_number));
        }

        let mut next = self.clone();
        if !is_current_chain {
            next.skip_message_keys(header.previous_chain_length)?;
            next.perform_dh_ratchet_step(&header.ratchet_key)?;
        }
        next.skip_message_keys(header.message_number)?;

        let message_key = next
            .state
            .receiving_chain
            .as_mut()
            .ok_or_else(|| Error::Protocol("no receiving chain".to_string()))?
            .next()?;
        let plaintext = cipher::open(&message_key, MESSAGE_KEY_INFO, &message.ciphertext, &aad)?;

        *self = next;
        Ok(plaintext)
    }

    /// Mixes a new peer ratchet key into the root key.
    ///
    /// Derives the receiving chain from DH(current private, new peer key),
    /// then replaces the local ratchet key pair and derives the sending chain
    /// from DH(new private, new peer key). The old root key, chains and
    /// private key are overwritten and wiped.
    pub fn perform_dh_ratchet_step(&mut self, remote_ratchet_key: &X25519PublicKey) -> Result<(), Error> {
        if let Some(previous) = self.state.remote_ratchet_key {
            self.retired_ratchet_keys.push_back(previous.to_bytes());
            if self.retired_ratchet_keys.len() > MAX_RETIRED_RATCHET_KEYS {
                self.retired_ratchet_keys.pop_front();
            }
        }

        self.state.previous_sending_chain_length = self.sending_index();
        self.state.remote_ratchet_key = Some(*remote_ratchet_key);

        let (root_key, receiving_chain_key) =
            kdf_rk(&self.state.root_key, self.state.dh_pair.dh(remote_ratchet_key))?;
        self.state.root_key = root_key;
        self.state.receiving_chain = Some(Chain::new(receiving_chain_key));

        self.state.dh_pair = X25519Secret::generate()?;
        let (root_key, sending_chain_key) =
            kdf_rk(&self.state.root_key, self.state.dh_pair.dh(remote_ratchet_key))?;
        self.state.root_key = root_key;
        self.state.sending_chain = Some(Chain::new(sending_chain_key));

        debug!(
            previous_chain_length = self.state.previous_sending_chain_length,
            "performed DH ratchet step"
        );
        Ok(())
    }

    /// Derives and caches the receiving-chain keys for messages before `until`.
    fn skip_message_keys(&mut self, until: u32) -> Result<(), Error> {
        let Some(remote_ratchet_key) = self.state.remote_ratchet_key else {
            return Ok(());
        };
        let Some(receiving_chain) = self.state.receiving_chain.as_mut() else {
            return Ok(());
        };

        if until.saturating_sub(receiving_chain.index()) > self.max_skip {
            return Err(Error::MessageKeyNotCached(until));
        }

        while receiving_chain.index() < until {
            let n = receiving_chain.index();
            let message_key = receiving_chain.next()?;
            self.skipped.insert((remote_ratchet_key.to_bytes(), n), message_key);
        }

        Ok(())
    }

    fn aad(&self, header: &MessageHeader) -> Vec<u8> {
        let mut aad = Vec::with_capacity(AD_LEN + message::HEADER_LEN);
        aad.extend_from_slice(&self.state.ad);
        aad.extend_from_slice(&header.to_bytes());
        aad
    }

    pub(crate) fn to_proto(&self) -> RatchetProto {
        RatchetProto {
            dh_private: self.state.dh_pair.as_bytes().to_vec(),
            remote_ratchet_key: self
                .state
                .remote_ratchet_key
                .map(|key| key.to_bytes().to_vec()),
            root_key: self.state.root_key.to_vec(),
            sending_chain: self.state.sending_chain.as_ref().map(chain_to_proto),
            receiving_chain: self.state.receiving_chain.as_ref().map(chain_to_proto),
            previous_sending_chain_length: self.state.previous_sending_chain_length,
            associated_data: self.state.ad.to_vec(),
            skipped_keys: self
                .skipped
                .iter()
                .map(|((ratchet_key, message_number), message_key)| SkippedKeyProto {
                    ratchet_key: ratchet_key.to_vec(),
                    message_number: *message_number,
                    message_key: message_key.to_vec(),
                })
                .collect(),
            retired_ratchet_keys: self
                .retired_ratchet_keys
                .iter()
                .map(|key| key.to_vec())
                .collect(),
            max_skip: self.max_skip,
        }
    }

    pub(crate) fn from_proto(proto: &RatchetProto) -> Result<Self, Error> {
        let mut skipped = SkippedKeys::new(proto.max_skip as usize);
        for entry in &proto.skipped_keys {
            skipped.insert(
                (
                    to_array(&entry.ratchet_key, "Skipped ratchet key")?,
                    entry.message_number,
                ),
                secret_from_slice(&entry.message_key)?,
            );
        }

        let retired_ratchet_keys = proto
            .retired_ratchet_keys
            .iter()
            .map(|key| to_array(key, "Retired ratchet key"))
            .collect::<Result<_, _>>()?;

        Ok(Self {
            state: RatchetState {
                dh_pair: X25519Secret::from_slice(&proto.dh_private)?,
                remote_ratchet_key: proto
                    .remote_ratchet_key
                    .as_deref()
                    .map(X25519PublicKey::from_slice)
                    .transpose()?,
                root_key: secret_from_slice(&proto.root_key)?,
                sending_chain: proto.sending_chain.as_ref().map(chain_from_proto).transpose()?,
                receiving_chain: proto
                    .receiving_chain
                    .as_ref()
                    .map(chain_from_proto)
                    .transpose()?,
                previous_sending_chain_length: proto.previous_sending_chain_length,
                ad: to_array(&proto.associated_data, "Associated data")?,
            },
            skipped,
            retired_ratchet_keys,
            max_skip: proto.max_skip,
        })
    }
}

/// Root KDF: HKDF keyed by the current root key over the DH output.
///
/// Returns the new root key and a new chain key.
fn kdf_rk(root_key: &[u8; 32], dh_output: SharedSecret) -> Result<(SymmetricKey, SymmetricKey), Error> {
    let hkdf = Hkdf::<Sha256>::new(Some(root_key), dh_output.as_bytes());

    let mut output = Zeroizing::new([0u8; 64]);
    hkdf.expand(ROOT_KDF_INFO, output.as_mut_slice())
        .map_err(|_| Error::Crypto("HKDF expansion failed for root key".to_string()))?;

    let mut new_root_key = Zeroizing::new([0u8; 32]);
    let mut chain_key = Zeroizing::new([0u8; 32]);
    new_root_key.copy_from_slice(&output[..32]);
    chain_key.copy_from_slice(&output[32..]);

    Ok((new_root_key, chain_key))
}

fn secret_from_slice(bytes: &[u8]) -> Result<SymmetricKey, Error> {
    if bytes.len() != 32 {
        return Err(Error::Serde(format!(
            "Symmetric key must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(bytes);
    Ok(key)
}

fn chain_to_proto(chain: &Chain) -> ChainProto {
    ChainProto {
        chain_key: chain.chain_key().to_vec(),
        index: chain.index(),
    }
}

fn chain_from_proto(proto: &ChainProto) -> Result<Chain, Error> {
    Ok(Chain::restore(secret_from_slice(&proto.chain_key)?, proto.index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pair(max_skip: u32) -> (DoubleRatchet, DoubleRatchet) {
        let signed_pre_key = X25519Secret::generate().unwrap();
        let ad = [4u8; AD_LEN];

        let alice = DoubleRatchet::initialize_as_initiator(
            X3DHSharedSecret(Zeroizing::new([7u8; 32])),
            &signed_pre_key.public_key(),
            ad,
            max_skip,
        )
        .unwrap();
        let bob = DoubleRatchet::initialize_as_responder(
            X3DHSharedSecret(Zeroizing::new([7u8; 32])),
            signed_pre_key,
            ad,
            max_skip,
        );

        (alice, bob)
    }

    #[test]
    fn test_round_trip_across_ratchet_steps() {
        let (mut alice, mut bob) = pair(1000);

        for round in 0..4u8 {
            for i in 0..3u8 {
                let message = alice.encrypt(&[round, i]).unwrap();
                assert_eq!(bob.decrypt(&message).unwrap(), vec![round, i]);
            }
            let reply = bob.encrypt(&[round]).unwrap();
            assert_eq!(alice.decrypt(&reply).unwrap(), vec![round]);
        }
        assert_eq!(alice.skipped_keys(), 0);
        assert_eq!(bob.skipped_keys(), 0);
    }

    #[test]
    fn test_responder_cannot_send_first() {
        let (_, mut bob) = pair(1000);
        assert!(!bob.can_send());
        assert!(matches!(bob.encrypt(b"early"), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_out_of_order_delivery_and_replay() {
        let (mut alice, mut bob) = pair(1000);
        let messages: Vec<_> = (0..5u8).map(|i| alice.encrypt(&[i]).unwrap()).collect();

        for i in [4usize, 1, 0, 3, 2] {
            assert_eq!(bob.decrypt(&messages[i]).unwrap(), vec![i as u8]);
        }
        assert_eq!(bob.skipped_keys(), 0);

        assert_eq!(
            bob.decrypt(&messages[2]),
            Err(Error::MessageKeyNotCached(2))
        );
    }

    #[test]
    fn test_late_message_from_previous_chain() {
        let (mut alice, mut bob) = pair(1000);
        let first = alice.encrypt(b"first").unwrap();
        let late = alice.encrypt(b"late").unwrap();
        bob.decrypt(&first).unwrap();

        let reply = bob.encrypt(b"reply").unwrap();
        alice.decrypt(&reply).unwrap();
        let after_step = alice.encrypt(b"after step").unwrap();

        assert_eq!(bob.decrypt(&after_step).unwrap(), b"after step");
        assert_eq!(bob.decrypt(&late).unwrap(), b"late");
        assert_eq!(bob.decrypt(&late), Err(Error::MessageKeyNotCached(1)));
    }

    #[test]
    fn test_counter_beyond_skip_window_is_rejected() {
        let (mut alice, mut bob) = pair(10);
        let messages: Vec<_> = (0..12u8).map(|i| alice.encrypt(&[i]).unwrap()).collect();

        assert_eq!(
            bob.decrypt(&messages[11]),
            Err(Error::MessageKeyNotCached(11))
        );
        assert_eq!(bob.skipped_keys(), 0);

        assert_eq!(bob.decrypt(&messages[10]).unwrap(), vec![10]);
        assert_eq!(bob.skipped_keys(), 10);
        assert_eq!(bob.decrypt(&messages[11]).unwrap(), vec![11]);
    }

    #[test]
    fn test_skipped_cache_evicts_oldest() {
        let (mut alice, mut bob) = pair(6);
        let old: Vec<_> = (0..6u8).map(|i| alice.encrypt(&[i]).unwrap()).collect();
        bob.decrypt(&old[5]).unwrap();
        assert_eq!(bob.skipped_keys(), 5);

        let reply = bob.encrypt(b"reply").unwrap();
        alice.decrypt(&reply).unwrap();
        let new: Vec<_> = (0..6u8).map(|i| alice.encrypt(&[i]).unwrap()).collect();
        bob.decrypt(&new[5]).unwrap();

        assert_eq!(bob.skipped_keys(), 6);
        assert_eq!(bob.decrypt(&old[0]), Err(Error::MessageKeyNotCached(0)));
        assert_eq!(bob.decrypt(&old[4]).unwrap(), vec![4]);
        assert_eq!(bob.decrypt(&new[0]).unwrap(), vec![0]);
    }

    #[test]
    fn test_tampering_advances_nothing() {
        let (mut alice, mut bob) = pair(1000);
        let message = alice.encrypt(b"hello").unwrap();

        let mut forged_body = message.clone();
        forged_body.ciphertext[0] ^= 0x01;
        assert_eq!(bob.decrypt(&forged_body), Err(Error::AuthenticationFailed));

        let mut forged_header = message.clone();
        forged_header.header.previous_chain_length = 7;
        assert_eq!(bob.decrypt(&forged_header), Err(Error::AuthenticationFailed));

        assert_eq!(bob.receiving_index(), 0);
        assert_eq!(bob.skipped_keys(), 0);
        assert_eq!(bob.decrypt(&message).unwrap(), b"hello");

        let second = alice.encrypt(b"again").unwrap();
        let mut forged_skipped = second.clone();
        forged_skipped.header.message_number = 5;
        assert_eq!(bob.decrypt(&forged_skipped), Err(Error::AuthenticationFailed));
        assert_eq!(bob.skipped_keys(), 0);
        assert_eq!(bob.decrypt(&second).unwrap(), b"again");
    }

    #[test]
    fn test_forward_secrecy_of_consumed_keys() {
        let (mut alice, mut bob) = pair(1000);
        let first = alice.encrypt(b"n-1").unwrap();
        let second = alice.encrypt(b"n").unwrap();
        bob.decrypt(&first).unwrap();
        bob.decrypt(&second).unwrap();

        // A full copy of the state after message N cannot recover message N-1.
        let mut captured = bob.clone();
        assert_eq!(captured.decrypt(&first), Err(Error::MessageKeyNotCached(0)));
    }

    #[test]
    fn test_post_compromise_healing() {
        let (mut alice, mut bob) = pair(1000);
        bob.decrypt(&alice.encrypt(b"hi").unwrap()).unwrap();
        alice.decrypt(&bob.encrypt(b"hey").unwrap()).unwrap();

        // The attacker learns Bob's root and chain keys but not the ratchet private key.
        let mut attacker = bob.clone();
        attacker.state.dh_pair = X25519Secret::generate().unwrap();

        let after_step = alice.encrypt(b"healed").unwrap();
        assert_eq!(bob.decrypt(&after_step).unwrap(), b"healed");
        assert_eq!(
            attacker.decrypt(&after_step),
            Err(Error::AuthenticationFailed)
        );
    }

    #[test]
    fn test_state_survives_persistence() {
        let (mut alice, mut bob) = pair(1000);
        let messages: Vec<_> = (0..3u8).map(|i| alice.encrypt(&[i]).unwrap()).collect();
        bob.decrypt(&messages[2]).unwrap();

        let mut restored = DoubleRatchet::from_proto(&bob.to_proto()).unwrap();
        assert_eq!(restored.skipped_keys(), 2);
        assert_eq!(restored.decrypt(&messages[0]).unwrap(), vec![0]);

        let reply = restored.encrypt(b"from restored").unwrap();
        assert_eq!(alice.decrypt(&reply).unwrap(), b"from restored");
    }

    proptest! {
        #[test]
        fn prop_any_delivery_order_within_window_decrypts(
            order in Just((0..12usize).collect::<Vec<_>>()).prop_shuffle()
        ) {
            let (mut alice, mut bob) = pair(1000);
            let messages: Vec<_> = (0..12u8).map(|i| alice.encrypt(&[i]).unwrap()).collect();

            for i in order {
                prop_assert_eq!(bob.decrypt(&messages[i]).unwrap(), vec![i as u8]);
            }
            prop_assert_eq!(bob.skipped_keys(), 0);
        }
    }
}
