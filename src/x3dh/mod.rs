//! X3DH (Extended Triple Diffie-Hellman) session establishment.

use crate::keys::{IdentityKey, IdentityPublicKey, KeyManager, PublicKeyBundle};
use crate::proto::InitiatorHeaderProto;
use crate::ratchet::{AD_LEN, DoubleRatchet};
use crate::session::Session;
use crate::store::KeyValueStore;
use crate::types::{DeviceId, SymmetricKey, Timestamp, X25519PublicKey, X25519Secret};
use crate::Error;
use hkdf::Hkdf;
use sha2::Sha256;
use tracing::{debug, info, warn};
use x25519_dalek::SharedSecret;
use zeroize::Zeroizing;

const SALT: &[u8] = b"Hushwire-X3DH-Salt";

/// A shared secret derived from X3DH key agreement.
pub struct X3DHSharedSecret(pub(crate) SymmetricKey);

/// What the responder needs to repeat the initiator's DH computations.
///
/// Sent in front of every initiator message until the responder answers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InitiatorHeader {
    pub identity: IdentityPublicKey,
    pub ephemeral_key: X25519PublicKey,
    pub signed_pre_key_id: u32,
    pub one_time_pre_key_id: Option<u32>,
}

impl From<&InitiatorHeader> for InitiatorHeaderProto {
    fn from(value: &InitiatorHeader) -> Self {
        Self {
            identity: Some((&value.identity).into()),
            ephemeral_key: value.ephemeral_key.to_bytes().to_vec(),
            signed_pre_key_id: value.signed_pre_key_id,
            one_time_pre_key_id: value.one_time_pre_key_id,
        }
    }
}

impl TryFrom<&InitiatorHeaderProto> for InitiatorHeader {
    type Error = Error;

    fn try_from(value: &InitiatorHeaderProto) -> Result<Self, Self::Error> {
        let identity = value
            .identity
            .as_ref()
            .ok_or_else(|| Error::Protocol("initiator header without identity".to_string()))?;

        Ok(Self {
            identity: IdentityPublicKey::try_from(identity)?,
            ephemeral_key: X25519PublicKey::from_slice(&value.ephemeral_key)?,
            signed_pre_key_id: value.signed_pre_key_id,
            one_time_pre_key_id: value.one_time_pre_key_id,
        })
    }
}

/// The X3DH key agreement.
///
/// The info string separates the derived secrets of different applications
/// even when the same keys are involved.
pub struct X3DH {
    info: Vec<u8>,
}

impl X3DH {
    pub fn new(info: &[u8]) -> Self {
        Self {
            info: info.to_vec(),
        }
    }

    /// Initiator side against a peer's bundle.
    ///
    /// 1. Verifies the signed pre-key signature
    /// 2. Takes the one-time pre-key out of the bundle, if any
    /// 3. Generates the ephemeral key pair and performs the DH computations
    /// 4. Derives the shared secret and deletes the ephemeral private key
    pub fn initiate(
        &self,
        local_identity: &IdentityKey,
        bundle: &mut PublicKeyBundle,
    ) -> Result<(X3DHSharedSecret, InitiatorHeader), Error> {
        bundle.verify()?;
        let one_time_pre_key = bundle.take_one_time_pre_key()?;
        let signed_pre_key = bundle.signed_pre_key();

        let ephemeral = X25519Secret::generate()?;

        // DH1 = DH(IKa, SPKb)
        let dh1 = local_identity.dh(&signed_pre_key.public_key);
        // DH2 = DH(EKa, IKb)
        let dh2 = ephemeral.dh(&bundle.identity().dh_key());
        // DH3 = DH(EKa, SPKb)
        let dh3 = ephemeral.dh(&signed_pre_key.public_key);
        // DH4 = DH(EKa, OPKb)
        let dh4 = one_time_pre_key.map(|key| ephemeral.dh(&key.public_key));

        let shared_secret = self.calculate_shared_secret(dh1, dh2, dh3, dh4)?;
        let header = InitiatorHeader {
            identity: local_identity.public_key(),
            ephemeral_key: ephemeral.public_key(),
            signed_pre_key_id: signed_pre_key.id,
            one_time_pre_key_id: one_time_pre_key.map(|key| key.id),
        };
        drop(ephemeral);

        if header.one_time_pre_key_id.is_none() {
            warn!("bundle has no one-time pre-key; handshake relies on the signed pre-key only");
        }
        Ok((shared_secret, header))
    }

    /// Responder side: the same DH computations from the received header and
    /// the local private keys. No ephemeral key is generated here.
    pub fn respond(
        &self,
        local_identity: &IdentityKey,
        signed_pre_key: &X25519Secret,
        one_time_pre_key: Option<X25519Secret>,
        header: &InitiatorHeader,
    ) -> Result<X3DHSharedSecret, Error> {
        // DH1 = DH(SPKb, IKa)
        let dh1 = signed_pre_key.dh(&header.identity.dh_key());
        // DH2 = DH(IKb, EKa)
        let dh2 = local_identity.dh(&header.ephemeral_key);
        // DH3 = DH(SPKb, EKa)
        let dh3 = signed_pre_key.dh(&header.ephemeral_key);
        // DH4 = DH(OPKb, EKa)
        let dh4 = one_time_pre_key.map(|key| key.dh(&header.ephemeral_key));

        self.calculate_shared_secret(dh1, dh2, dh3, dh4)
    }

    fn calculate_shared_secret(
        &self,
        dh1: SharedSecret,
        dh2: SharedSecret,
        dh3: SharedSecret,
        dh4: Option<SharedSecret>,
    ) -> Result<X3DHSharedSecret, Error> {
        // IKM = DH1 || DH2 || DH3 || DH4 (if available)
        let mut key_material = Zeroizing::new(Vec::with_capacity(128));
        key_material.extend_from_slice(dh1.as_bytes());
        key_material.extend_from_slice(dh2.as_bytes());
        key_material.extend_from_slice(dh3.as_bytes());
        if let Some(dh4) = dh4 {
            key_material.extend_from_slice(dh4.as_bytes());
        }

        let hkdf = Hkdf::<Sha256>::new(Some(SALT), &key_material);

        let mut shared_secret = Zeroizing::new([0u8; 32]);
        hkdf.expand(&self.info, shared_secret.as_mut_slice())
            .map_err(|_| Error::Crypto("HKDF expansion failed".to_string()))?;

        Ok(X3DHSharedSecret(shared_secret))
    }
}

/// Session associated data: initiator identity || responder identity.
pub fn associated_data(
    initiator: &IdentityPublicKey,
    responder: &IdentityPublicKey,
) -> [u8; AD_LEN] {
    let mut ad = [0u8; AD_LEN];
    ad[..32].copy_from_slice(initiator.dh_key().as_bytes());
    ad[32..].copy_from_slice(responder.dh_key().as_bytes());
    ad
}

/// Runs the initiator handshake against `bundle` and builds the session.
///
/// The returned header names the consumed one-time pre-key, which the caller
/// reports to the key directory.
pub fn establish_as_initiator(
    x3dh: &X3DH,
    local_identity: &IdentityKey,
    local_device: &str,
    remote_device: &str,
    bundle: &mut PublicKeyBundle,
    max_skip: u32,
    now: Timestamp,
) -> Result<(Session, InitiatorHeader), Error> {
    let (shared_secret, header) = x3dh.initiate(local_identity, bundle)?;
    let ad = associated_data(&local_identity.public_key(), &bundle.identity());
    let ratchet = DoubleRatchet::initialize_as_initiator(
        shared_secret,
        &bundle.signed_pre_key().public_key,
        ad,
        max_skip,
    )?;

    info!(
        remote_device,
        signed_pre_key_id = header.signed_pre_key_id,
        one_time_pre_key_id = ?header.one_time_pre_key_id,
        "session established as initiator"
    );
    let session = Session::new(
        DeviceId::from(local_device),
        DeviceId::from(remote_device),
        bundle.identity(),
        ratchet,
        Some(header),
        header.ephemeral_key,
        now,
    );
    Ok((session, header))
}

/// Runs the responder handshake for a received initiator header.
///
/// The referenced one-time pre-key is consumed through the key manager's
/// compare-and-swap before any DH is computed; of two concurrent handshakes
/// naming the same key, only one gets past this point.
pub async fn establish_as_responder<S: KeyValueStore>(
    x3dh: &X3DH,
    keys: &KeyManager<S>,
    local_device: &str,
    remote_device: &str,
    header: &InitiatorHeader,
    max_skip: u32,
    now: Timestamp,
) -> Result<Session, Error> {
    let signed_pre_key = keys.signed_pre_key(header.signed_pre_key_id).await?;
    let one_time_pre_key = match header.one_time_pre_key_id {
        Some(id) => Some(keys.consume_one_time_pre_key(id).await?),
        None => None,
    };
    let session = responder_session(
        x3dh,
        keys,
        local_device,
        remote_device,
        header,
        signed_pre_key,
        one_time_pre_key,
        max_skip,
        now,
    )
    .await?;

    debug!(
        remote_device,
        signed_pre_key_id = header.signed_pre_key_id,
        one_time_pre_key_id = ?header.one_time_pre_key_id,
        "session established as responder"
    );
    Ok(session)
}

/// Builds the responder session without consuming the one-time pre-key.
///
/// Used to authenticate a pre-key message before anything about it is
/// committed. The result must be thrown away; a session that is kept comes
/// from [`establish_as_responder`].
pub async fn preview_responder_session<S: KeyValueStore>(
    x3dh: &X3DH,
    keys: &KeyManager<S>,
    local_device: &str,
    remote_device: &str,
    header: &InitiatorHeader,
    max_skip: u32,
    now: Timestamp,
) -> Result<Session, Error> {
    let signed_pre_key = keys.signed_pre_key(header.signed_pre_key_id).await?;
    let one_time_pre_key = match header.one_time_pre_key_id {
        Some(id) => Some(keys.peek_one_time_pre_key(id).await?),
        None => None,
    };
    responder_session(
        x3dh,
        keys,
        local_device,
        remote_device,
        header,
        signed_pre_key,
        one_time_pre_key,
        max_skip,
        now,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn responder_session<S: KeyValueStore>(
    x3dh: &X3DH,
    keys: &KeyManager<S>,
    local_device: &str,
    remote_device: &str,
    header: &InitiatorHeader,
    signed_pre_key: X25519Secret,
    one_time_pre_key: Option<X25519Secret>,
    max_skip: u32,
    now: Timestamp,
) -> Result<Session, Error> {
    let local_identity = keys.identity().await?;

    let shared_secret = x3dh.respond(&local_identity, &signed_pre_key, one_time_pre_key, header)?;
    let ad = associated_data(&header.identity, &local_identity.public_key());
    let ratchet = DoubleRatchet::initialize_as_responder(shared_secret, signed_pre_key, ad, max_skip);

    Ok(Session::new(
        DeviceId::from(local_device),
        DeviceId::from(remote_device),
        header.identity,
        ratchet,
        None,
        header.ephemeral_key,
        now,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{OneTimePreKey, SignedPreKey};

    struct Responder {
        identity: IdentityKey,
        signed_pre_key: SignedPreKey,
        one_time_pre_key: OneTimePreKey,
    }

    impl Responder {
        fn new() -> Self {
            let identity = IdentityKey::generate().unwrap();
            Self {
                signed_pre_key: SignedPreKey::generate(1, &identity, 0).unwrap(),
                one_time_pre_key: OneTimePreKey::generate(1).unwrap(),
                identity,
            }
        }

        fn bundle(&self, with_one_time_pre_key: bool) -> PublicKeyBundle {
            PublicKeyBundle::new(
                self.identity.public_key(),
                self.signed_pre_key.to_public(),
                with_one_time_pre_key.then(|| self.one_time_pre_key.to_public()),
            )
        }
    }

    #[test]
    fn test_x3dh_key_agreement() {
        let alice = IdentityKey::generate().unwrap();
        let mut bob = Responder::new();
        let x3dh = X3DH::new(b"Test-Protocol-Info");

        let (alice_secret, header) = x3dh.initiate(&alice, &mut bob.bundle(true)).unwrap();
        assert_eq!(header.one_time_pre_key_id, Some(1));
        assert_eq!(header.identity, alice.public_key());

        let bob_secret = x3dh
            .respond(
                &bob.identity,
                &bob.signed_pre_key.secret(),
                Some(bob.one_time_pre_key.consume().unwrap()),
                &header,
            )
            .unwrap();

        assert_eq!(*alice_secret.0, *bob_secret.0);
    }

    #[test]
    fn test_x3dh_agreement_without_one_time_key() {
        let alice = IdentityKey::generate().unwrap();
        let bob = Responder::new();
        let x3dh = X3DH::new(b"Test-Protocol-Info");

        let (alice_secret, header) = x3dh.initiate(&alice, &mut bob.bundle(false)).unwrap();
        assert_eq!(header.one_time_pre_key_id, None);

        let bob_secret = x3dh
            .respond(&bob.identity, &bob.signed_pre_key.secret(), None, &header)
            .unwrap();
        assert_eq!(*alice_secret.0, *bob_secret.0);

        // Omitting DH4 on one side only breaks the agreement.
        let mismatched = x3dh
            .respond(
                &bob.identity,
                &bob.signed_pre_key.secret(),
                Some(X25519Secret::generate().unwrap()),
                &header,
            )
            .unwrap();
        assert_ne!(*alice_secret.0, *mismatched.0);
    }

    #[test]
    fn test_info_separates_domains() {
        let alice = IdentityKey::generate().unwrap();
        let bob = Responder::new();

        let (first, header) = X3DH::new(b"Protocol-Info-1")
            .initiate(&alice, &mut bob.bundle(false))
            .unwrap();
        let second = X3DH::new(b"Protocol-Info-2")
            .respond(&bob.identity, &bob.signed_pre_key.secret(), None, &header)
            .unwrap();
        assert_ne!(*first.0, *second.0);
    }

    #[test]
    fn test_invalid_signature_aborts_before_touching_bundle() {
        let alice = IdentityKey::generate().unwrap();
        let bob = Responder::new();
        let mut bundle = PublicKeyBundle::new(
            IdentityKey::generate().unwrap().public_key(),
            bob.signed_pre_key.to_public(),
            Some(bob.one_time_pre_key.to_public()),
        );

        let result = X3DH::new(b"info").initiate(&alice, &mut bundle);
        assert!(matches!(result, Err(Error::InvalidSignature)));
        assert!(!bundle.is_spent());
    }

    #[test]
    fn test_spent_bundle_is_incomplete() {
        let alice = IdentityKey::generate().unwrap();
        let bob = Responder::new();
        let x3dh = X3DH::new(b"info");
        let mut bundle = bob.bundle(true);

        x3dh.initiate(&alice, &mut bundle).unwrap();
        assert!(matches!(
            x3dh.initiate(&alice, &mut bundle),
            Err(Error::BundleIncomplete(_))
        ));
    }

    #[test]
    fn test_associated_data_orders_initiator_first() {
        let alice = IdentityKey::generate().unwrap().public_key();
        let bob = IdentityKey::generate().unwrap().public_key();

        let ad = associated_data(&alice, &bob);
        assert_eq!(&ad[..32], alice.dh_key().as_bytes());
        assert_eq!(&ad[32..], bob.dh_key().as_bytes());
        assert_ne!(ad, associated_data(&bob, &alice));
    }
}
