use crate::keys::IdentityPublicKey;
use crate::proto::{
    session_ciphertext_proto, PinnedIdentityProto, PreKeyMessageProto, SessionCiphertextProto,
    SessionProto, SessionRecordProto,
};
use crate::ratchet::{DoubleRatchet, RatchetMessage};
use crate::store::Persist;
use crate::types::{DeviceId, Timestamp, X25519PublicKey};
use crate::x3dh::InitiatorHeader;
use crate::Error;
use prost::Message;
use tracing::debug;

const SCHEMA_VERSION: u32 = 1;
const MAX_PREVIOUS_SESSIONS: usize = 4;

/// A pairwise session with one remote device.
///
/// Sessions are values: they are loaded, advanced and written back inside a
/// single [`TransactionalStore::transact`](crate::store::TransactionalStore::transact)
/// call and never cached elsewhere.
pub struct Session {
    local_device: DeviceId,
    remote_device: DeviceId,
    remote_identity: IdentityPublicKey,
    ratchet: DoubleRatchet,
    /// Set on the initiator until the first reply was decrypted.
    pending_pre_key: Option<InitiatorHeader>,
    /// The initiator's ephemeral key; identifies the handshake.
    base_key: X25519PublicKey,
    created_at: Timestamp,
    last_used_at: Timestamp,
}

impl Session {
    pub(crate) fn new(
        local_device: DeviceId,
        remote_device: DeviceId,
        remote_identity: IdentityPublicKey,
        ratchet: DoubleRatchet,
        pending_pre_key: Option<InitiatorHeader>,
        base_key: X25519PublicKey,
        now: Timestamp,
    ) -> Self {
        Self {
            local_device,
            remote_device,
            remote_identity,
            ratchet,
            pending_pre_key,
            base_key,
            created_at: now,
            last_used_at: now,
        }
    }

    /// Store key of the session between two devices.
    pub fn storage_key(local_device: &str, remote_device: &str) -> String {
        format!("{local_device}/{remote_device}")
    }

    pub fn local_device(&self) -> &str {
        &self.local_device
    }

    pub fn remote_device(&self) -> &str {
        &self.remote_device
    }

    pub fn remote_identity(&self) -> IdentityPublicKey {
        self.remote_identity
    }

    pub fn base_key(&self) -> X25519PublicKey {
        self.base_key
    }

    pub fn has_pending_pre_key(&self) -> bool {
        self.pending_pre_key.is_some()
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn last_used_at(&self) -> Timestamp {
        self.last_used_at
    }

    pub fn ratchet(&self) -> &DoubleRatchet {
        &self.ratchet
    }

    pub fn encrypt(&mut self, plaintext: &[u8], now: Timestamp) -> Result<SessionCiphertext, Error> {
        let message = self.ratchet.encrypt(plaintext)?;
        self.last_used_at = now;

        Ok(match self.pending_pre_key {
            Some(header) => SessionCiphertext::PreKey(PreKeyMessage { header, message }),
            None => SessionCiphertext::Ratchet(message),
        })
    }

    /// Decrypts a ratchet message. The first success ends the pre-key phase.
    pub fn decrypt(&mut self, message: &RatchetMessage, now: Timestamp) -> Result<Vec<u8>, Error> {
        let plaintext = self.ratchet.decrypt(message)?;
        self.pending_pre_key = None;
        self.last_used_at = now;
        Ok(plaintext)
    }
}

impl Persist for Session {
    type Record = SessionProto;

    fn to_record(&self) -> SessionProto {
        SessionProto {
            version: SCHEMA_VERSION,
            local_device: self.local_device.clone(),
            remote_device: self.remote_device.clone(),
            remote_identity: Some((&self.remote_identity).into()),
            ratchet: Some(self.ratchet.to_proto()),
            pending_pre_key: self.pending_pre_key.as_ref().map(Into::into),
            base_key: self.base_key.to_bytes().to_vec(),
            created_at: self.created_at,
            last_used_at: self.last_used_at,
        }
    }

    fn from_record(record: SessionProto) -> Result<Self, Error> {
        if record.version != SCHEMA_VERSION {
            return Err(Error::Serde(format!(
                "unsupported session version {}",
                record.version
            )));
        }
        let remote_identity = record
            .remote_identity
            .as_ref()
            .ok_or_else(|| Error::Serde("session without remote identity".to_string()))?;
        let ratchet = record
            .ratchet
            .as_ref()
            .ok_or_else(|| Error::Serde("session without ratchet state".to_string()))?;

        Ok(Self {
            local_device: record.local_device,
            remote_device: record.remote_device,
            remote_identity: IdentityPublicKey::try_from(remote_identity)?,
            ratchet: DoubleRatchet::from_proto(ratchet)?,
            pending_pre_key: record
                .pending_pre_key
                .as_ref()
                .map(InitiatorHeader::try_from)
                .transpose()?,
            base_key: X25519PublicKey::from_slice(&record.base_key)?,
            created_at: record.created_at,
            last_used_at: record.last_used_at,
        })
    }
}

/// All sessions held with one peer: the current one, used for sending, and a
/// few superseded ones that still decrypt messages sent before the switch.
///
/// A session is only ever superseded, never dropped, by a new handshake.
/// Deletion takes an explicit reset.
pub struct SessionRecord {
    current: Session,
    /// Most recently superseded first.
    previous: Vec<Session>,
}

impl SessionRecord {
    pub fn new(session: Session) -> Self {
        Self {
            current: session,
            previous: Vec::new(),
        }
    }

    pub fn current(&self) -> &Session {
        &self.current
    }

    pub fn previous(&self) -> &[Session] {
        &self.previous
    }

    pub fn encrypt(&mut self, plaintext: &[u8], now: Timestamp) -> Result<SessionCiphertext, Error> {
        self.current.encrypt(plaintext, now)
    }

    /// Decrypts with the current session, falling back to the superseded
    /// ones. The current session stays current either way.
    ///
    /// On failure the error of the current session is returned.
    pub fn decrypt(&mut self, message: &RatchetMessage, now: Timestamp) -> Result<Vec<u8>, Error> {
        let err = match self.current.decrypt(message, now) {
            Ok(plaintext) => return Ok(plaintext),
            Err(err) => err,
        };
        for session in &mut self.previous {
            if let Ok(plaintext) = session.decrypt(message, now) {
                debug!(remote_device = %session.remote_device, "decrypted with a superseded session");
                return Ok(plaintext);
            }
        }
        Err(err)
    }

    /// The session of the handshake identified by `base_key`, current or superseded.
    pub fn session_mut(&mut self, base_key: &X25519PublicKey) -> Option<&mut Session> {
        std::iter::once(&mut self.current)
            .chain(self.previous.iter_mut())
            .find(|session| session.base_key == *base_key)
    }

    /// Takes in the responder session of a handshake the peer started while
    /// this record already existed. Returns whether it became current.
    ///
    /// When both sides initiated at once and neither has heard back, each
    /// keeps the handshake with the lower base key current and holds the other
    /// as superseded, so both converge on the same session without losing a
    /// message. Otherwise the peer started over and its handshake wins.
    pub fn adopt(&mut self, incoming: Session) -> bool {
        let keep_ours = self.current.has_pending_pre_key()
            && self.current.base_key.as_bytes() < incoming.base_key.as_bytes();
        if keep_ours {
            self.supersede(incoming);
            return false;
        }
        let replaced = std::mem::replace(&mut self.current, incoming);
        self.supersede(replaced);
        true
    }

    fn supersede(&mut self, session: Session) {
        self.previous.insert(0, session);
        self.previous.truncate(MAX_PREVIOUS_SESSIONS);
    }
}

impl Persist for SessionRecord {
    type Record = SessionRecordProto;

    fn to_record(&self) -> SessionRecordProto {
        SessionRecordProto {
            current: Some(self.current.to_record()),
            previous: self.previous.iter().map(Session::to_record).collect(),
        }
    }

    fn from_record(record: SessionRecordProto) -> Result<Self, Error> {
        let current = record
            .current
            .ok_or_else(|| Error::Serde("session record without current session".to_string()))?;
        Ok(Self {
            current: Session::from_record(current)?,
            previous: record
                .previous
                .into_iter()
                .map(Session::from_record)
                .collect::<Result<_, _>>()?,
        })
    }
}

/// First messages of an initiator: the handshake header plus a ratchet message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreKeyMessage {
    pub header: InitiatorHeader,
    pub message: RatchetMessage,
}

impl From<&PreKeyMessage> for PreKeyMessageProto {
    fn from(value: &PreKeyMessage) -> Self {
        Self {
            header: Some((&value.header).into()),
            message: value.message.to_bytes(),
        }
    }
}

impl TryFrom<&PreKeyMessageProto> for PreKeyMessage {
    type Error = Error;

    fn try_from(value: &PreKeyMessageProto) -> Result<Self, Self::Error> {
        let header = value
            .header
            .as_ref()
            .ok_or_else(|| Error::Protocol("pre-key message without header".to_string()))?;

        Ok(Self {
            header: InitiatorHeader::try_from(header)?,
            message: RatchetMessage::from_bytes(&value.message)?,
        })
    }
}

/// Output of [`Session::encrypt`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionCiphertext {
    PreKey(PreKeyMessage),
    Ratchet(RatchetMessage),
}

impl SessionCiphertext {
    pub fn message(&self) -> &RatchetMessage {
        match self {
            Self::PreKey(pre_key) => &pre_key.message,
            Self::Ratchet(message) => message,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let kind = match self {
            Self::PreKey(pre_key) => session_ciphertext_proto::Kind::PreKey(pre_key.into()),
            Self::Ratchet(message) => session_ciphertext_proto::Kind::Ratchet(message.to_bytes()),
        };
        SessionCiphertextProto { kind: Some(kind) }.encode_to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let proto = SessionCiphertextProto::decode(bytes)?;
        match proto.kind {
            Some(session_ciphertext_proto::Kind::PreKey(pre_key)) => {
                Ok(Self::PreKey(PreKeyMessage::try_from(&pre_key)?))
            }
            Some(session_ciphertext_proto::Kind::Ratchet(bytes)) => {
                Ok(Self::Ratchet(RatchetMessage::from_bytes(&bytes)?))
            }
            None => Err(Error::Protocol("empty session ciphertext".to_string())),
        }
    }
}

/// Trust-on-first-use record of a peer's identity key.
///
/// A different key seen later is parked in `pending` until approved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PinnedIdentity {
    pub trusted: IdentityPublicKey,
    pub pending: Option<IdentityPublicKey>,
}

impl PinnedIdentity {
    pub fn new(trusted: IdentityPublicKey) -> Self {
        Self {
            trusted,
            pending: None,
        }
    }

    /// Compares `seen` against the pinned key, remembering a mismatch.
    pub fn check(&mut self, peer: &str, seen: &IdentityPublicKey) -> Result<(), Error> {
        if self.trusted == *seen {
            return Ok(());
        }
        self.pending = Some(*seen);
        Err(Error::IdentityKeyChanged(peer.to_string()))
    }

    /// Trusts the pending key. Returns whether anything changed.
    pub fn approve(&mut self) -> bool {
        match self.pending.take() {
            Some(pending) => {
                self.trusted = pending;
                true
            }
            None => false,
        }
    }
}

impl Persist for PinnedIdentity {
    type Record = PinnedIdentityProto;

    fn to_record(&self) -> PinnedIdentityProto {
        PinnedIdentityProto {
            trusted: Some((&self.trusted).into()),
            pending: self.pending.as_ref().map(Into::into),
        }
    }

    fn from_record(record: PinnedIdentityProto) -> Result<Self, Error> {
        let trusted = record
            .trusted
            .as_ref()
            .ok_or_else(|| Error::Serde("pinned identity without trusted key".to_string()))?;
        Ok(Self {
            trusted: IdentityPublicKey::try_from(trusted)?,
            pending: record
                .pending
                .as_ref()
                .map(IdentityPublicKey::try_from)
                .transpose()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{IdentityKey, KeyManager, PublicKeyBundle};
    use crate::store::MemoryKeyValueStore;
    use crate::x3dh::{establish_as_initiator, establish_as_responder, X3DH};
    use crate::Config;
    use std::sync::Arc;

    async fn create_session_pair() -> (Session, Session) {
        let store = Arc::new(MemoryKeyValueStore::new());
        let bob_keys = KeyManager::open(store, Config::default()).await.unwrap();
        bob_keys.generate_identity().await.unwrap();
        bob_keys.generate_signed_pre_key(0).await.unwrap();
        bob_keys.generate_one_time_pre_keys(1).await.unwrap();

        let published = bob_keys.published_bundle().await.unwrap();
        let mut bundle = PublicKeyBundle::new(
            published.identity,
            published.signed_pre_key,
            published.one_time_pre_keys.first().copied(),
        );

        let x3dh = X3DH::new(b"Test-Session-Protocol");
        let alice_identity = IdentityKey::generate().unwrap();
        let (alice, header) =
            establish_as_initiator(&x3dh, &alice_identity, "alice", "bob", &mut bundle, 100, 1)
                .unwrap();
        let bob = establish_as_responder(&x3dh, &bob_keys, "bob", "alice", &header, 100, 1)
            .await
            .unwrap();
        (alice, bob)
    }

    #[tokio::test]
    async fn test_session_basic_communication() {
        let (mut alice, mut bob) = create_session_pair().await;
        assert_eq!(alice.base_key(), bob.base_key());

        let message = "Hello Bob, this is a secure message!";
        let encrypted = alice.encrypt(message.as_bytes(), 2).unwrap();
        assert!(matches!(encrypted, SessionCiphertext::PreKey(_)));

        let decrypted = bob.decrypt(encrypted.message(), 2).unwrap();
        assert_eq!(String::from_utf8(decrypted).unwrap(), message);

        let response = "Hello Alice, I received your message!";
        let encrypted_response = bob.encrypt(response.as_bytes(), 3).unwrap();
        assert!(matches!(encrypted_response, SessionCiphertext::Ratchet(_)));

        let decrypted_response = alice.decrypt(encrypted_response.message(), 3).unwrap();
        assert_eq!(String::from_utf8(decrypted_response).unwrap(), response);
        assert_eq!(alice.last_used_at(), 3);
    }

    #[tokio::test]
    async fn test_pre_key_phase_ends_with_first_reply() {
        let (mut alice, mut bob) = create_session_pair().await;

        for i in 0..3 {
            let ciphertext = alice.encrypt(format!("early {i}").as_bytes(), 1).unwrap();
            assert!(matches!(ciphertext, SessionCiphertext::PreKey(_)));
            bob.decrypt(ciphertext.message(), 1).unwrap();
        }

        let reply = bob.encrypt(b"reply", 2).unwrap();
        alice.decrypt(reply.message(), 2).unwrap();
        assert!(!alice.has_pending_pre_key());
        assert!(matches!(
            alice.encrypt(b"later", 3).unwrap(),
            SessionCiphertext::Ratchet(_)
        ));
    }

    #[tokio::test]
    async fn test_failed_decrypt_keeps_pre_key_phase() {
        let (mut alice, mut bob) = create_session_pair().await;
        let first = alice.encrypt(b"hi", 1).unwrap();
        bob.decrypt(first.message(), 1).unwrap();

        let mut reply = bob.encrypt(b"reply", 2).unwrap().message().clone();
        reply.ciphertext[0] ^= 1;

        assert_eq!(alice.decrypt(&reply, 2), Err(Error::AuthenticationFailed));
        assert!(alice.has_pending_pre_key());
    }

    #[tokio::test]
    async fn test_session_survives_record_round_trip() {
        let (mut alice, bob) = create_session_pair().await;
        let first = alice.encrypt(b"first", 1).unwrap();

        let mut restored = Session::from_record(bob.to_record()).unwrap();
        assert_eq!(restored.remote_device(), "alice");
        assert_eq!(restored.remote_identity(), bob.remote_identity());
        assert_eq!(restored.base_key(), alice.base_key());
        assert_eq!(restored.decrypt(first.message(), 2).unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_superseded_session_still_decrypts() {
        let (mut old_alice, old_bob) = create_session_pair().await;
        let (mut new_alice, new_bob) = create_session_pair().await;
        let in_flight = old_alice.encrypt(b"sent before the switch", 1).unwrap();

        let mut record = SessionRecord::new(old_bob);
        assert!(!record.current().has_pending_pre_key());
        assert!(record.adopt(new_bob));
        assert_eq!(record.current().base_key(), new_alice.base_key());
        assert_eq!(record.previous().len(), 1);

        let mut record = SessionRecord::from_record(record.to_record()).unwrap();
        assert_eq!(record.decrypt(in_flight.message(), 2).unwrap(), b"sent before the switch");
        let fresh = new_alice.encrypt(b"fresh", 3).unwrap();
        assert_eq!(record.decrypt(fresh.message(), 3).unwrap(), b"fresh");
        assert_eq!(record.current().base_key(), new_alice.base_key());
        assert!(record.session_mut(&old_alice.base_key()).is_some());
    }

    #[tokio::test]
    async fn test_simultaneous_handshakes_keep_the_lower_base_key() {
        let (alice, _) = create_session_pair().await;
        let (_, incoming) = create_session_pair().await;
        let ours = alice.base_key();
        let theirs = incoming.base_key();

        let mut record = SessionRecord::new(alice);
        let adopted = record.adopt(incoming);
        assert_eq!(adopted, theirs.as_bytes() < ours.as_bytes());

        let current = record.current().base_key();
        let lower = if ours.as_bytes() < theirs.as_bytes() { ours } else { theirs };
        assert_eq!(current, lower);
        assert_eq!(record.previous().len(), 1);
    }

    #[test]
    fn test_ciphertext_wire_form() {
        let bytes = SessionCiphertextProto { kind: None }.encode_to_vec();
        assert!(matches!(
            SessionCiphertext::from_bytes(&bytes),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            SessionCiphertext::from_bytes(&[0xff, 0xff]),
            Err(Error::Serde(_))
        ));
    }

    #[test]
    fn test_pinned_identity_requires_approval() {
        let first = IdentityKey::generate().unwrap().public_key();
        let second = IdentityKey::generate().unwrap().public_key();
        let mut pin = PinnedIdentity::new(first);

        assert!(pin.check("bob", &first).is_ok());
        assert_eq!(
            pin.check("bob", &second),
            Err(Error::IdentityKeyChanged("bob".to_string()))
        );
        assert_eq!(pin.pending, Some(second));

        let restored = PinnedIdentity::from_record(pin.to_record()).unwrap();
        assert_eq!(restored, pin);

        assert!(pin.approve());
        assert_eq!(pin.trusted, second);
        assert!(pin.check("bob", &second).is_ok());
        assert!(!pin.approve());
    }
}
