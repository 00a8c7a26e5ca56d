mod cipher;

mod config;
pub use config::Config;

mod error;
pub use error::Error;

pub mod types;
pub use types::{now, DeviceId, Timestamp, X25519PublicKey};

pub mod proto;

pub mod keys;
pub use keys::{IdentityKey, IdentityPublicKey, KeyManager, PublicKeyBundle, PublishedBundle};

pub mod store;
pub use store::{KeyValueStore, MemoryKeyValueStore, SealedKeyValueStore, TransactionalStore};

pub mod x3dh;
pub use x3dh::{InitiatorHeader, X3DH};

pub mod ratchet;
pub use ratchet::{DoubleRatchet, RatchetMessage};

mod session;
pub use session::{PinnedIdentity, PreKeyMessage, Session, SessionCiphertext, SessionRecord};

pub mod group;
pub use group::{EpochRequest, GroupChannel, GroupKeyEpoch, GroupMessage};

mod envelope;
pub use envelope::{Destination, Envelope, Payload};

pub mod fanout;
pub use fanout::{DeliveryStatus, FanoutCoordinator, QueueEntry, QueueStatus, Transport};

mod directory;
pub use directory::{InMemoryDirectory, KeyDirectory};

mod messenger;
pub use messenger::{Messenger, Received};
