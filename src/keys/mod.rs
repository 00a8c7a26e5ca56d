//! Identity, signed pre-key and one-time pre-key lifecycle.

mod bundle;
mod identity_key;
mod manager;
mod one_time_pre_key;
mod signed_pre_key;

pub use bundle::{PublicKeyBundle, PublishedBundle};
pub use identity_key::{IdentityKey, IdentityPublicKey};
pub use manager::KeyManager;
pub use one_time_pre_key::{OneTimePreKey, OneTimePreKeyPublic};
pub use signed_pre_key::{SignedPreKey, SignedPreKeyPublic};
