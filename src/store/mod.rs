//! Durable, encrypted-at-rest persistence.
//!
//! [`KeyValueStore`] is the blob boundary towards the host's disk.
//! [`TransactionalStore`] layers typed values and per-key atomic
//! read-modify-write on top of it; it is the only mutation path for session
//! and group sender state.

mod memory;
mod sealed;
mod transactional;

pub use memory::MemoryKeyValueStore;
pub use sealed::SealedKeyValueStore;
pub use transactional::TransactionalStore;

use crate::Error;
use async_trait::async_trait;

/// Generic blob store.
///
/// Implementations must make a single `put` atomic: a reader sees either the
/// old or the new value, never a partial one.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Stores `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), Error>;

    /// Loads the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;

    /// Removes `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), Error>;

    /// Flushes buffered writes to durable storage.
    async fn flush(&self) -> Result<(), Error>;
}

/// A value stored through a [`TransactionalStore`] as a protobuf record.
pub trait Persist: Sized + Send {
    /// Protobuf form of the value.
    type Record: prost::Message + Default;

    fn to_record(&self) -> Self::Record;

    fn from_record(record: Self::Record) -> Result<Self, Error>;
}
