//! Key bundle publication and discovery.

use crate::keys::{OneTimePreKeyPublic, PublicKeyBundle, PublishedBundle};
use crate::proto::KeyBundleProto;
use crate::types::DeviceId;
use crate::Error;
use async_trait::async_trait;
use prost::Message;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// The relay-side directory of published key bundles.
#[async_trait]
pub trait KeyDirectory: Send + Sync + 'static {
    /// Uploads the public keys of `device`, replacing earlier uploads.
    async fn publish(&self, device: &str, bundle: &PublishedBundle) -> Result<(), Error>;

    /// Returns a bundle with at most one one-time pre-key.
    ///
    /// The directory marks the returned one-time pre-key consumed on issuance.
    async fn fetch(&self, device: &str) -> Result<PublicKeyBundle, Error>;

    /// Confirms that a handshake used `one_time_pre_key_id` of `device`.
    async fn mark_consumed(&self, device: &str, one_time_pre_key_id: u32) -> Result<(), Error>;
}

#[derive(Default)]
struct DeviceEntry {
    /// Encoded bundle without one-time pre-key.
    base: Vec<u8>,
    one_time_pre_keys: VecDeque<OneTimePreKeyPublic>,
    issued: HashSet<u32>,
}

/// In-process [`KeyDirectory`].
///
/// Bundles are kept in their wire encoding. A one-time pre-key is handed out
/// once; republishing does not bring back keys already issued.
#[derive(Default)]
pub struct InMemoryDirectory {
    devices: Mutex<HashMap<DeviceId, DeviceEntry>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// One-time pre-keys still available for `device`.
    pub async fn available_one_time_pre_keys(&self, device: &str) -> usize {
        self.devices
            .lock()
            .await
            .get(device)
            .map_or(0, |entry| entry.one_time_pre_keys.len())
    }
}

#[async_trait]
impl KeyDirectory for InMemoryDirectory {
    async fn publish(&self, device: &str, bundle: &PublishedBundle) -> Result<(), Error> {
        let base = KeyBundleProto::from(&PublicKeyBundle::new(
            bundle.identity,
            bundle.signed_pre_key,
            None,
        ))
        .encode_to_vec();

        let mut devices = self.devices.lock().await;
        let entry = devices.entry(device.to_string()).or_default();
        entry.base = base;
        entry.one_time_pre_keys = bundle
            .one_time_pre_keys
            .iter()
            .filter(|key| !entry.issued.contains(&key.id))
            .copied()
            .collect();

        debug!(
            device,
            signed_pre_key_id = bundle.signed_pre_key.id,
            one_time_pre_keys = entry.one_time_pre_keys.len(),
            "bundle published"
        );
        Ok(())
    }

    async fn fetch(&self, device: &str) -> Result<PublicKeyBundle, Error> {
        let mut devices = self.devices.lock().await;
        let entry = devices
            .get_mut(device)
            .ok_or_else(|| Error::BundleIncomplete(format!("no bundle published for {device}")))?;

        let mut proto = KeyBundleProto::decode(entry.base.as_slice())?;
        let one_time_pre_key = entry.one_time_pre_keys.pop_front();
        match one_time_pre_key {
            Some(key) => {
                entry.issued.insert(key.id);
                proto.one_time_pre_key = Some((&key).into());
            }
            None => warn!(device, "one-time pre-keys exhausted, issuing bundle without one"),
        }

        PublicKeyBundle::try_from(&proto)
    }

    async fn mark_consumed(&self, device: &str, one_time_pre_key_id: u32) -> Result<(), Error> {
        let mut devices = self.devices.lock().await;
        if let Some(entry) = devices.get_mut(device) {
            entry.issued.insert(one_time_pre_key_id);
            entry
                .one_time_pre_keys
                .retain(|key| key.id != one_time_pre_key_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyManager;
    use crate::store::MemoryKeyValueStore;
    use crate::Config;
    use std::sync::Arc;

    async fn published(one_time_pre_keys: usize) -> PublishedBundle {
        let keys = KeyManager::open(Arc::new(MemoryKeyValueStore::new()), Config::default())
            .await
            .unwrap();
        keys.generate_identity().await.unwrap();
        keys.generate_signed_pre_key(0).await.unwrap();
        keys.generate_one_time_pre_keys(one_time_pre_keys).await.unwrap();
        keys.published_bundle().await.unwrap()
    }

    #[tokio::test]
    async fn test_one_time_pre_keys_are_issued_once() {
        let directory = InMemoryDirectory::new();
        let bundle = published(2).await;
        directory.publish("bob", &bundle).await.unwrap();

        let first = directory.fetch("bob").await.unwrap();
        let second = directory.fetch("bob").await.unwrap();
        let third = directory.fetch("bob").await.unwrap();

        first.verify().unwrap();
        assert_ne!(
            first.one_time_pre_key().unwrap().id,
            second.one_time_pre_key().unwrap().id
        );
        assert_eq!(third.one_time_pre_key(), None);
        assert_eq!(third.identity(), bundle.identity);

        // Republishing the same keys does not resurrect issued ones.
        directory.publish("bob", &bundle).await.unwrap();
        assert_eq!(directory.available_one_time_pre_keys("bob").await, 0);
    }

    #[tokio::test]
    async fn test_mark_consumed_withdraws_key() {
        let directory = InMemoryDirectory::new();
        let bundle = published(2).await;
        directory.publish("bob", &bundle).await.unwrap();

        directory
            .mark_consumed("bob", bundle.one_time_pre_keys[0].id)
            .await
            .unwrap();
        let fetched = directory.fetch("bob").await.unwrap();
        assert_eq!(fetched.one_time_pre_key(), Some(bundle.one_time_pre_keys[1]));
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let directory = InMemoryDirectory::new();
        assert!(matches!(
            directory.fetch("nobody").await,
            Err(Error::BundleIncomplete(_))
        ));
    }
}
