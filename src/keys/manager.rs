use crate::config::Config;
use crate::keys::{
    IdentityKey, IdentityPublicKey, OneTimePreKey, OneTimePreKeyPublic, PublishedBundle,
    SignedPreKey, SignedPreKeyPublic,
};
use crate::proto::KeyMaterialProto;
use crate::store::KeyValueStore;
use crate::types::{Timestamp, X25519Secret};
use crate::Error;
use prost::Message;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const STORAGE_KEY: &str = "keys/material";
const SCHEMA_VERSION: u32 = 1;

#[derive(Default)]
struct KeyMaterial {
    identity: Option<IdentityKey>,
    signed_pre_keys: BTreeMap<u32, SignedPreKey>,
    current_signed_pre_key: Option<u32>,
    one_time_pre_keys: BTreeMap<u32, OneTimePreKey>,
    next_signed_pre_key_id: u32,
    next_one_time_pre_key_id: u32,
}

impl KeyMaterial {
    fn identity(&self) -> Result<&IdentityKey, Error> {
        self.identity
            .as_ref()
            .ok_or_else(|| Error::Protocol("no identity key generated yet".to_string()))
    }

    fn current_signed_pre_key(&self) -> Result<&SignedPreKey, Error> {
        self.current_signed_pre_key
            .and_then(|id| self.signed_pre_keys.get(&id))
            .ok_or_else(|| Error::Protocol("no signed pre-key generated yet".to_string()))
    }

    fn available_one_time_pre_keys(&self) -> usize {
        self.one_time_pre_keys
            .values()
            .filter(|key| !key.is_consumed())
            .count()
    }

    fn to_proto(&self) -> KeyMaterialProto {
        KeyMaterialProto {
            version: SCHEMA_VERSION,
            identity: self
                .identity
                .as_ref()
                .map(|identity| identity.to_bytes().to_vec())
                .unwrap_or_default(),
            signed_pre_keys: self
                .signed_pre_keys
                .values()
                .map(SignedPreKey::to_record)
                .collect(),
            one_time_pre_keys: self
                .one_time_pre_keys
                .values()
                .map(OneTimePreKey::to_record)
                .collect(),
            current_signed_pre_key_id: self.current_signed_pre_key,
            next_signed_pre_key_id: self.next_signed_pre_key_id,
            next_one_time_pre_key_id: self.next_one_time_pre_key_id,
        }
    }

    fn from_proto(proto: &KeyMaterialProto) -> Result<Self, Error> {
        if proto.version != SCHEMA_VERSION {
            return Err(Error::Serde(format!(
                "Unsupported key material version: {}",
                proto.version
            )));
        }

        let identity = if proto.identity.is_empty() {
            None
        } else {
            Some(IdentityKey::from_bytes(&proto.identity)?)
        };

        let mut signed_pre_keys = BTreeMap::new();
        for record in &proto.signed_pre_keys {
            signed_pre_keys.insert(record.id, SignedPreKey::from_record(record)?);
        }

        let mut one_time_pre_keys = BTreeMap::new();
        for record in &proto.one_time_pre_keys {
            one_time_pre_keys.insert(record.id, OneTimePreKey::from_record(record)?);
        }

        Ok(Self {
            identity,
            signed_pre_keys,
            current_signed_pre_key: proto.current_signed_pre_key_id,
            one_time_pre_keys,
            next_signed_pre_key_id: proto.next_signed_pre_key_id,
            next_one_time_pre_key_id: proto.next_one_time_pre_key_id,
        })
    }
}

/// Owner of the device's private key material.
///
/// Every generated private key is written to the store before the method that
/// created it returns, so nothing can be published that is not yet durable.
/// When the write fails the in-memory change is rolled back and the error is
/// returned.
pub struct KeyManager<S> {
    store: Arc<S>,
    config: Config,
    material: Mutex<KeyMaterial>,
}

impl<S: KeyValueStore> KeyManager<S> {
    /// Loads previously persisted key material, or starts empty.
    pub async fn open(store: Arc<S>, config: Config) -> Result<Self, Error> {
        let material = match store.get(STORAGE_KEY).await? {
            Some(bytes) => KeyMaterial::from_proto(&KeyMaterialProto::decode(bytes.as_slice())?)?,
            None => KeyMaterial {
                next_signed_pre_key_id: 1,
                next_one_time_pre_key_id: 1,
                ..Default::default()
            },
        };

        Ok(Self {
            store,
            config,
            material: Mutex::new(material),
        })
    }

    /// Generates the long-term identity key.
    ///
    /// Fails if the device already has one; identities are only replaced by a
    /// device reset, which wipes the store.
    pub async fn generate_identity(&self) -> Result<IdentityPublicKey, Error> {
        let mut material = self.material.lock().await;
        if material.identity.is_some() {
            return Err(Error::Protocol("identity key already exists".to_string()));
        }

        let identity = IdentityKey::generate()?;
        let public = identity.public_key();
        material.identity = Some(identity);

        if let Err(err) = self.persist(&material).await {
            material.identity = None;
            return Err(err);
        }

        info!(fingerprint = %public.fingerprint(), "identity key generated");
        Ok(public)
    }

    pub async fn has_identity(&self) -> bool {
        self.material.lock().await.identity.is_some()
    }

    /// Copy of the private identity key for a handshake. Wiped on drop.
    pub async fn identity(&self) -> Result<IdentityKey, Error> {
        self.material.lock().await.identity().cloned()
    }

    pub async fn identity_public(&self) -> Result<IdentityPublicKey, Error> {
        Ok(self.material.lock().await.identity()?.public_key())
    }

    /// Generates a signed pre-key and makes it current.
    ///
    /// The previously current key is retired at `now` and stays usable until
    /// its grace period elapses.
    pub async fn generate_signed_pre_key(&self, now: Timestamp) -> Result<SignedPreKeyPublic, Error> {
        let mut material = self.material.lock().await;

        let id = material.next_signed_pre_key_id;
        let signed_pre_key = SignedPreKey::generate(id, material.identity()?, now)?;
        let public = signed_pre_key.to_public();

        let previous = material.current_signed_pre_key;
        material.signed_pre_keys.insert(id, signed_pre_key);
        material.current_signed_pre_key = Some(id);
        material.next_signed_pre_key_id = id.wrapping_add(1);
        let retired = previous.and_then(|previous| {
            let key = material.signed_pre_keys.get_mut(&previous)?;
            let was_retired = key.retired_at().is_some();
            key.retire(now);
            (!was_retired).then_some(previous)
        });

        if let Err(err) = self.persist(&material).await {
            material.signed_pre_keys.remove(&id);
            material.current_signed_pre_key = previous;
            material.next_signed_pre_key_id = id;
            if let Some(key) = retired.and_then(|id| material.signed_pre_keys.get_mut(&id)) {
                key.unretire();
            }
            return Err(err);
        }

        debug!(signed_pre_key_id = id, ?previous, "signed pre-key generated");
        Ok(public)
    }

    /// Replaces the current signed pre-key and purges retired keys whose
    /// grace period has elapsed.
    pub async fn rotate_signed_pre_key(&self, now: Timestamp) -> Result<SignedPreKeyPublic, Error> {
        let public = self.generate_signed_pre_key(now).await?;
        self.purge_expired_signed_pre_keys(now).await?;
        info!(signed_pre_key_id = public.id, "signed pre-key rotated");
        Ok(public)
    }

    /// Whether the current signed pre-key is older than the rotation interval.
    pub async fn signed_pre_key_due(&self, now: Timestamp) -> bool {
        let material = self.material.lock().await;
        match material.current_signed_pre_key() {
            Ok(key) => {
                key.created_at()
                    .saturating_add(self.config.signed_pre_key_rotation_interval.as_secs())
                    <= now
            }
            Err(_) => true,
        }
    }

    /// Drops the private halves of retired signed pre-keys past their grace period.
    pub async fn purge_expired_signed_pre_keys(&self, now: Timestamp) -> Result<Vec<u32>, Error> {
        let mut material = self.material.lock().await;
        let grace = self.config.signed_pre_key_grace_period.as_secs();

        let expired: Vec<u32> = material
            .signed_pre_keys
            .values()
            .filter(|key| key.is_expired(now, grace))
            .map(SignedPreKey::id)
            .collect();
        if expired.is_empty() {
            return Ok(expired);
        }

        let mut removed = Vec::with_capacity(expired.len());
        for id in &expired {
            if let Some(key) = material.signed_pre_keys.remove(id) {
                removed.push(key);
            }
        }

        if let Err(err) = self.persist(&material).await {
            for key in removed {
                material.signed_pre_keys.insert(key.id(), key);
            }
            return Err(err);
        }

        info!(?expired, "purged expired signed pre-keys");
        Ok(expired)
    }

    /// Private half of signed pre-key `id`, current or still within its grace period.
    pub async fn signed_pre_key(&self, id: u32) -> Result<X25519Secret, Error> {
        self.material
            .lock()
            .await
            .signed_pre_keys
            .get(&id)
            .map(SignedPreKey::secret)
            .ok_or(Error::UnknownPreKey(id))
    }

    /// Generates `count` one-time pre-keys and returns their public halves.
    pub async fn generate_one_time_pre_keys(
        &self,
        count: usize,
    ) -> Result<Vec<OneTimePreKeyPublic>, Error> {
        let mut material = self.material.lock().await;

        let first_id = material.next_one_time_pre_key_id;
        let mut publics = Vec::with_capacity(count);
        for _ in 0..count {
            let id = material.next_one_time_pre_key_id;
            let key = OneTimePreKey::generate(id)?;
            publics.push(key.to_public());
            material.one_time_pre_keys.insert(id, key);
            material.next_one_time_pre_key_id = id.wrapping_add(1);
        }

        if let Err(err) = self.persist(&material).await {
            for public in &publics {
                material.one_time_pre_keys.remove(&public.id);
            }
            material.next_one_time_pre_key_id = first_id;
            return Err(err);
        }

        debug!(count, first_id, "one-time pre-keys generated");
        Ok(publics)
    }

    /// Marks one-time pre-key `id` consumed and hands out its private half.
    ///
    /// This is a compare-and-swap: of any number of concurrent callers for the
    /// same id exactly one succeeds, the others get
    /// [`Error::KeyAlreadyConsumed`]. The consumed flag is durable before the
    /// key is returned.
    pub async fn consume_one_time_pre_key(&self, id: u32) -> Result<X25519Secret, Error> {
        let mut material = self.material.lock().await;

        let secret = material
            .one_time_pre_keys
            .get_mut(&id)
            .ok_or(Error::UnknownPreKey(id))?
            .consume()
            .inspect_err(|_| warn!(one_time_pre_key_id = id, "one-time pre-key reused"))?;

        if let Err(err) = self.persist(&material).await {
            if let Some(key) = material.one_time_pre_keys.get_mut(&id) {
                key.restore(secret);
            }
            return Err(err);
        }

        debug!(one_time_pre_key_id = id, "one-time pre-key consumed");
        Ok(secret)
    }

    /// Private half of an unconsumed one-time pre-key, left unconsumed.
    ///
    /// For checking a handshake before committing to it; the handshake that is
    /// kept must still go through [`Self::consume_one_time_pre_key`].
    pub async fn peek_one_time_pre_key(&self, id: u32) -> Result<X25519Secret, Error> {
        self.material
            .lock()
            .await
            .one_time_pre_keys
            .get(&id)
            .ok_or(Error::UnknownPreKey(id))?
            .secret()
    }

    pub async fn available_one_time_pre_keys(&self) -> usize {
        self.material.lock().await.available_one_time_pre_keys()
    }

    /// Tops the pool up to the configured maximum once it falls below the minimum.
    ///
    /// Returns the newly generated keys, empty when no replenishment was needed.
    pub async fn replenish_one_time_pre_keys(&self) -> Result<Vec<OneTimePreKeyPublic>, Error> {
        let available = self.available_one_time_pre_keys().await;
        if available >= self.config.min_one_time_pre_keys {
            return Ok(Vec::new());
        }

        self.forget_consumed_one_time_pre_keys().await?;
        let needed = self.config.max_one_time_pre_keys.saturating_sub(available);
        info!(available, needed, "replenishing one-time pre-keys");
        self.generate_one_time_pre_keys(needed).await
    }

    /// Public halves for the key directory: identity, current signed pre-key
    /// and every unconsumed one-time pre-key.
    pub async fn published_bundle(&self) -> Result<PublishedBundle, Error> {
        let material = self.material.lock().await;
        Ok(PublishedBundle {
            identity: material.identity()?.public_key(),
            signed_pre_key: material.current_signed_pre_key()?.to_public(),
            one_time_pre_keys: material
                .one_time_pre_keys
                .values()
                .filter(|key| !key.is_consumed())
                .map(OneTimePreKey::to_public)
                .collect(),
        })
    }

    /// Keeps at most `max_one_time_pre_keys` consumed markers around so that
    /// late duplicates still report [`Error::KeyAlreadyConsumed`].
    async fn forget_consumed_one_time_pre_keys(&self) -> Result<(), Error> {
        let mut material = self.material.lock().await;
        let consumed: Vec<u32> = material
            .one_time_pre_keys
            .values()
            .filter(|key| key.is_consumed())
            .map(OneTimePreKey::id)
            .collect();
        let excess = consumed
            .len()
            .saturating_sub(self.config.max_one_time_pre_keys);
        if excess == 0 {
            return Ok(());
        }

        for id in &consumed[..excess] {
            material.one_time_pre_keys.remove(id);
        }
        self.persist(&material).await
    }

    async fn persist(&self, material: &KeyMaterial) -> Result<(), Error> {
        let bytes = material.to_proto().encode_to_vec();
        self.store.put(STORAGE_KEY, bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKeyValueStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    const DAY: u64 = 24 * 60 * 60;

    async fn manager() -> (KeyManager<MemoryKeyValueStore>, Arc<MemoryKeyValueStore>) {
        let store = Arc::new(MemoryKeyValueStore::new());
        let manager = KeyManager::open(store.clone(), Config::default()).await.unwrap();
        manager.generate_identity().await.unwrap();
        manager.generate_signed_pre_key(0).await.unwrap();
        (manager, store)
    }

    #[tokio::test]
    async fn test_identity_is_generated_once() {
        let (manager, _) = manager().await;
        assert!(manager.has_identity().await);
        assert!(matches!(
            manager.generate_identity().await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_material_survives_reopen() {
        let (manager, store) = manager().await;
        manager.generate_one_time_pre_keys(3).await.unwrap();
        let bundle = manager.published_bundle().await.unwrap();

        let reopened = KeyManager::open(store, Config::default()).await.unwrap();
        assert_eq!(reopened.published_bundle().await.unwrap(), bundle);
    }

    #[tokio::test]
    async fn test_consume_is_compare_and_swap() {
        let (manager, _) = manager().await;
        let keys = manager.generate_one_time_pre_keys(1).await.unwrap();
        let id = keys[0].id;

        let manager = Arc::new(manager);
        let first = tokio::spawn({
            let manager = manager.clone();
            async move { manager.consume_one_time_pre_key(id).await }
        });
        let second = tokio::spawn({
            let manager = manager.clone();
            async move { manager.consume_one_time_pre_key(id).await }
        });

        let results = [first.await.unwrap(), second.await.unwrap()];
        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
        assert!(
            results
                .iter()
                .any(|result| matches!(result, Err(Error::KeyAlreadyConsumed(consumed)) if *consumed == id))
        );
        assert_eq!(manager.available_one_time_pre_keys().await, 0);
        assert!(matches!(
            manager.consume_one_time_pre_key(999).await,
            Err(Error::UnknownPreKey(999))
        ));
    }

    #[tokio::test]
    async fn test_rotation_keeps_previous_key_for_grace_period() {
        let (manager, _) = manager().await;
        let first = manager.published_bundle().await.unwrap().signed_pre_key;
        assert!(!manager.signed_pre_key_due(29 * DAY).await);
        assert!(manager.signed_pre_key_due(30 * DAY).await);

        let second = manager.rotate_signed_pre_key(30 * DAY).await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(
            manager.published_bundle().await.unwrap().signed_pre_key,
            second
        );
        assert!(manager.signed_pre_key(first.id).await.is_ok());

        let purged = manager.purge_expired_signed_pre_keys(37 * DAY).await.unwrap();
        assert_eq!(purged, vec![first.id]);
        assert!(matches!(
            manager.signed_pre_key(first.id).await,
            Err(Error::UnknownPreKey(_))
        ));
        assert!(manager.signed_pre_key(second.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_replenish_only_below_minimum() {
        let config = Config {
            min_one_time_pre_keys: 2,
            max_one_time_pre_keys: 5,
            ..Config::default()
        };
        let manager = KeyManager::open(Arc::new(MemoryKeyValueStore::new()), config)
            .await
            .unwrap();
        manager.generate_identity().await.unwrap();
        manager.generate_signed_pre_key(0).await.unwrap();

        assert_eq!(manager.replenish_one_time_pre_keys().await.unwrap().len(), 5);
        assert!(manager.replenish_one_time_pre_keys().await.unwrap().is_empty());

        for public in manager.published_bundle_keys().await {
            manager.consume_one_time_pre_key(public).await.unwrap();
        }
        assert_eq!(manager.replenish_one_time_pre_keys().await.unwrap().len(), 5);
    }

    struct FailingStore {
        inner: MemoryKeyValueStore,
        fail: AtomicBool,
    }

    #[async_trait]
    impl KeyValueStore for FailingStore {
        async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Storage("disk full".to_string()));
            }
            self.inner.put(key, value).await
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
            self.inner.get(key).await
        }

        async fn delete(&self, key: &str) -> Result<(), Error> {
            self.inner.delete(key).await
        }

        async fn flush(&self) -> Result<(), Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_persist_publishes_nothing() {
        let store = Arc::new(FailingStore {
            inner: MemoryKeyValueStore::new(),
            fail: AtomicBool::new(false),
        });
        let manager = KeyManager::open(store.clone(), Config::default()).await.unwrap();
        manager.generate_identity().await.unwrap();
        manager.generate_signed_pre_key(0).await.unwrap();
        let keys = manager.generate_one_time_pre_keys(1).await.unwrap();

        store.fail.store(true, Ordering::SeqCst);
        assert!(matches!(
            manager.generate_one_time_pre_keys(4).await,
            Err(Error::Storage(_))
        ));
        assert!(matches!(
            manager.consume_one_time_pre_key(keys[0].id).await,
            Err(Error::Storage(_))
        ));
        assert!(manager.rotate_signed_pre_key(40 * DAY).await.is_err());

        let bundle = manager.published_bundle().await.unwrap();
        assert_eq!(bundle.one_time_pre_keys, keys);
        assert_eq!(bundle.signed_pre_key.id, 1);

        store.fail.store(false, Ordering::SeqCst);
        assert!(manager.consume_one_time_pre_key(keys[0].id).await.is_ok());
    }

    impl<S: KeyValueStore> KeyManager<S> {
        async fn published_bundle_keys(&self) -> Vec<u32> {
            self.published_bundle()
                .await
                .unwrap()
                .one_time_pre_keys
                .iter()
                .map(|key| key.id)
                .collect()
        }
    }
}
