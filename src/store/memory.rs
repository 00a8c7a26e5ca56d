use crate::Error;
use crate::store::KeyValueStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// In-memory [`KeyValueStore`] for tests and ephemeral devices.
///
/// Clones share the same underlying map.
#[derive(Clone, Default)]
pub struct MemoryKeyValueStore {
    inner: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw stored bytes, bypassing any sealing layered on top.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.lock().ok()?.get(key).cloned()
    }

    fn with_map<R>(&self, f: impl FnOnce(&mut HashMap<String, Vec<u8>>) -> R) -> Result<R, Error> {
        let mut map = self
            .inner
            .lock()
            .map_err(|_| Error::Storage("memory store mutex poisoned".to_string()))?;
        Ok(f(&mut map))
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        self.with_map(|map| {
            map.insert(key.to_string(), value);
        })
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        self.with_map(|map| map.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.with_map(|map| {
            map.remove(key);
        })
    }

    async fn flush(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryKeyValueStore::new();
        assert!(store.is_empty());

        store.put("a", vec![1, 2, 3]).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(vec![1, 2, 3]));

        let clone = store.clone();
        clone.put("a", vec![4]).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(vec![4]));

        store.delete("a").await.unwrap();
        store.delete("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
    }
}
