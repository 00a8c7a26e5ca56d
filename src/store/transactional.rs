use crate::Error;
use crate::store::{KeyValueStore, Persist};
use prost::Message;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::trace;

/// Typed view over a [`KeyValueStore`] namespace with per-key transactions.
///
/// `transact` serializes every read-modify-write on one key behind a mutex
/// scoped to that key. Different keys never wait on each other. The closure
/// works on a private copy and the result is written back only when it
/// returns `Ok`, so an error or a dropped future leaves the stored value as it
/// was. A key's mutex lives only while someone holds or waits on it.
pub struct TransactionalStore<S, V> {
    kv: Arc<S>,
    namespace: &'static str,
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    _value: PhantomData<fn() -> V>,
}

impl<S: KeyValueStore, V: Persist> TransactionalStore<S, V> {
    pub fn new(kv: Arc<S>, namespace: &'static str) -> Self {
        Self {
            kv,
            namespace,
            locks: RwLock::new(HashMap::new()),
            _value: PhantomData,
        }
    }

    /// Reads the last committed value.
    pub async fn get(&self, key: &str) -> Result<Option<V>, Error> {
        self.load(key).await
    }

    /// Replaces the value, waiting for any transaction in flight on `key`.
    pub async fn put(&self, key: &str, value: &V) -> Result<(), Error> {
        let guard = self.lock(key).await;
        let result = self.store(key, value).await;
        self.release(key, guard).await;
        result
    }

    /// Removes the value, waiting for any transaction in flight on `key`.
    pub async fn delete(&self, key: &str) -> Result<(), Error> {
        let guard = self.lock(key).await;
        let result = self.kv.delete(&self.storage_key(key)).await;
        self.release(key, guard).await;
        result
    }

    /// Atomically applies `f` to the value stored under `key`.
    ///
    /// `f` sees `None` when nothing is stored. Leaving `None` in the slot
    /// deletes the entry.
    pub async fn transact<R, F>(&self, key: &str, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut Option<V>) -> Result<R, Error> + Send,
        R: Send,
    {
        let guard = self.lock(key).await;
        let result = self.commit(key, f).await;
        self.release(key, guard).await;
        result
    }

    async fn commit<R, F>(&self, key: &str, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut Option<V>) -> Result<R, Error> + Send,
        R: Send,
    {
        let mut value = self.load(key).await?;
        let existed = value.is_some();
        let result = f(&mut value)?;

        match value {
            Some(value) => self.store(key, &value).await?,
            None if existed => self.kv.delete(&self.storage_key(key)).await?,
            None => {}
        }

        trace!(namespace = self.namespace, key, "transaction committed");
        Ok(result)
    }

    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let existing = self.locks.read().await.get(key).cloned();
        let lock = match existing {
            Some(lock) => lock,
            None => self
                .locks
                .write()
                .await
                .entry(key.to_string())
                .or_default()
                .clone(),
        };

        lock.lock_owned().await
    }

    /// Unlocks `key` and forgets its mutex when nobody else holds a handle.
    ///
    /// Handles are cloned under the read lock, so a count of one under the
    /// write lock means no task can still be waiting on this mutex.
    async fn release(&self, key: &str, guard: OwnedMutexGuard<()>) {
        drop(guard);
        let mut locks = self.locks.write().await;
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    async fn tracked_locks(&self) -> usize {
        self.locks.read().await.len()
    }

    async fn load(&self, key: &str) -> Result<Option<V>, Error> {
        match self.kv.get(&self.storage_key(key)).await? {
            Some(bytes) => {
                let record = V::Record::decode(bytes.as_slice())?;
                V::from_record(record).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn store(&self, key: &str, value: &V) -> Result<(), Error> {
        let bytes = value.to_record().encode_to_vec();
        self.kv.put(&self.storage_key(key), bytes).await
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}/{}", self.namespace, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKeyValueStore;

    #[derive(Clone, PartialEq, prost::Message)]
    struct CounterProto {
        #[prost(uint64, tag = "1")]
        value: u64,
    }

    #[derive(Debug, PartialEq)]
    struct Counter(u64);

    impl Persist for Counter {
        type Record = CounterProto;

        fn to_record(&self) -> CounterProto {
            CounterProto { value: self.0 }
        }

        fn from_record(record: CounterProto) -> Result<Self, Error> {
            Ok(Self(record.value))
        }
    }

    fn counters() -> Arc<TransactionalStore<MemoryKeyValueStore, Counter>> {
        Arc::new(TransactionalStore::new(
            Arc::new(MemoryKeyValueStore::new()),
            "counter",
        ))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_transactions_on_one_key_serialize() {
        let store = counters();

        let mut handles = Vec::new();
        for _ in 0..64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .transact("shared", |slot| {
                        let next = slot.as_ref().map_or(0, |counter| counter.0) + 1;
                        *slot = Some(Counter(next));
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.get("shared").await.unwrap(), Some(Counter(64)));
    }

    #[tokio::test]
    async fn test_failed_transaction_commits_nothing() {
        let store = counters();
        store.put("a", &Counter(5)).await.unwrap();

        let result: Result<(), Error> = store
            .transact("a", |slot| {
                *slot = Some(Counter(6));
                Err(Error::AuthenticationFailed)
            })
            .await;
        assert_eq!(result, Err(Error::AuthenticationFailed));
        assert_eq!(store.get("a").await.unwrap(), Some(Counter(5)));
    }

    #[tokio::test]
    async fn test_clearing_the_slot_deletes() {
        let store = counters();
        store.put("a", &Counter(1)).await.unwrap();

        let previous = store
            .transact("a", |slot| Ok(slot.take().map(|counter| counter.0)))
            .await
            .unwrap();
        assert_eq!(previous, Some(1));
        assert_eq!(store.get("a").await.unwrap(), None);

        store.put("b", &Counter(2)).await.unwrap();
        store.delete("b").await.unwrap();
        assert_eq!(store.get("b").await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_idle_keys_hold_no_lock() {
        let store = counters();

        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let key = format!("peer-{}", i % 8);
                store
                    .transact(&key, |slot| {
                        *slot = Some(Counter(i));
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.tracked_locks().await, 0);

        let failed: Result<(), Error> = store
            .transact("peer-0", |_| Err(Error::AuthenticationFailed))
            .await;
        assert!(failed.is_err());
        store.put("fresh", &Counter(1)).await.unwrap();
        store.delete("fresh").await.unwrap();
        assert_eq!(store.tracked_locks().await, 0);
    }
}
