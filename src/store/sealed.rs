use crate::Error;
use crate::store::KeyValueStore;
use crate::types::SymmetricKey;
use aes_gcm_siv::aead::{Aead, Payload};
use aes_gcm_siv::{Aes256GcmSiv, Key, KeyInit, Nonce};
use async_trait::async_trait;
use rand::TryRngCore;
use rand::rngs::OsRng;

const NONCE_SIZE: usize = 12;

/// Seals every blob with AES-256-GCM-SIV before handing it to the inner store.
///
/// The storage key is bound as associated data, so a blob copied under another
/// key fails to open. Deriving the master key is up to the host.
pub struct SealedKeyValueStore<S> {
    inner: S,
    cipher: Aes256GcmSiv,
}

impl<S: KeyValueStore> SealedKeyValueStore<S> {
    pub fn new(inner: S, master_key: SymmetricKey) -> Self {
        Self {
            inner,
            cipher: Aes256GcmSiv::new(Key::<Aes256GcmSiv>::from_slice(master_key.as_slice())),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn seal(&self, key: &str, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.try_fill_bytes(&mut nonce).map_err(|_| Error::Random)?;

        let ciphertext = self.cipher.encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: key.as_bytes(),
            },
        )?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, key: &str, sealed: &[u8]) -> Result<Vec<u8>, Error> {
        if sealed.len() < NONCE_SIZE {
            return Err(Error::Storage(format!("sealed blob {key} is truncated")));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|_| Error::Storage(format!("sealed blob {key} failed authentication")))
    }
}

#[async_trait]
impl<S: KeyValueStore> KeyValueStore for SealedKeyValueStore<S> {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        let sealed = self.seal(key, &value)?;
        self.inner.put(key, sealed).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        match self.inner.get(key).await? {
            Some(sealed) => self.open(key, &sealed).map(Some),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.inner.delete(key).await
    }

    async fn flush(&self) -> Result<(), Error> {
        self.inner.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKeyValueStore;
    use zeroize::Zeroizing;

    #[tokio::test]
    async fn test_blobs_are_sealed_at_rest() {
        let memory = MemoryKeyValueStore::new();
        let store = SealedKeyValueStore::new(memory.clone(), Zeroizing::new([7u8; 32]));

        store.put("session/a/b", b"secret state".to_vec()).await.unwrap();
        let raw = memory.raw("session/a/b").unwrap();
        assert!(!raw.windows(12).any(|window| window == b"secret state"));

        assert_eq!(
            store.get("session/a/b").await.unwrap(),
            Some(b"secret state".to_vec())
        );
    }

    #[tokio::test]
    async fn test_blob_moved_to_other_key_fails() {
        let memory = MemoryKeyValueStore::new();
        let store = SealedKeyValueStore::new(memory.clone(), Zeroizing::new([7u8; 32]));

        store.put("one", b"value".to_vec()).await.unwrap();
        memory.put("two", memory.raw("one").unwrap()).await.unwrap();
        assert!(matches!(store.get("two").await, Err(Error::Storage(_))));

        let wrong_key = SealedKeyValueStore::new(memory, Zeroizing::new([8u8; 32]));
        assert!(matches!(wrong_key.get("one").await, Err(Error::Storage(_))));
    }
}
