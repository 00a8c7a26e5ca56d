use crate::Error;
use crate::types::{generate_random_seed, to_array};
use std::hash::{Hash, Hasher};
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Public half of an X25519 key pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct X25519PublicKey(PublicKey);

impl X25519PublicKey {
    /// Raw little-endian Montgomery u-coordinate.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Copies the key into a byte array.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Parses a key from a slice, which must be exactly 32 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        to_array::<32>(bytes, "X25519 public key").map(Self::from)
    }
}

impl Hash for X25519PublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl From<[u8; 32]> for X25519PublicKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(PublicKey::from(bytes))
    }
}

impl From<PublicKey> for X25519PublicKey {
    fn from(value: PublicKey) -> Self {
        Self(value)
    }
}

impl AsRef<PublicKey> for X25519PublicKey {
    fn as_ref(&self) -> &PublicKey {
        &self.0
    }
}

/// Private X25519 key. Wiped from memory when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct X25519Secret(Box<StaticSecret>);

impl X25519Secret {
    /// Generates a fresh key pair from the OS random source.
    pub(crate) fn generate() -> Result<Self, Error> {
        Ok(Self::from(generate_random_seed()?))
    }

    pub(crate) fn dh(&self, public_key: &X25519PublicKey) -> SharedSecret {
        self.0.diffie_hellman(public_key.as_ref())
    }

    pub(crate) fn public_key(&self) -> X25519PublicKey {
        let pub_key = PublicKey::from(self.0.as_ref());
        pub_key.into()
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Parses a private key from a slice, which must be exactly 32 bytes long.
    pub(crate) fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != 32 {
            return Err(Error::Serde(format!(
                "X25519 private key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut seed = Zeroizing::new([0u8; 32]);
        seed.copy_from_slice(bytes);
        Ok(Self::from(seed))
    }
}

impl From<Zeroizing<[u8; 32]>> for X25519Secret {
    fn from(bytes: Zeroizing<[u8; 32]>) -> Self {
        Self(Box::new(StaticSecret::from(*bytes)))
    }
}

impl AsRef<StaticSecret> for X25519Secret {
    fn as_ref(&self) -> &StaticSecret {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dh_agreement() {
        let alice = X25519Secret::generate().unwrap();
        let bob = X25519Secret::generate().unwrap();

        let ab = alice.dh(&bob.public_key());
        let ba = bob.dh(&alice.public_key());
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn test_from_slice_rejects_bad_length() {
        assert!(X25519PublicKey::from_slice(&[1u8; 31]).is_err());
        assert!(X25519Secret::from_slice(&[1u8; 33]).is_err());

        let secret = X25519Secret::generate().unwrap();
        let restored = X25519Secret::from_slice(secret.as_bytes()).unwrap();
        assert_eq!(restored.public_key(), secret.public_key());
    }
}
