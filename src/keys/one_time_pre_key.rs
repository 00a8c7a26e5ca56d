use crate::proto::{OneTimePreKeyPublicProto, OneTimePreKeyRecord};
use crate::types::{X25519PublicKey, X25519Secret};
use crate::Error;

/// A single-use pre-key.
///
/// The private half is dropped the moment the key is consumed, so a consumed
/// key can never take part in a second handshake.
pub struct OneTimePreKey {
    id: u32,
    pre_key: Option<X25519Secret>,
    public_key: X25519PublicKey,
}

impl OneTimePreKey {
    /// Creates a new one-time pre-key with the given ID.
    pub fn generate(id: u32) -> Result<Self, Error> {
        let pre_key = X25519Secret::generate()?;
        Ok(Self {
            id,
            public_key: pre_key.public_key(),
            pre_key: Some(pre_key),
        })
    }

    /// Returns the unique identifier for this pre-key.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Returns the public component of this pre-key.
    pub fn public_key(&self) -> X25519PublicKey {
        self.public_key
    }

    /// Checks if this pre-key has been consumed.
    pub fn is_consumed(&self) -> bool {
        self.pre_key.is_none()
    }

    /// Takes the private half out, leaving the key consumed.
    ///
    /// Fails with [`Error::KeyAlreadyConsumed`] on every call after the first.
    pub(crate) fn consume(&mut self) -> Result<X25519Secret, Error> {
        self.pre_key.take().ok_or(Error::KeyAlreadyConsumed(self.id))
    }

    /// The private half without consuming it.
    pub(crate) fn secret(&self) -> Result<X25519Secret, Error> {
        self.pre_key.clone().ok_or(Error::KeyAlreadyConsumed(self.id))
    }

    /// Undoes a consumption whose durable write failed.
    pub(crate) fn restore(&mut self, secret: X25519Secret) {
        self.pre_key.get_or_insert(secret);
    }

    pub fn to_public(&self) -> OneTimePreKeyPublic {
        OneTimePreKeyPublic {
            id: self.id,
            public_key: self.public_key,
        }
    }

    pub(crate) fn to_record(&self) -> OneTimePreKeyRecord {
        OneTimePreKeyRecord {
            id: self.id,
            private_key: self
                .pre_key
                .as_ref()
                .map(|key| key.as_bytes().to_vec())
                .unwrap_or_default(),
            public_key: self.public_key.to_bytes().to_vec(),
            consumed: self.is_consumed(),
        }
    }

    pub(crate) fn from_record(record: &OneTimePreKeyRecord) -> Result<Self, Error> {
        let pre_key = if record.consumed {
            None
        } else {
            Some(X25519Secret::from_slice(&record.private_key)?)
        };

        Ok(Self {
            id: record.id,
            pre_key,
            public_key: X25519PublicKey::from_slice(&record.public_key)?,
        })
    }
}

/// Public part of a one-time pre-key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OneTimePreKeyPublic {
    pub id: u32,
    pub public_key: X25519PublicKey,
}

impl From<&OneTimePreKeyPublic> for OneTimePreKeyPublicProto {
    fn from(value: &OneTimePreKeyPublic) -> Self {
        Self {
            id: value.id,
            public_key: value.public_key.to_bytes().to_vec(),
        }
    }
}

impl TryFrom<&OneTimePreKeyPublicProto> for OneTimePreKeyPublic {
    type Error = Error;

    fn try_from(value: &OneTimePreKeyPublicProto) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id,
            public_key: X25519PublicKey::from_slice(&value.public_key)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_exactly_once() {
        let mut pre_key = OneTimePreKey::generate(7).unwrap();
        assert!(!pre_key.is_consumed());

        let secret = pre_key.consume().unwrap();
        assert_eq!(secret.public_key(), pre_key.public_key());
        assert!(pre_key.is_consumed());

        assert!(matches!(
            pre_key.consume(),
            Err(Error::KeyAlreadyConsumed(7))
        ));
    }

    #[test]
    fn test_consumed_record_has_no_private_key() {
        let mut pre_key = OneTimePreKey::generate(3).unwrap();
        let fresh = OneTimePreKey::from_record(&pre_key.to_record()).unwrap();
        assert!(!fresh.is_consumed());

        pre_key.consume().unwrap();
        let record = pre_key.to_record();
        assert!(record.private_key.is_empty());
        assert!(record.consumed);

        let restored = OneTimePreKey::from_record(&record).unwrap();
        assert!(restored.is_consumed());
        assert_eq!(restored.public_key(), pre_key.public_key());
    }
}
