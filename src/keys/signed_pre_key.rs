use crate::keys::IdentityKey;
use crate::proto::{SignedPreKeyPublicProto, SignedPreKeyRecord};
use crate::types::{Timestamp, X25519PublicKey, X25519Secret, to_array};
use crate::Error;
use ed25519_dalek::Signature;

/// A medium-term signed pre-key.
///
/// Signed pre-keys are signed with the owner's identity key and rotated on a
/// schedule. A rotated key stays usable for in-flight handshakes until its
/// grace period elapses, after which it is purged.
#[derive(Clone)]
pub struct SignedPreKey {
    id: u32,
    pre_key: X25519Secret,
    public_key: X25519PublicKey,
    signature: Signature,
    created_at: Timestamp,
    retired_at: Option<Timestamp>,
}

impl SignedPreKey {
    /// Generates a new key and signs its public half with `identity`.
    pub fn generate(id: u32, identity: &IdentityKey, now: Timestamp) -> Result<Self, Error> {
        let pre_key = X25519Secret::generate()?;
        let public_key = pre_key.public_key();
        let signature = identity.sign(public_key.as_bytes());

        Ok(Self {
            id,
            pre_key,
            public_key,
            signature,
            created_at: now,
            retired_at: None,
        })
    }

    /// Returns the unique identifier for this signed pre-key.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Returns the public component of this signed pre-key.
    pub fn public_key(&self) -> X25519PublicKey {
        self.public_key
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn retired_at(&self) -> Option<Timestamp> {
        self.retired_at
    }

    pub(crate) fn retire(&mut self, now: Timestamp) {
        self.retired_at.get_or_insert(now);
    }

    pub(crate) fn unretire(&mut self) {
        self.retired_at = None;
    }

    /// Whether the grace period of a retired key has elapsed at `now`.
    pub(crate) fn is_expired(&self, now: Timestamp, grace_period_secs: u64) -> bool {
        self.retired_at
            .is_some_and(|retired_at| retired_at.saturating_add(grace_period_secs) <= now)
    }

    pub(crate) fn secret(&self) -> X25519Secret {
        self.pre_key.clone()
    }

    /// Public half together with the signature, as published in bundles.
    pub fn to_public(&self) -> SignedPreKeyPublic {
        SignedPreKeyPublic {
            id: self.id,
            public_key: self.public_key,
            signature: self.signature,
            created_at: self.created_at,
        }
    }

    pub(crate) fn to_record(&self) -> SignedPreKeyRecord {
        SignedPreKeyRecord {
            id: self.id,
            private_key: self.pre_key.as_bytes().to_vec(),
            signature: self.signature.to_bytes().to_vec(),
            created_at: self.created_at,
            retired_at: self.retired_at,
        }
    }

    pub(crate) fn from_record(record: &SignedPreKeyRecord) -> Result<Self, Error> {
        let pre_key = X25519Secret::from_slice(&record.private_key)?;
        let signature = to_array::<64>(&record.signature, "Signature")?;

        Ok(Self {
            id: record.id,
            public_key: pre_key.public_key(),
            pre_key,
            signature: Signature::from_bytes(&signature),
            created_at: record.created_at,
            retired_at: record.retired_at,
        })
    }
}

/// Public part of a signed pre-key as carried in a bundle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignedPreKeyPublic {
    pub id: u32,
    pub public_key: X25519PublicKey,
    pub signature: Signature,
    pub created_at: Timestamp,
}

impl From<&SignedPreKeyPublic> for SignedPreKeyPublicProto {
    fn from(value: &SignedPreKeyPublic) -> Self {
        Self {
            id: value.id,
            public_key: value.public_key.to_bytes().to_vec(),
            signature: value.signature.to_bytes().to_vec(),
            created_at: value.created_at,
        }
    }
}

impl TryFrom<&SignedPreKeyPublicProto> for SignedPreKeyPublic {
    type Error = Error;

    fn try_from(value: &SignedPreKeyPublicProto) -> Result<Self, Self::Error> {
        let signature = to_array::<64>(&value.signature, "Signature")?;
        Ok(Self {
            id: value.id,
            public_key: X25519PublicKey::from_slice(&value.public_key)?,
            signature: Signature::from_bytes(&signature),
            created_at: value.created_at,
        })
    }
}
