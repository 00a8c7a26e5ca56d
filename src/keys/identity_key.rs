use crate::proto::IdentityPublicKeyProto;
use crate::types::{X25519PublicKey, X25519Secret, generate_random_seed, to_array};
use crate::Error;
use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use x25519_dalek::SharedSecret;
use zeroize::Zeroizing;

/// Long-term identity key pair that combines signing and key agreement capabilities.
///
/// An `IdentityKey` contains both an Ed25519 signing key for authentication and
/// an X25519 key for Diffie-Hellman key agreement, derived from the same seed.
/// One per device; it is only replaced by a device reset.
#[derive(Clone)]
pub struct IdentityKey {
    signing_key: SigningKey,
    dh_key: X25519Secret,
}

impl IdentityKey {
    /// Creates a new identity key with randomly generated components.
    pub fn generate() -> Result<Self, Error> {
        let seed = generate_random_seed()?;
        let signing_key = SigningKey::from_bytes(&seed);
        let dh_key = X25519Secret::from(seed);

        Ok(Self {
            signing_key,
            dh_key,
        })
    }

    /// Signs a message using the Ed25519 signing key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Public half used by peers to verify signatures and run X3DH.
    pub fn public_key(&self) -> IdentityPublicKey {
        IdentityPublicKey {
            dh_key: self.dh_key.public_key(),
            signing_key: self.signing_key.verifying_key(),
        }
    }

    /// Performs Diffie-Hellman key agreement with another party's public key.
    pub(crate) fn dh(&self, public_key: &X25519PublicKey) -> SharedSecret {
        self.dh_key.dh(public_key)
    }

    /// Serializes the identity key to a 64-byte array.
    ///
    /// The first 32 bytes contain the Ed25519 private key,
    /// and the last 32 bytes contain the X25519 private key.
    pub(crate) fn to_bytes(&self) -> Zeroizing<[u8; 64]> {
        let mut bytes = Zeroizing::new([0u8; 64]);
        bytes[0..32].copy_from_slice(self.signing_key.as_bytes());
        bytes[32..64].copy_from_slice(self.dh_key.as_bytes());

        bytes
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != 64 {
            return Err(Error::Serde(format!(
                "Identity key must be 64 bytes, got {}",
                bytes.len()
            )));
        }

        let mut signing_bytes = Zeroizing::new([0u8; 32]);
        signing_bytes.copy_from_slice(&bytes[0..32]);
        let signing_key = SigningKey::from_bytes(&signing_bytes);

        Ok(Self {
            signing_key,
            dh_key: X25519Secret::from_slice(&bytes[32..64])?,
        })
    }
}

/// Public half of an [`IdentityKey`], pinned per peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdentityPublicKey {
    pub(crate) dh_key: X25519PublicKey,
    pub(crate) signing_key: VerifyingKey,
}

impl IdentityPublicKey {
    /// X25519 key used in the X3DH computations.
    pub fn dh_key(&self) -> X25519PublicKey {
        self.dh_key
    }

    /// Ed25519 key that signs the signed pre-keys.
    pub fn signing_key(&self) -> VerifyingKey {
        self.signing_key
    }

    /// Verifies `signature` over `message` with strict Ed25519 rules.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), Error> {
        self.signing_key
            .verify_strict(message, signature)
            .map_err(|_| Error::InvalidSignature)
    }

    /// Safety number shown to users for out-of-band comparison.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.dh_key.as_bytes());
        hasher.update(self.signing_key.as_bytes());
        STANDARD_NO_PAD.encode(hasher.finalize())
    }
}

impl From<&IdentityPublicKey> for IdentityPublicKeyProto {
    fn from(value: &IdentityPublicKey) -> Self {
        Self {
            dh_key: value.dh_key.to_bytes().to_vec(),
            signing_key: value.signing_key.to_bytes().to_vec(),
        }
    }
}

impl TryFrom<&IdentityPublicKeyProto> for IdentityPublicKey {
    type Error = Error;

    fn try_from(value: &IdentityPublicKeyProto) -> Result<Self, Self::Error> {
        let signing_bytes = to_array::<32>(&value.signing_key, "Ed25519 public key")?;
        Ok(Self {
            dh_key: X25519PublicKey::from_slice(&value.dh_key)?,
            signing_key: VerifyingKey::from_bytes(&signing_bytes)
                .map_err(|err| Error::Serde(err.to_string()))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signing_and_verification() {
        let identity_key = IdentityKey::generate().unwrap();
        let public = identity_key.public_key();
        let message = b"This is a test message";

        let signature = identity_key.sign(message);
        assert!(public.verify(message, &signature).is_ok());

        let modified_message = b"This is a modified message";
        assert_eq!(
            public.verify(modified_message, &signature),
            Err(Error::InvalidSignature)
        );
    }

    #[test]
    fn test_serialization_keeps_both_halves() {
        let original_key = IdentityKey::generate().unwrap();
        let serialized = original_key.to_bytes();

        let restored = IdentityKey::from_bytes(serialized.as_slice()).unwrap();
        assert_eq!(restored.public_key(), original_key.public_key());
        assert!(IdentityKey::from_bytes(&serialized[..63]).is_err());
    }

    #[test]
    fn test_fingerprint_is_stable_and_distinct() {
        let alice = IdentityKey::generate().unwrap().public_key();
        let bob = IdentityKey::generate().unwrap().public_key();

        assert_eq!(alice.fingerprint(), alice.fingerprint());
        assert_ne!(alice.fingerprint(), bob.fingerprint());

        let proto = IdentityPublicKeyProto::from(&alice);
        assert_eq!(IdentityPublicKey::try_from(&proto).unwrap(), alice);
    }
}
