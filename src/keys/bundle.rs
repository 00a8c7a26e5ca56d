use crate::keys::{IdentityPublicKey, OneTimePreKeyPublic, SignedPreKeyPublic};
use crate::proto::KeyBundleProto;
use crate::Error;

/// Public keys a peer publishes so others can open sessions with it while it is offline.
///
/// A bundle is consumed read-only by the establisher, except that the one-time
/// pre-key is taken out on first use. Reusing a bundle whose one-time pre-key
/// is gone fails with [`Error::BundleIncomplete`]; fetch a fresh one instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKeyBundle {
    pub(crate) identity: IdentityPublicKey,
    pub(crate) signed_pre_key: SignedPreKeyPublic,
    pub(crate) one_time_pre_key: Option<OneTimePreKeyPublic>,
    pub(crate) spent: bool,
}

impl PublicKeyBundle {
    pub fn new(
        identity: IdentityPublicKey,
        signed_pre_key: SignedPreKeyPublic,
        one_time_pre_key: Option<OneTimePreKeyPublic>,
    ) -> Self {
        Self {
            identity,
            signed_pre_key,
            one_time_pre_key,
            spent: false,
        }
    }

    /// Verifies the signed pre-key signature against the bundle's identity key.
    pub fn verify(&self) -> Result<(), Error> {
        self.identity.verify(
            self.signed_pre_key.public_key.as_bytes(),
            &self.signed_pre_key.signature,
        )
    }

    #[inline]
    pub fn identity(&self) -> IdentityPublicKey {
        self.identity
    }

    #[inline]
    pub fn signed_pre_key(&self) -> SignedPreKeyPublic {
        self.signed_pre_key
    }

    #[inline]
    pub fn one_time_pre_key(&self) -> Option<OneTimePreKeyPublic> {
        self.one_time_pre_key
    }

    /// Whether a handshake already took this bundle's one-time pre-key.
    #[inline]
    pub fn is_spent(&self) -> bool {
        self.spent
    }

    /// Hands out the one-time pre-key for a handshake, at most once.
    pub(crate) fn take_one_time_pre_key(&mut self) -> Result<Option<OneTimePreKeyPublic>, Error> {
        if self.spent {
            return Err(Error::BundleIncomplete(
                "one-time pre-key already used by an earlier handshake".to_string(),
            ));
        }

        let one_time_pre_key = self.one_time_pre_key.take();
        self.spent = one_time_pre_key.is_some();
        Ok(one_time_pre_key)
    }
}

impl From<&PublicKeyBundle> for KeyBundleProto {
    fn from(value: &PublicKeyBundle) -> Self {
        Self {
            identity: Some((&value.identity).into()),
            signed_pre_key: Some((&value.signed_pre_key).into()),
            one_time_pre_key: value.one_time_pre_key.as_ref().map(Into::into),
        }
    }
}

impl TryFrom<&KeyBundleProto> for PublicKeyBundle {
    type Error = Error;

    fn try_from(value: &KeyBundleProto) -> Result<Self, Self::Error> {
        let identity = value
            .identity
            .as_ref()
            .ok_or_else(|| Error::BundleIncomplete("missing identity key".to_string()))?;
        let signed_pre_key = value
            .signed_pre_key
            .as_ref()
            .ok_or_else(|| Error::BundleIncomplete("missing signed pre-key".to_string()))?;
        let one_time_pre_key = value
            .one_time_pre_key
            .as_ref()
            .map(OneTimePreKeyPublic::try_from)
            .transpose()?;

        Ok(Self::new(
            IdentityPublicKey::try_from(identity)?,
            SignedPreKeyPublic::try_from(signed_pre_key)?,
            one_time_pre_key,
        ))
    }
}

/// Everything a device uploads to the key directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedBundle {
    pub identity: IdentityPublicKey,
    pub signed_pre_key: SignedPreKeyPublic,
    pub one_time_pre_keys: Vec<OneTimePreKeyPublic>,
}
