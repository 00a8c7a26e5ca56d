use crate::proto::EpochKeyProto;
use crate::ratchet::derive;
use crate::types::{generate_random_seed, to_array, DeviceId, SymmetricKey};
use crate::Error;
use std::collections::BTreeSet;
use zeroize::Zeroizing;

/// One version of the shared key of a (group, channel).
///
/// Superseded wholesale on every membership change. Each sender derives its
/// own sender key from it, so senders never share a chain. The member set
/// travels with the key: only those devices may send under this epoch.
#[derive(Clone)]
pub struct GroupKeyEpoch {
    group_id: String,
    channel_id: String,
    version: u64,
    key: SymmetricKey,
    members: BTreeSet<DeviceId>,
}

impl GroupKeyEpoch {
    /// Creates an epoch with a fresh random 32-byte key.
    pub fn generate(
        group_id: &str,
        channel_id: &str,
        version: u64,
        members: impl IntoIterator<Item = DeviceId>,
    ) -> Result<Self, Error> {
        Ok(Self {
            group_id: group_id.to_string(),
            channel_id: channel_id.to_string(),
            version,
            key: generate_random_seed()?,
            members: members.into_iter().collect(),
        })
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn members(&self) -> &BTreeSet<DeviceId> {
        &self.members
    }

    pub fn is_member(&self, device: &str) -> bool {
        self.members.contains(device)
    }

    /// Same key and same members. Two epochs of one version that differ here
    /// come from conflicting rotations.
    pub(crate) fn matches(&self, other: &Self) -> bool {
        self.version == other.version && *self.key == *other.key && self.members == other.members
    }

    /// SK = HMAC(epoch key, sender id)
    pub(crate) fn sender_key(&self, sender_id: &str) -> Result<SymmetricKey, Error> {
        derive(&self.key, sender_id.as_bytes())
    }

    pub(crate) fn to_proto(&self) -> EpochKeyProto {
        EpochKeyProto {
            group_id: self.group_id.clone(),
            channel_id: self.channel_id.clone(),
            version: self.version,
            key: self.key.to_vec(),
            members: self.members.iter().cloned().collect(),
        }
    }

    pub(crate) fn from_proto(proto: &EpochKeyProto) -> Result<Self, Error> {
        Ok(Self {
            group_id: proto.group_id.clone(),
            channel_id: proto.channel_id.clone(),
            version: proto.version,
            key: Zeroizing::new(to_array(&proto.key, "epoch key")?),
            members: proto.members.iter().cloned().collect(),
        })
    }
}

impl std::fmt::Debug for GroupKeyEpoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupKeyEpoch")
            .field("group_id", &self.group_id)
            .field("channel_id", &self.channel_id)
            .field("version", &self.version)
            .field("members", &self.members)
            .finish_non_exhaustive()
    }
}

/// MK = HMAC(SK, index as big-endian u32)
pub(crate) fn message_key(sender_key: &[u8; 32], index: u32) -> Result<SymmetricKey, Error> {
    derive(sender_key, &index.to_be_bytes())
}
