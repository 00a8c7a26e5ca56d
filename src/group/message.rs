use crate::proto::GroupMessageProto;
use crate::Error;

/// A group ciphertext from one sender under one epoch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupMessage {
    pub group_id: String,
    pub channel_id: String,
    pub epoch_version: u64,
    pub sender_id: String,
    pub index: u32,
    pub ciphertext: Vec<u8>,
}

impl GroupMessage {
    /// Every field except the ciphertext, length-prefixed, as AEAD associated data.
    ///
    /// An identifier longer than `u32::MAX` bytes cannot be framed and is
    /// rejected rather than truncated.
    pub(crate) fn aad(&self) -> Result<Vec<u8>, Error> {
        let mut aad = Vec::with_capacity(
            12 + self.group_id.len() + self.channel_id.len() + self.sender_id.len() + 12,
        );
        for field in [&self.group_id, &self.channel_id, &self.sender_id] {
            let len = u32::try_from(field.len())
                .map_err(|_| Error::Protocol(format!("group field of {} bytes", field.len())))?;
            aad.extend_from_slice(&len.to_be_bytes());
            aad.extend_from_slice(field.as_bytes());
        }
        aad.extend_from_slice(&self.epoch_version.to_be_bytes());
        aad.extend_from_slice(&self.index.to_be_bytes());
        Ok(aad)
    }
}

impl From<&GroupMessage> for GroupMessageProto {
    fn from(value: &GroupMessage) -> Self {
        Self {
            group_id: value.group_id.clone(),
            channel_id: value.channel_id.clone(),
            epoch_version: value.epoch_version,
            sender_id: value.sender_id.clone(),
            index: value.index,
            ciphertext: value.ciphertext.clone(),
        }
    }
}

impl From<GroupMessageProto> for GroupMessage {
    fn from(value: GroupMessageProto) -> Self {
        Self {
            group_id: value.group_id,
            channel_id: value.channel_id,
            epoch_version: value.epoch_version,
            sender_id: value.sender_id,
            index: value.index,
            ciphertext: value.ciphertext,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(group_id: &str, channel_id: &str) -> GroupMessage {
        GroupMessage {
            group_id: group_id.to_string(),
            channel_id: channel_id.to_string(),
            epoch_version: 1,
            sender_id: "a".to_string(),
            index: 0,
            ciphertext: Vec::new(),
        }
    }

    #[test]
    fn test_aad_frames_field_boundaries() {
        let split_early = message("ab", "c").aad().unwrap();
        let split_late = message("a", "bc").aad().unwrap();
        assert_ne!(split_early, split_late);
        assert_eq!(&split_early[..4], &2u32.to_be_bytes());
    }
}
