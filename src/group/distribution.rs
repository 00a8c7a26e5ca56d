use crate::group::GroupKeyEpoch;
use crate::proto::{EpochKeyProto, EpochRequestProto, SenderKeyDistributionProto};
use crate::types::DeviceId;
use crate::Error;
use async_trait::async_trait;
use prost::Message;
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

/// Encryption over an already established pairwise session.
///
/// The group cipher only ever moves epoch keys through this seam and never
/// sees the pairwise ratchet state.
#[async_trait]
pub trait PairwiseChannel: Send + Sync {
    /// Encrypts `plaintext` for `device` over the pairwise session.
    async fn wrap(&self, device: &str, plaintext: &[u8]) -> Result<Vec<u8>, Error>;

    /// Decrypts a payload `device` wrapped for us.
    async fn unwrap(&self, device: &str, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error>;
}

/// An epoch key wrapped for one member device.
///
/// The wrapped payload carries the epoch's member set next to the key, so a
/// receiver learns who may send under the epoch from an authenticated source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SenderKeyDistributionMessage {
    pub group_id: String,
    pub channel_id: String,
    pub epoch_version: u64,
    /// Pairwise ciphertext of the epoch key.
    pub wrapped_epoch_key: Vec<u8>,
}

impl From<&SenderKeyDistributionMessage> for SenderKeyDistributionProto {
    fn from(value: &SenderKeyDistributionMessage) -> Self {
        Self {
            group_id: value.group_id.clone(),
            channel_id: value.channel_id.clone(),
            epoch_version: value.epoch_version,
            wrapped_epoch_key: value.wrapped_epoch_key.clone(),
        }
    }
}

impl From<SenderKeyDistributionProto> for SenderKeyDistributionMessage {
    fn from(value: SenderKeyDistributionProto) -> Self {
        Self {
            group_id: value.group_id,
            channel_id: value.channel_id,
            epoch_version: value.epoch_version,
            wrapped_epoch_key: value.wrapped_epoch_key,
        }
    }
}

/// Asks a member to distribute an epoch again.
///
/// Sent in the clear. The answer is wrapped for the requesting device only, so
/// a forged request at most makes a member resend a key the named device
/// already had access to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EpochRequest {
    pub group_id: String,
    pub channel_id: String,
    pub version: u64,
}

impl From<&EpochRequest> for EpochRequestProto {
    fn from(value: &EpochRequest) -> Self {
        Self {
            group_id: value.group_id.clone(),
            channel_id: value.channel_id.clone(),
            version: value.version,
        }
    }
}

impl From<EpochRequestProto> for EpochRequest {
    fn from(value: EpochRequestProto) -> Self {
        Self {
            group_id: value.group_id,
            channel_id: value.channel_id,
            version: value.version,
        }
    }
}

/// Wraps `epoch` individually for every device in `recipients` except `local_device`.
///
/// Fails on the first device without a usable pairwise session; the caller
/// establishes the missing session and distributes again.
pub async fn distribute_epoch<P: PairwiseChannel + ?Sized>(
    epoch: &GroupKeyEpoch,
    local_device: &str,
    recipients: impl IntoIterator<Item = &str>,
    pairwise: &P,
) -> Result<Vec<(DeviceId, SenderKeyDistributionMessage)>, Error> {
    let encoded = Zeroizing::new(epoch.to_proto().encode_to_vec());

    let mut messages = Vec::new();
    for device in recipients {
        if device == local_device {
            continue;
        }
        let wrapped_epoch_key = pairwise.wrap(device, &encoded).await?;
        messages.push((
            device.to_string(),
            SenderKeyDistributionMessage {
                group_id: epoch.group_id().to_string(),
                channel_id: epoch.channel_id().to_string(),
                epoch_version: epoch.version(),
                wrapped_epoch_key,
            },
        ));
    }

    debug!(
        group_id = %epoch.group_id(),
        channel_id = %epoch.channel_id(),
        version = epoch.version(),
        recipients = messages.len(),
        "epoch distributed"
    );
    Ok(messages)
}

/// Unwraps a distribution message received from `sender_device`.
pub async fn receive_distribution<P: PairwiseChannel + ?Sized>(
    message: &SenderKeyDistributionMessage,
    sender_device: &str,
    pairwise: &P,
) -> Result<GroupKeyEpoch, Error> {
    let plaintext = pairwise.unwrap(sender_device, &message.wrapped_epoch_key).await?;
    let mut proto = EpochKeyProto::decode(plaintext.as_slice())?;
    let epoch = GroupKeyEpoch::from_proto(&proto);
    proto.key.zeroize();
    let epoch = epoch?;

    if epoch.group_id() != message.group_id
        || epoch.channel_id() != message.channel_id
        || epoch.version() != message.epoch_version
    {
        return Err(Error::Protocol(
            "distribution message does not match the wrapped epoch".to_string(),
        ));
    }
    Ok(epoch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const PAD: u8 = 0x5a;

    fn members(devices: &[&str]) -> Vec<DeviceId> {
        devices.iter().map(|device| device.to_string()).collect()
    }

    /// Records what was wrapped for whom and reverses a byte-wise xor.
    #[derive(Default)]
    struct XorChannel {
        wrapped_for: Mutex<Vec<String>>,
        refuse: Option<&'static str>,
    }

    #[async_trait]
    impl PairwiseChannel for XorChannel {
        async fn wrap(&self, device: &str, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
            if self.refuse == Some(device) {
                return Err(Error::SessionNotFound {
                    local: "a".to_string(),
                    remote: device.to_string(),
                });
            }
            self.wrapped_for.lock().unwrap().push(device.to_string());
            Ok(plaintext.iter().map(|byte| byte ^ PAD).collect())
        }

        async fn unwrap(&self, _device: &str, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
            Ok(Zeroizing::new(wrapped.iter().map(|byte| byte ^ PAD).collect()))
        }
    }

    #[tokio::test]
    async fn test_distribution_skips_local_device() {
        let epoch = GroupKeyEpoch::generate("g", "c", 3, members(&["a", "b", "c"])).unwrap();
        let channel = XorChannel::default();

        let messages = distribute_epoch(&epoch, "a", ["a", "b", "c"], &channel)
            .await
            .unwrap();
        assert_eq!(*channel.wrapped_for.lock().unwrap(), vec!["b", "c"]);
        let recipients: Vec<&str> = messages.iter().map(|(device, _)| device.as_str()).collect();
        assert_eq!(recipients, vec!["b", "c"]);

        let received = receive_distribution(&messages[0].1, "a", &channel).await.unwrap();
        assert_eq!(received.version(), 3);
        assert_eq!(
            *received.sender_key("a").unwrap(),
            *epoch.sender_key("a").unwrap()
        );
        assert_eq!(received.members(), epoch.members());
    }

    #[tokio::test]
    async fn test_missing_session_aborts_distribution() {
        let epoch = GroupKeyEpoch::generate("g", "c", 1, members(&["a", "b", "c"])).unwrap();
        let channel = XorChannel {
            refuse: Some("c"),
            ..Default::default()
        };

        let result = distribute_epoch(&epoch, "a", ["b", "c"], &channel).await;
        assert!(matches!(result, Err(Error::SessionNotFound { .. })));
    }

    #[tokio::test]
    async fn test_mismatched_header_is_rejected() {
        let epoch = GroupKeyEpoch::generate("g", "c", 1, members(&["a", "b", "c"])).unwrap();
        let channel = XorChannel::default();
        let mut messages = distribute_epoch(&epoch, "a", ["b"], &channel).await.unwrap();

        let (_, mut message) = messages.remove(0);
        message.epoch_version = 2;
        assert!(matches!(
            receive_distribution(&message, "a", &channel).await,
            Err(Error::Protocol(_))
        ));
    }
}
