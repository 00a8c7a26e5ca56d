//! The unit handed to the relay.
//!
//! An envelope never carries plaintext. Its payload is one of a closed set of
//! ciphertext kinds, so adding a kind is a compile-time change.

use crate::group::{EpochRequest, GroupMessage, SenderKeyDistributionMessage};
use crate::proto::{envelope_proto, EnvelopeProto, GroupAddressProto};
use crate::ratchet::RatchetMessage;
use crate::session::{PreKeyMessage, SessionCiphertext};
use crate::types::{generate_message_id, DeviceId, Timestamp};
use crate::Error;
use prost::Message;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Destination {
    Device(DeviceId),
    Group { group_id: String, channel_id: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    PreKey(PreKeyMessage),
    Ratchet(RatchetMessage),
    Group(GroupMessage),
    SenderKeyDistribution(SenderKeyDistributionMessage),
    EpochRequest(EpochRequest),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PreKey(_) => "pre_key",
            Self::Ratchet(_) => "ratchet",
            Self::Group(_) => "group",
            Self::SenderKeyDistribution(_) => "sender_key_distribution",
            Self::EpochRequest(_) => "epoch_request",
        }
    }
}

impl From<SessionCiphertext> for Payload {
    fn from(value: SessionCiphertext) -> Self {
        match value {
            SessionCiphertext::PreKey(message) => Self::PreKey(message),
            SessionCiphertext::Ratchet(message) => Self::Ratchet(message),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub id: String,
    pub sender_id: DeviceId,
    pub destination: Destination,
    pub payload: Payload,
    pub created_at: Timestamp,
    pub delivered: bool,
}

impl Envelope {
    /// Creates an undelivered envelope with a fresh random id.
    pub fn new(
        sender_id: &str,
        destination: Destination,
        payload: Payload,
        now: Timestamp,
    ) -> Result<Self, Error> {
        Ok(Self {
            id: generate_message_id()?,
            sender_id: sender_id.to_string(),
            destination,
            payload,
            created_at: now,
            delivered: false,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        EnvelopeProto::from(self).encode_to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Self::try_from(EnvelopeProto::decode(bytes)?)
    }
}

impl From<&Envelope> for EnvelopeProto {
    fn from(value: &Envelope) -> Self {
        let destination = match &value.destination {
            Destination::Device(device) => envelope_proto::Destination::Device(device.clone()),
            Destination::Group {
                group_id,
                channel_id,
            } => envelope_proto::Destination::Group(GroupAddressProto {
                group_id: group_id.clone(),
                channel_id: channel_id.clone(),
            }),
        };
        let payload = match &value.payload {
            Payload::PreKey(message) => envelope_proto::Payload::PreKey(message.into()),
            Payload::Ratchet(message) => envelope_proto::Payload::Ratchet(message.to_bytes()),
            Payload::Group(message) => envelope_proto::Payload::Group(message.into()),
            Payload::SenderKeyDistribution(message) => {
                envelope_proto::Payload::SenderKeyDistribution(message.into())
            }
            Payload::EpochRequest(request) => envelope_proto::Payload::EpochRequest(request.into()),
        };

        Self {
            id: value.id.clone(),
            sender_id: value.sender_id.clone(),
            destination: Some(destination),
            payload: Some(payload),
            created_at: value.created_at,
            delivered: value.delivered,
        }
    }
}

impl TryFrom<EnvelopeProto> for Envelope {
    type Error = Error;

    fn try_from(value: EnvelopeProto) -> Result<Self, Self::Error> {
        let destination = match value.destination {
            Some(envelope_proto::Destination::Device(device)) => Destination::Device(device),
            Some(envelope_proto::Destination::Group(address)) => Destination::Group {
                group_id: address.group_id,
                channel_id: address.channel_id,
            },
            None => return Err(Error::Protocol("envelope without destination".to_string())),
        };
        let payload = match value.payload {
            Some(envelope_proto::Payload::PreKey(message)) => {
                Payload::PreKey(PreKeyMessage::try_from(&message)?)
            }
            Some(envelope_proto::Payload::Ratchet(bytes)) => {
                Payload::Ratchet(RatchetMessage::from_bytes(&bytes)?)
            }
            Some(envelope_proto::Payload::Group(message)) => Payload::Group(message.into()),
            Some(envelope_proto::Payload::SenderKeyDistribution(message)) => {
                Payload::SenderKeyDistribution(message.into())
            }
            Some(envelope_proto::Payload::EpochRequest(request)) => {
                Payload::EpochRequest(request.into())
            }
            None => return Err(Error::Protocol("envelope without payload".to_string())),
        };

        Ok(Self {
            id: value.id,
            sender_id: value.sender_id,
            destination,
            payload,
            created_at: value.created_at,
            delivered: value.delivered,
        })
    }
}
