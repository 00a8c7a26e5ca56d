//! Protocol Buffers messages for persisted state and wire payloads.
//!
//! Field tags are part of the storage format and must never be reused.

/// Public identity of a device.
#[derive(Clone, PartialEq, prost::Message)]
pub struct IdentityPublicKeyProto {
    #[prost(bytes = "vec", tag = "1")]
    pub dh_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub signing_key: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SignedPreKeyPublicProto {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub public_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub signature: Vec<u8>,
    #[prost(uint64, tag = "4")]
    pub created_at: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct OneTimePreKeyPublicProto {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub public_key: Vec<u8>,
}

/// Bundle as served by the key directory. Every field is optional on the wire.
#[derive(Clone, PartialEq, prost::Message)]
pub struct KeyBundleProto {
    #[prost(message, optional, tag = "1")]
    pub identity: Option<IdentityPublicKeyProto>,
    #[prost(message, optional, tag = "2")]
    pub signed_pre_key: Option<SignedPreKeyPublicProto>,
    #[prost(message, optional, tag = "3")]
    pub one_time_pre_key: Option<OneTimePreKeyPublicProto>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SignedPreKeyRecord {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    /// Empty once the private half was purged.
    #[prost(bytes = "vec", tag = "2")]
    pub private_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub signature: Vec<u8>,
    #[prost(uint64, tag = "4")]
    pub created_at: u64,
    #[prost(uint64, optional, tag = "5")]
    pub retired_at: Option<u64>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct OneTimePreKeyRecord {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    /// Empty once consumed.
    #[prost(bytes = "vec", tag = "2")]
    pub private_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub public_key: Vec<u8>,
    #[prost(bool, tag = "4")]
    pub consumed: bool,
}

/// All private key material of the local device.
#[derive(Clone, PartialEq, prost::Message)]
pub struct KeyMaterialProto {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub identity: Vec<u8>,
    #[prost(message, repeated, tag = "3")]
    pub signed_pre_keys: Vec<SignedPreKeyRecord>,
    #[prost(message, repeated, tag = "4")]
    pub one_time_pre_keys: Vec<OneTimePreKeyRecord>,
    #[prost(uint32, optional, tag = "5")]
    pub current_signed_pre_key_id: Option<u32>,
    #[prost(uint32, tag = "6")]
    pub next_signed_pre_key_id: u32,
    #[prost(uint32, tag = "7")]
    pub next_one_time_pre_key_id: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ChainProto {
    #[prost(bytes = "vec", tag = "1")]
    pub chain_key: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub index: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SkippedKeyProto {
    #[prost(bytes = "vec", tag = "1")]
    pub ratchet_key: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub message_number: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub message_key: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RatchetProto {
    #[prost(bytes = "vec", tag = "1")]
    pub dh_private: Vec<u8>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub remote_ratchet_key: Option<Vec<u8>>,
    #[prost(bytes = "vec", tag = "3")]
    pub root_key: Vec<u8>,
    #[prost(message, optional, tag = "4")]
    pub sending_chain: Option<ChainProto>,
    #[prost(message, optional, tag = "5")]
    pub receiving_chain: Option<ChainProto>,
    #[prost(uint32, tag = "6")]
    pub previous_sending_chain_length: u32,
    #[prost(bytes = "vec", tag = "7")]
    pub associated_data: Vec<u8>,
    /// Oldest first.
    #[prost(message, repeated, tag = "8")]
    pub skipped_keys: Vec<SkippedKeyProto>,
    #[prost(bytes = "vec", repeated, tag = "9")]
    pub retired_ratchet_keys: Vec<Vec<u8>>,
    #[prost(uint32, tag = "10")]
    pub max_skip: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct InitiatorHeaderProto {
    #[prost(message, optional, tag = "1")]
    pub identity: Option<IdentityPublicKeyProto>,
    #[prost(bytes = "vec", tag = "2")]
    pub ephemeral_key: Vec<u8>,
    #[prost(uint32, tag = "3")]
    pub signed_pre_key_id: u32,
    #[prost(uint32, optional, tag = "4")]
    pub one_time_pre_key_id: Option<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SessionProto {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(string, tag = "2")]
    pub local_device: String,
    #[prost(string, tag = "3")]
    pub remote_device: String,
    #[prost(message, optional, tag = "4")]
    pub remote_identity: Option<IdentityPublicKeyProto>,
    #[prost(message, optional, tag = "5")]
    pub ratchet: Option<RatchetProto>,
    #[prost(message, optional, tag = "6")]
    pub pending_pre_key: Option<InitiatorHeaderProto>,
    #[prost(bytes = "vec", tag = "7")]
    pub base_key: Vec<u8>,
    #[prost(uint64, tag = "8")]
    pub created_at: u64,
    #[prost(uint64, tag = "9")]
    pub last_used_at: u64,
}

/// Every session held with one peer.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SessionRecordProto {
    #[prost(message, optional, tag = "1")]
    pub current: Option<SessionProto>,
    #[prost(message, repeated, tag = "2")]
    pub previous: Vec<SessionProto>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PinnedIdentityProto {
    #[prost(message, optional, tag = "1")]
    pub trusted: Option<IdentityPublicKeyProto>,
    #[prost(message, optional, tag = "2")]
    pub pending: Option<IdentityPublicKeyProto>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct EpochKeyProto {
    #[prost(string, tag = "1")]
    pub group_id: String,
    #[prost(string, tag = "2")]
    pub channel_id: String,
    #[prost(uint64, tag = "3")]
    pub version: u64,
    #[prost(bytes = "vec", tag = "4")]
    pub key: Vec<u8>,
    /// Member set the epoch was created for.
    #[prost(string, repeated, tag = "5")]
    pub members: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SenderStateProto {
    #[prost(string, tag = "1")]
    pub sender_id: String,
    #[prost(uint32, tag = "2")]
    pub next_index: u32,
    #[prost(uint32, optional, tag = "3")]
    pub highest_seen: Option<u32>,
    #[prost(uint64, tag = "4")]
    pub seen_window: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct EpochStateProto {
    #[prost(message, optional, tag = "1")]
    pub epoch: Option<EpochKeyProto>,
    #[prost(message, repeated, tag = "2")]
    pub senders: Vec<SenderStateProto>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GroupChannelProto {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(string, tag = "2")]
    pub group_id: String,
    #[prost(string, tag = "3")]
    pub channel_id: String,
    #[prost(string, repeated, tag = "4")]
    pub members: Vec<String>,
    #[prost(uint64, optional, tag = "5")]
    pub current_version: Option<u64>,
    #[prost(message, repeated, tag = "6")]
    pub epochs: Vec<EpochStateProto>,
    #[prost(uint32, tag = "7")]
    pub retained_epochs: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PreKeyMessageProto {
    #[prost(message, optional, tag = "1")]
    pub header: Option<InitiatorHeaderProto>,
    #[prost(bytes = "vec", tag = "2")]
    pub message: Vec<u8>,
}

/// Output of a pairwise session: a pre-key message until the peer answered, then plain ratchet messages.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SessionCiphertextProto {
    #[prost(oneof = "session_ciphertext_proto::Kind", tags = "1, 2")]
    pub kind: Option<session_ciphertext_proto::Kind>,
}

pub mod session_ciphertext_proto {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        PreKey(super::PreKeyMessageProto),
        #[prost(bytes, tag = "2")]
        Ratchet(Vec<u8>),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GroupMessageProto {
    #[prost(string, tag = "1")]
    pub group_id: String,
    #[prost(string, tag = "2")]
    pub channel_id: String,
    #[prost(uint64, tag = "3")]
    pub epoch_version: u64,
    #[prost(string, tag = "4")]
    pub sender_id: String,
    #[prost(uint32, tag = "5")]
    pub index: u32,
    #[prost(bytes = "vec", tag = "6")]
    pub ciphertext: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SenderKeyDistributionProto {
    #[prost(string, tag = "1")]
    pub group_id: String,
    #[prost(string, tag = "2")]
    pub channel_id: String,
    #[prost(uint64, tag = "3")]
    pub epoch_version: u64,
    /// Encoded [`SessionCiphertextProto`] carrying an [`EpochKeyProto`].
    #[prost(bytes = "vec", tag = "4")]
    pub wrapped_epoch_key: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct EpochRequestProto {
    #[prost(string, tag = "1")]
    pub group_id: String,
    #[prost(string, tag = "2")]
    pub channel_id: String,
    #[prost(uint64, tag = "3")]
    pub version: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GroupAddressProto {
    #[prost(string, tag = "1")]
    pub group_id: String,
    #[prost(string, tag = "2")]
    pub channel_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct EnvelopeProto {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub sender_id: String,
    #[prost(oneof = "envelope_proto::Destination", tags = "3, 4")]
    pub destination: Option<envelope_proto::Destination>,
    #[prost(oneof = "envelope_proto::Payload", tags = "5, 6, 7, 8, 11")]
    pub payload: Option<envelope_proto::Payload>,
    #[prost(uint64, tag = "9")]
    pub created_at: u64,
    #[prost(bool, tag = "10")]
    pub delivered: bool,
}

pub mod envelope_proto {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Destination {
        #[prost(string, tag = "3")]
        Device(String),
        #[prost(message, tag = "4")]
        Group(super::GroupAddressProto),
    }

    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "5")]
        PreKey(super::PreKeyMessageProto),
        #[prost(bytes, tag = "6")]
        Ratchet(Vec<u8>),
        #[prost(message, tag = "7")]
        Group(super::GroupMessageProto),
        #[prost(message, tag = "8")]
        SenderKeyDistribution(super::SenderKeyDistributionProto),
        #[prost(message, tag = "11")]
        EpochRequest(super::EpochRequestProto),
    }
}
