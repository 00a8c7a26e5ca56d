/// Errors that can occur while establishing sessions or moving messages.
///
/// Verification failures ([`Error::InvalidSignature`],
/// [`Error::AuthenticationFailed`]) are never retried: they mean corruption or
/// an active attacker, and the caller should show a placeholder instead of the
/// message. Availability failures are retried by the fan-out coordinator.
#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum Error {
    /// The signed pre-key signature does not verify against the identity key.
    #[error("Signed pre-key signature is invalid")]
    InvalidSignature,

    /// A key bundle is missing its identity or signed pre-key, or was already spent.
    #[error("Key bundle is incomplete: {0}")]
    BundleIncomplete(String),

    /// A one-time pre-key was handed out before.
    #[error("One-time pre-key {0} was already consumed")]
    KeyAlreadyConsumed(u32),

    /// No session exists for the (local, remote) pair.
    #[error("No session between {local} and {remote}")]
    SessionNotFound {
        /// Local device id.
        local: String,
        /// Remote device id.
        remote: String,
    },

    /// AEAD tag mismatch. No chain state was advanced.
    #[error("Message authentication failed")]
    AuthenticationFailed,

    /// The message key was already consumed, evicted, or is outside the skip window.
    #[error("Message key {0} is not available")]
    MessageKeyNotCached(u32),

    /// A group message references an epoch this device never received.
    #[error("Unknown epoch {version} for group {group_id}/{channel_id}")]
    EpochUnknown {
        /// Group id.
        group_id: String,
        /// Channel id.
        channel_id: String,
        /// Epoch version carried by the message.
        version: u64,
    },

    /// An outbound message failed on every attempt its retry budget allowed.
    #[error("Message {0} exhausted its retries")]
    QueueExhaustedRetries(String),

    /// A known peer presented a different long-term identity key.
    #[error("Identity key of {0} changed and must be re-verified")]
    IdentityKeyChanged(String),

    /// The referenced pre-key does not exist or its private half was purged.
    #[error("Unknown pre-key {0}")]
    UnknownPreKey(u32),

    /// A queue entry cannot move between the given states.
    #[error("Invalid queue transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: &'static str,
        /// Requested status.
        to: &'static str,
    },

    /// No queue entry with this id.
    #[error("Queue entry {0} not found")]
    QueueEntryNotFound(String),

    /// A cryptographic operation failed.
    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),

    /// A protocol rule was violated.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Random number generation failed.
    #[error("Random number generation failed")]
    Random,

    /// Serialization or deserialization failed.
    #[error("Serialization/deserialization failed: {0}")]
    Serde(String),

    /// The durable store rejected an operation.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The relay or directory could not be reached.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Whether the fan-out coordinator may retry the operation with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::Transport(_) | Self::EpochUnknown { .. }
        )
    }

    /// Whether this is a cryptographic verification failure to surface as a
    /// "could not be decrypted" placeholder.
    pub fn is_verification_failure(&self) -> bool {
        matches!(self, Self::InvalidSignature | Self::AuthenticationFailed)
    }
}

impl From<aes_gcm_siv::Error> for Error {
    fn from(value: aes_gcm_siv::Error) -> Self {
        Self::Crypto(value.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(value: prost::DecodeError) -> Self {
        Self::Serde(value.to_string())
    }
}
