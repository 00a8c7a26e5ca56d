use crate::Error;
use crate::types::X25519PublicKey;

pub(crate) const HEADER_LEN: usize = 40;

/// Plaintext ratchet header. It is authenticated as associated data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    /// Sender's current ratchet public key.
    pub ratchet_key: X25519PublicKey,
    /// Number of messages in the sender's previous sending chain.
    pub previous_chain_length: u32,
    /// Index of this message in the current sending chain.
    pub message_number: u32,
}

impl MessageHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..32].copy_from_slice(self.ratchet_key.as_bytes());
        bytes[32..36].copy_from_slice(&self.previous_chain_length.to_be_bytes());
        bytes[36..40].copy_from_slice(&self.message_number.to_be_bytes());

        bytes
    }
}

impl From<[u8; HEADER_LEN]> for MessageHeader {
    fn from(bytes: [u8; HEADER_LEN]) -> Self {
        let mut dh_bytes = [0u8; 32];
        dh_bytes.copy_from_slice(&bytes[0..32]);

        let mut pn_bytes = [0u8; 4];
        pn_bytes.copy_from_slice(&bytes[32..36]);

        let mut n_bytes = [0u8; 4];
        n_bytes.copy_from_slice(&bytes[36..40]);

        Self {
            ratchet_key: X25519PublicKey::from(dh_bytes),
            previous_chain_length: u32::from_be_bytes(pn_bytes),
            message_number: u32::from_be_bytes(n_bytes),
        }
    }
}

/// An encrypted message in the Double Ratchet protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RatchetMessage {
    pub header: MessageHeader,
    /// AEAD output: encrypted payload followed by the tag.
    pub ciphertext: Vec<u8>,
}

impl RatchetMessage {
    /// Serializes the message to bytes for transmission.
    ///
    /// Format: [header (40 bytes)][ciphertext]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(HEADER_LEN + self.ciphertext.len());
        result.extend_from_slice(&self.header.to_bytes());
        result.extend_from_slice(&self.ciphertext);

        result
    }

    /// Deserializes a message from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::Protocol("Invalid message format".to_string()));
        }

        let (header, ciphertext) = bytes.split_at(HEADER_LEN);
        let mut header_bytes = [0u8; HEADER_LEN];
        header_bytes.copy_from_slice(header);

        Ok(Self {
            header: MessageHeader::from(header_bytes),
            ciphertext: ciphertext.to_vec(),
        })
    }
}
