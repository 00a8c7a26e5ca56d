use crate::Error;
use crate::types::SymmetricKey;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

const MESSAGE_KEY_LABEL: &[u8] = b"msg";
const CHAIN_KEY_LABEL: &[u8] = b"chain";

/// Symmetric KDF chain of one sending or receiving direction.
///
/// Every step overwrites the chain key in place, so a superseded chain key is
/// never retained.
#[derive(Clone)]
pub(crate) struct Chain {
    chain_key: SymmetricKey,
    index: u32,
}

impl Chain {
    pub(crate) fn new(chain_key: SymmetricKey) -> Self {
        Self {
            chain_key,
            index: 0,
        }
    }

    pub(crate) fn restore(chain_key: SymmetricKey, index: u32) -> Self {
        Self { chain_key, index }
    }

    /// Index of the message key the next call to [`Chain::next`] yields.
    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn chain_key(&self) -> &[u8; 32] {
        &self.chain_key
    }

    /// Advances the chain and returns the message key for the current index.
    pub(crate) fn next(&mut self) -> Result<SymmetricKey, Error> {
        let message_key = derive(&self.chain_key, MESSAGE_KEY_LABEL)?;
        let next_chain_key = derive(&self.chain_key, CHAIN_KEY_LABEL)?;

        self.chain_key.copy_from_slice(next_chain_key.as_slice());
        self.index = self
            .index
            .checked_add(1)
            .ok_or_else(|| Error::Protocol("ratchet chain exhausted".to_string()))?;

        Ok(message_key)
    }
}

pub(crate) fn derive(key: &[u8; 32], label: &[u8]) -> Result<SymmetricKey, Error> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| Error::Crypto("HMAC initialization failed".to_string()))?;
    mac.update(label);

    let mut output = Zeroizing::new([0u8; 32]);
    output.copy_from_slice(&mac.finalize().into_bytes());
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_is_deterministic_and_advances() {
        let mut a = Chain::new(Zeroizing::new([1u8; 32]));
        let mut b = Chain::new(Zeroizing::new([1u8; 32]));

        let a0 = a.next().unwrap();
        let a1 = a.next().unwrap();
        assert_eq!(*a0, *b.next().unwrap());
        assert_eq!(*a1, *b.next().unwrap());
        assert_ne!(*a0, *a1);
        assert_eq!(a.index(), 2);
    }

    #[test]
    fn test_previous_message_key_not_derivable_from_current_chain_key() {
        let mut chain = Chain::new(Zeroizing::new([9u8; 32]));
        let first = chain.next().unwrap();

        // Running the chain forward from the new key never yields the old message key.
        let mut forward = Chain::new(Zeroizing::new(*chain.chain_key()));
        for _ in 0..32 {
            assert_ne!(*forward.next().unwrap(), *first);
        }
        assert_ne!(chain.chain_key(), &[9u8; 32]);
    }
}
