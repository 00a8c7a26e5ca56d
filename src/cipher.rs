//! AEAD sealing under single-use message keys.
//!
//! A message key is expanded with HKDF into an AES-256-GCM-SIV key and nonce.
//! Every message key encrypts exactly one message, so the derived nonce never
//! repeats under the same key.

use crate::Error;
use aes_gcm_siv::aead::{Aead, Payload};
use aes_gcm_siv::{Aes256GcmSiv, Key, KeyInit, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12; // AES-GCM-SIV uses 12-byte (96-bit) nonces

fn cipher_for(message_key: &[u8; 32], info: &[u8]) -> Result<(Aes256GcmSiv, [u8; NONCE_SIZE]), Error> {
    let hkdf = Hkdf::<Sha256>::new(None, message_key);

    let mut derived_material = Zeroizing::new([0u8; KEY_SIZE + NONCE_SIZE]);
    hkdf.expand(info, derived_material.as_mut_slice())
        .map_err(|_| Error::Crypto("HKDF expansion failed".to_string()))?;

    let cipher = Aes256GcmSiv::new(Key::<Aes256GcmSiv>::from_slice(&derived_material[..KEY_SIZE]));
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&derived_material[KEY_SIZE..]);

    Ok((cipher, nonce))
}

/// Encrypts `plaintext` and authenticates it together with `aad`.
pub(crate) fn seal(
    message_key: &[u8; 32],
    info: &[u8],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, Error> {
    let (cipher, nonce) = cipher_for(message_key, info)?;
    cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| Error::Crypto("Message encryption failed".to_string()))
}

/// Decrypts `ciphertext`. Any tag mismatch is [`Error::AuthenticationFailed`].
pub(crate) fn open(
    message_key: &[u8; 32],
    info: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, Error> {
    let (cipher, nonce) = cipher_for(message_key, info)?;
    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| Error::AuthenticationFailed)
}
