mod x25519;
pub use x25519::*;

use crate::Error;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::TryRngCore;
use rand::rngs::OsRng;
use std::time::{SystemTime, UNIX_EPOCH};
use zeroize::Zeroizing;

/// Identifier of a single device. A user with several devices has one id per device.
pub type DeviceId = String;

/// Seconds since the Unix epoch.
pub type Timestamp = u64;

/// A 32-byte symmetric secret that is wiped when dropped.
pub(crate) type SymmetricKey = Zeroizing<[u8; 32]>;

/// Generates a cryptographically secure random 32-byte seed.
pub(crate) fn generate_random_seed() -> Result<Zeroizing<[u8; 32]>, Error> {
    let mut seed = Zeroizing::new([0u8; 32]);
    OsRng
        .try_fill_bytes(seed.as_mut_slice())
        .map_err(|_| Error::Random)?;
    Ok(seed)
}

/// Random, URL-safe identifier for envelopes and queue entries.
pub(crate) fn generate_message_id() -> Result<String, Error> {
    let mut bytes = [0u8; 16];
    OsRng.try_fill_bytes(&mut bytes).map_err(|_| Error::Random)?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Current wall-clock time as a [`Timestamp`].
pub fn now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Copies a slice into a fixed-size array, naming `what` in the error.
pub(crate) fn to_array<const N: usize>(bytes: &[u8], what: &str) -> Result<[u8; N], Error> {
    bytes
        .try_into()
        .map_err(|_| Error::Serde(format!("{what} must be {N} bytes, got {}", bytes.len())))
}
