use std::time::Duration;

/// Tunables shared by the key manager, ratchet, group cipher and fan-out queue.
#[derive(Clone, Debug)]
pub struct Config {
    /// Upper bound of skipped message keys cached per session.
    pub max_skipped_messages: u32,
    /// How long a signed pre-key stays current before rotation.
    pub signed_pre_key_rotation_interval: Duration,
    /// How long a rotated signed pre-key still answers in-flight handshakes.
    pub signed_pre_key_grace_period: Duration,
    /// Replenish the one-time pre-key pool when it falls below this.
    pub min_one_time_pre_keys: usize,
    /// Size of a freshly replenished one-time pre-key pool.
    pub max_one_time_pre_keys: usize,
    /// Application info mixed into every KDF for domain separation.
    pub protocol_info: Vec<u8>,
    /// Send attempts after the first failure before an entry stays `failed`.
    pub max_retries: u32,
    /// First retry delay; doubled on every further failure.
    pub retry_base_delay: Duration,
    /// Cap of the exponential backoff.
    pub retry_max_delay: Duration,
    /// After this, a sent message counts as best-effort delivered.
    pub delivery_timeout: Duration,
    /// Superseded group epochs kept for in-flight messages.
    pub retained_group_epochs: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_skipped_messages: 1000,
            signed_pre_key_rotation_interval: Duration::from_secs(30 * 24 * 60 * 60), // 30 days
            signed_pre_key_grace_period: Duration::from_secs(7 * 24 * 60 * 60), // 1 week
            min_one_time_pre_keys: 10,
            max_one_time_pre_keys: 100,
            protocol_info: b"Hushwire-E2E-v1".to_vec(),
            max_retries: 5,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(5 * 60),
            delivery_timeout: Duration::from_secs(30),
            retained_group_epochs: 1,
        }
    }
}
