use serde::{Deserialize, Serialize};
use smsgate_api::ValidationLimits;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SyncPolicy {
    pub max_retries: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_jitter: bool,
    pub batch_size: usize,
    pub max_in_flight: usize,
    pub send_timeout_ms: u64,
    pub stale_syncing_ms: u64,
    pub max_body_bytes: usize,
    pub max_sender_len: usize,
}

impl SyncPolicy {
    /// Age after which a `Syncing` record counts as abandoned. Never shorter
    /// than twice the send timeout, so a send still running is not reclaimed.
    pub fn stale_threshold_ms(&self) -> u64 {
        self.stale_syncing_ms.max(self.send_timeout_ms.saturating_mul(2))
    }

    pub fn limits(&self) -> ValidationLimits {
        ValidationLimits {
            max_body_bytes: self.max_body_bytes,
            max_sender_len: self.max_sender_len,
        }
    }
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_initial_ms: 2_000,
            backoff_max_ms: 10 * 60 * 1000,
            backoff_jitter: true,
            batch_size: 50,
            max_in_flight: 4,
            send_timeout_ms: 30_000,
            stale_syncing_ms: 5 * 60 * 1000,
            max_body_bytes: 16 * 1024,
            max_sender_len: 64,
        }
    }
}
