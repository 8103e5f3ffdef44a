use crate::error::CoreError;
use crate::policy::SyncPolicy;
use crate::record::MessageRecord;
use crate::store::LocalStore;
use rand::Rng;
use smsgate_api::SyncStatus;

/// Transitions accepted by the store.
///
/// `Failed -> Syncing` is the requeue and dispatch of a retry in one step; it
/// is recorded as passing through `Pending`.
pub fn transition_allowed(from: SyncStatus, to: SyncStatus, exhausted: bool) -> bool {
    match (from, to) {
        (SyncStatus::Pending, SyncStatus::Syncing) => true,
        (SyncStatus::Syncing, SyncStatus::Synced) => true,
        (SyncStatus::Syncing, SyncStatus::Failed) => true,
        (SyncStatus::Failed, SyncStatus::Pending) => !exhausted,
        (SyncStatus::Failed, SyncStatus::Syncing) => !exhausted,
        _ => false,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAt { retry_count: u32, next_attempt_at: u64 },
    Exhausted { retry_count: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_policy(policy: &SyncPolicy) -> Self {
        Self {
            max_retries: policy.max_retries,
            backoff_initial_ms: policy.backoff_initial_ms,
            backoff_max_ms: policy.backoff_max_ms,
            jitter: policy.backoff_jitter,
        }
    }

    /// Exponential delay for a record that has already been retried
    /// `retry_count` times, capped at `backoff_max_ms`.
    pub fn backoff_ms(&self, retry_count: u32) -> u64 {
        let factor = 1u64 << retry_count.min(16);
        let capped = self
            .backoff_initial_ms
            .saturating_mul(factor)
            .min(self.backoff_max_ms);
        if !self.jitter || capped < 2 {
            return capped;
        }
        let half = capped / 2;
        half + rand::thread_rng().gen_range(0..=capped - half)
    }

    /// Outcome of one more failed attempt for a record at `retry_count`.
    pub fn decide(&self, retry_count: u32, now_ms: u64) -> RetryDecision {
        if retry_count >= self.max_retries {
            return RetryDecision::Exhausted { retry_count };
        }
        RetryDecision::RetryAt {
            retry_count: retry_count + 1,
            next_attempt_at: now_ms.saturating_add(self.backoff_ms(retry_count)),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_policy(&SyncPolicy::default())
    }
}

/// Read view over the store listing records ready for (re)transmission.
#[derive(Clone)]
pub struct SyncQueue {
    store: LocalStore,
}

impl SyncQueue {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub async fn next_batch(&self, limit: usize) -> Result<Vec<MessageRecord>, CoreError> {
        self.store.fetch_pending(limit).await
    }

    pub async fn depth(&self) -> Result<u64, CoreError> {
        self.store.count_eligible().await
    }
}
