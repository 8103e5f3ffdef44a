use crate::backend::{BackendClient, OutboundMessage};
use crate::device::DeviceGate;
use crate::error::{BackendError, CoreError};
use crate::policy::SyncPolicy;
use crate::queue::SyncQueue;
use crate::record::MessageRecord;
use crate::store::{short, LocalStore};
use log::{debug, error, info, warn};
use smsgate_api::{DrainReport, SyncStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AttemptOutcome {
    Synced,
    Failed,
}

/// Drains the sync queue into the backend and records each outcome in the
/// store.
#[derive(Clone)]
pub struct SyncCoordinator {
    store: LocalStore,
    queue: SyncQueue,
    backend: Arc<dyn BackendClient>,
    device: DeviceGate,
    policy: SyncPolicy,
}

impl SyncCoordinator {
    pub fn new(
        store: LocalStore,
        backend: Arc<dyn BackendClient>,
        device: DeviceGate,
        policy: SyncPolicy,
    ) -> Self {
        Self {
            queue: SyncQueue::new(store.clone()),
            store,
            backend,
            device,
            policy,
        }
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    /// Run one drain cycle.
    ///
    /// Without a usable device identity nothing is touched and
    /// `DeviceNotConfigured` is returned. Backend failures are absorbed into
    /// the per-message state; storage failures abort the cycle.
    pub async fn drain_once(&self) -> Result<DrainReport, CoreError> {
        let device = self.device.current().await?;
        self.store
            .recover_stale(self.policy.stale_threshold_ms())
            .await?;
        let batch = self.queue.next_batch(self.policy.batch_size).await?;
        if batch.is_empty() {
            return Ok(DrainReport::default());
        }
        let limit = Arc::new(Semaphore::new(self.policy.max_in_flight.max(1)));
        let mut tasks = JoinSet::new();
        let mut report = DrainReport::default();
        let mut storage_error = None;
        for record in batch {
            let Ok(permit) = limit.clone().acquire_owned().await else {
                break;
            };
            match self.store.try_claim(&record.fingerprint).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("sync: {} already in flight, skipping", short(&record.fingerprint));
                    continue;
                }
                Err(err) => {
                    // Sends already spawned still have to be joined and recorded.
                    error!("sync: claim failed, stopping batch: {err}");
                    storage_error = Some(err);
                    break;
                }
            }
            report.attempted += 1;
            let this = self.clone();
            let device = device.clone();
            tasks.spawn(async move {
                let _permit = permit;
                this.attempt(&device, record).await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(AttemptOutcome::Synced)) => report.succeeded += 1,
                Ok(Ok(AttemptOutcome::Failed)) => report.failed += 1,
                Ok(Err(err)) => {
                    error!("sync: storage error while recording outcome: {err}");
                    storage_error.get_or_insert(err);
                }
                Err(join_err) => {
                    // No transition was recorded; the row stays SYNCING until
                    // stale recovery, so it is not counted as failed here.
                    error!("sync: send task aborted: {join_err}");
                }
            }
        }
        if let Some(err) = storage_error {
            return Err(err);
        }
        info!(
            "sync: attempted {} succeeded {} failed {}",
            report.attempted, report.succeeded, report.failed
        );
        Ok(report)
    }

    async fn attempt(
        &self,
        device: &crate::device::DeviceIdentity,
        record: MessageRecord,
    ) -> Result<AttemptOutcome, CoreError> {
        let message = OutboundMessage::from(&record);
        let timeout_ms = self.policy.send_timeout_ms;
        let sent = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.backend.send(device, &message),
        )
        .await
        .unwrap_or_else(|_| Err(BackendError::timeout(timeout_ms)));
        match sent {
            Ok(receipt) => {
                self.store
                    .mark_synced(&record.fingerprint, receipt.id.as_deref())
                    .await?;
                debug!(
                    "sync: {} accepted (id {:?}, parse {:?})",
                    short(&record.fingerprint),
                    receipt.id,
                    receipt.parse_status
                );
                Ok(AttemptOutcome::Synced)
            }
            Err(err) => {
                warn!("sync: {} failed: {}", short(&record.fingerprint), err);
                let detail = if err.retryable {
                    err.to_string()
                } else {
                    format!("{err} (rejected)")
                };
                self.store
                    .update_status(&record.fingerprint, SyncStatus::Failed, Some(&detail))
                    .await?;
                Ok(AttemptOutcome::Failed)
            }
        }
    }
}
