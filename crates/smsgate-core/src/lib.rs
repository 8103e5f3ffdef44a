pub mod backend;
pub mod config;
pub mod counters;
pub mod device;
pub mod error;
pub mod event;
pub mod fingerprint;
pub mod policy;
pub mod queue;
pub mod record;
pub mod store;
pub mod sync;
pub mod time;

use backend::BackendClient;
use config::CoreConfig;
use counters::SessionCounters;
use device::{DeviceGate, DeviceIdentity, DeviceLookup};
use error::CoreError;
use event::{StatsBus, StatsReceiver};
use log::{debug, info, warn};
use policy::SyncPolicy;
use queue::RetryPolicy;
use record::{AuditEntry, InsertOutcome, MessageRecord, UpdateOutcome};
use smsgate_api::{DrainReport, InboundSms, IngestOutcome, SessionCountersDto, SyncStats};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use store::{short, LocalStore, DB_FILE};
use sync::SyncCoordinator;
use time::Clock;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Entry point for capture, sync and reporting. Cheap to clone; clones share
/// the same store, counters and device identity.
#[derive(Clone)]
pub struct Gateway {
    config: CoreConfig,
    policy: SyncPolicy,
    store: LocalStore,
    coordinator: SyncCoordinator,
    device: DeviceGate,
    lookup: Arc<dyn DeviceLookup>,
    stats: StatsBus,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Gateway {
    pub async fn init(
        config: CoreConfig,
        policy: SyncPolicy,
        backend: Arc<dyn BackendClient>,
        lookup: Arc<dyn DeviceLookup>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CoreError> {
        let retry = RetryPolicy::from_policy(&policy);
        let store = if config.is_in_memory() {
            LocalStore::open_in_memory(retry, clock)?
        } else {
            LocalStore::open(&Path::new(&config.storage_path).join(DB_FILE), retry, clock)?
        };
        let device = DeviceGate::default();
        let coordinator =
            SyncCoordinator::new(store.clone(), backend, device.clone(), policy.clone());
        let gateway = Self {
            config: config.clone(),
            policy,
            store,
            coordinator,
            device,
            lookup,
            stats: StatsBus::new(),
            worker: Arc::new(Mutex::new(None)),
        };
        if let Some(phone) = config.device_phone.as_deref() {
            match gateway.resolve_device(phone).await {
                Ok(true) => info!("gateway: device resolved for configured phone"),
                Ok(false) => warn!("gateway: no usable device for configured phone"),
                Err(err) => warn!("gateway: device lookup failed: {err}"),
            }
        }
        gateway.publish_stats().await?;
        if gateway.config.sync_interval_ms > 0 {
            let every = Duration::from_millis(gateway.config.sync_interval_ms);
            *gateway.worker.lock().await = Some(gateway.start_sync_worker(every));
        }
        Ok(gateway)
    }

    /// Capture one inbound SMS. Storage only; never waits on the backend.
    pub async fn ingest(&self, sms: InboundSms) -> Result<IngestOutcome, CoreError> {
        smsgate_api::validation::validate_inbound(&sms, &self.policy.limits())
            .map_err(|e| CoreError::Validation(e.to_string()))?;
        let record = MessageRecord::capture(&sms, self.store.now_ms());
        let fingerprint = record.fingerprint.clone();
        let outcome = match self.store.insert_if_absent(&record).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.store.counters().record_error();
                return Err(err);
            }
        };
        self.publish_stats().await?;
        Ok(match outcome {
            InsertOutcome::Inserted => {
                debug!("gateway: captured {}", short(&fingerprint));
                IngestOutcome::Inserted { fingerprint }
            }
            InsertOutcome::Duplicate => {
                debug!("gateway: duplicate {}", short(&fingerprint));
                IngestOutcome::Duplicate { fingerprint }
            }
        })
    }

    pub async fn drain_once(&self) -> Result<DrainReport, CoreError> {
        let report = self.coordinator.drain_once().await?;
        self.publish_stats().await?;
        Ok(report)
    }

    pub async fn sync_stats(&self) -> Result<SyncStats, CoreError> {
        Ok(SyncStats::from(self.store.counts_by_status().await?))
    }

    /// Latest stats, updated after every ingest and drain.
    pub fn observe_stats(&self) -> StatsReceiver {
        self.stats.subscribe()
    }

    pub fn observe_sms_count(&self) -> watch::Receiver<u64> {
        self.counters().observe_sms()
    }

    pub fn observe_error_count(&self) -> watch::Receiver<u64> {
        self.counters().observe_errors()
    }

    pub fn session_counters(&self) -> SessionCountersDto {
        self.counters().snapshot()
    }

    pub async fn reset_counters(&self) -> Result<(), CoreError> {
        self.store.reset_counters().await
    }

    pub async fn configure_device(&self, identity: Option<DeviceIdentity>) {
        self.device.set(identity).await;
    }

    pub async fn resolve_device(&self, phone: &str) -> Result<bool, CoreError> {
        self.device.refresh(self.lookup.as_ref(), phone).await
    }

    pub async fn device_configured(&self) -> bool {
        self.device.is_configured().await
    }

    pub async fn permanently_failed(
        &self,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, CoreError> {
        self.store.list_permanently_failed(limit).await
    }

    pub async fn requeue(&self, fingerprint: &str) -> Result<(), CoreError> {
        smsgate_api::validation::validate_fingerprint(fingerprint)
            .map_err(|e| CoreError::Validation(e.to_string()))?;
        match self.store.requeue_failed(fingerprint).await? {
            UpdateOutcome::Updated => {
                self.publish_stats().await?;
                Ok(())
            }
            UpdateOutcome::NotFound => Err(CoreError::NotFound),
        }
    }

    pub async fn audit_log(&self, limit: usize) -> Result<Vec<AuditEntry>, CoreError> {
        self.store.list_audit(limit).await
    }

    pub async fn record_security_event(&self, detail: &str) -> Result<i64, CoreError> {
        self.store.record_security_event(detail).await
    }

    pub async fn message(&self, fingerprint: &str) -> Result<Option<MessageRecord>, CoreError> {
        self.store.get(fingerprint).await
    }

    pub async fn queue_depth(&self) -> Result<u64, CoreError> {
        self.coordinator.queue().depth().await
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    /// Drain on a fixed period until the returned handle is aborted.
    pub fn start_sync_worker(&self, every: Duration) -> JoinHandle<()> {
        let cloned = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match cloned.drain_once().await {
                    Ok(report) if report.attempted > 0 => {
                        debug!("worker: drained {} record(s)", report.attempted)
                    }
                    Ok(_) => {}
                    Err(CoreError::DeviceNotConfigured) => {
                        debug!("worker: device not configured, skipping cycle")
                    }
                    Err(err) => {
                        warn!("worker: drain failed: {err}");
                        cloned.counters().record_error();
                    }
                }
            }
        })
    }

    /// Abort the worker started by `init`. Returns `false` when none was
    /// running.
    pub async fn stop_sync_worker(&self) -> bool {
        match self.worker.lock().await.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    fn counters(&self) -> &SessionCounters {
        self.store.counters()
    }

    async fn publish_stats(&self) -> Result<(), CoreError> {
        let stats = self.sync_stats().await?;
        self.stats.publish(stats);
        Ok(())
    }
}

#[cfg(test)]
mod tests;
