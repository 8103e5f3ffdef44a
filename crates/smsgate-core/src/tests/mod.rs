pub mod sync_tests;

use crate::backend::InMemoryBackend;
use crate::config::CoreConfig;
use crate::device::{DeviceIdentity, InMemoryDeviceLookup};
use crate::policy::SyncPolicy;
use crate::queue::RetryPolicy;
use crate::record::MessageRecord;
use crate::store::LocalStore;
use crate::time::ManualClock;
use crate::Gateway;
use smsgate_api::InboundSms;
use std::sync::Arc;

pub const START_MS: u64 = 1_700_000_100_000;

pub struct Harness {
    pub gateway: Gateway,
    pub backend: InMemoryBackend,
    pub clock: ManualClock,
    pub lookup: InMemoryDeviceLookup,
}

pub fn test_config() -> CoreConfig {
    CoreConfig {
        sync_interval_ms: 0,
        ..CoreConfig::in_memory()
    }
}

pub fn test_policy() -> SyncPolicy {
    SyncPolicy {
        max_retries: 2,
        backoff_initial_ms: 1_000,
        backoff_max_ms: 60_000,
        backoff_jitter: false,
        send_timeout_ms: 2_000,
        ..SyncPolicy::default()
    }
}

pub fn device() -> DeviceIdentity {
    DeviceIdentity {
        device_id: "dev-kigali-01".to_string(),
        device_secret: "s3cret".to_string(),
        enabled: true,
    }
}

pub fn sms(sender: &str, body: &str, received_at: u64) -> InboundSms {
    InboundSms {
        sender: sender.to_string(),
        body: body.to_string(),
        received_at,
        sim_slot: None,
    }
}

pub async fn harness_with(
    config: CoreConfig,
    policy: SyncPolicy,
    backend: InMemoryBackend,
) -> Harness {
    let clock = ManualClock::new(START_MS);
    let lookup = InMemoryDeviceLookup::new();
    let gateway = Gateway::init(
        config,
        policy,
        Arc::new(backend.clone()),
        Arc::new(lookup.clone()),
        Arc::new(clock.clone()),
    )
    .await
    .expect("gateway");
    Harness {
        gateway,
        backend,
        clock,
        lookup,
    }
}

/// Gateway with a usable device identity installed.
pub async fn harness(policy: SyncPolicy, backend: InMemoryBackend) -> Harness {
    let h = harness_with(test_config(), policy, backend).await;
    h.gateway.configure_device(Some(device())).await;
    h
}

pub fn store(policy: &SyncPolicy) -> (LocalStore, ManualClock) {
    let clock = ManualClock::new(START_MS);
    let store =
        LocalStore::open_in_memory(RetryPolicy::from_policy(policy), Arc::new(clock.clone()))
            .expect("store");
    (store, clock)
}

pub async fn stored(store: &LocalStore, sender: &str, body: &str, received_at: u64) -> String {
    let record = MessageRecord::capture(&sms(sender, body, received_at), store.now_ms());
    store.insert_if_absent(&record).await.expect("insert");
    record.fingerprint
}
