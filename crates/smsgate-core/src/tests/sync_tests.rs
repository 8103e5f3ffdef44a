use super::{device, harness, harness_with, sms, test_config, test_policy};
use crate::backend::{InMemoryBackend, ScriptedReply};
use crate::config::CoreConfig;
use crate::device::DeviceIdentity;
use crate::error::{BackendError, CoreError};
use crate::policy::SyncPolicy;
use smsgate_api::{AuditEventType, DrainReport, SyncStatus};

#[tokio::test]
async fn drain_without_device_touches_nothing() {
    let h = harness_with(test_config(), test_policy(), InMemoryBackend::new()).await;
    let outcome = h
        .gateway
        .ingest(sms("+250788000111", "TXN 1000 RWF", 1_700_000_000_000))
        .await
        .expect("ingest");

    let err = h.gateway.drain_once().await.expect_err("no device");
    assert!(matches!(err, CoreError::DeviceNotConfigured));
    assert_eq!(h.backend.received_len().await, 0);

    let record = h
        .gateway
        .message(outcome.fingerprint())
        .await
        .expect("get")
        .expect("stored");
    assert_eq!(record.sync_status, SyncStatus::Pending);
    assert_eq!(record.retry_count, 0);
    assert!(record.last_attempt_at.is_none());
}

#[tokio::test]
async fn disabled_device_is_not_usable() {
    let h = harness_with(test_config(), test_policy(), InMemoryBackend::new()).await;
    h.gateway
        .configure_device(Some(DeviceIdentity {
            enabled: false,
            ..device()
        }))
        .await;
    h.gateway.ingest(sms("MTN", "x", 1)).await.expect("ingest");
    assert!(matches!(
        h.gateway.drain_once().await,
        Err(CoreError::DeviceNotConfigured)
    ));
}

#[tokio::test]
async fn empty_queue_drain_is_noop() {
    let h = harness(test_policy(), InMemoryBackend::new()).await;
    let report = h.gateway.drain_once().await.expect("drain");
    assert_eq!(report, DrainReport::default());
    assert_eq!(h.backend.received_len().await, 0);
}

#[tokio::test]
async fn drain_sends_and_marks_synced() {
    let h = harness(test_policy(), InMemoryBackend::new()).await;
    let a = h.gateway.ingest(sms("MTN", "first", 1_000)).await.expect("a");
    let b = h.gateway.ingest(sms("BK", "second", 2_000)).await.expect("b");

    let report = h.gateway.drain_once().await.expect("drain");
    assert_eq!(
        report,
        DrainReport {
            attempted: 2,
            succeeded: 2,
            failed: 0
        }
    );

    let sent = h.backend.received().await;
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|r| r.device_id == device().device_id));
    let mut fps: Vec<_> = sent.iter().map(|r| r.fingerprint.clone()).collect();
    fps.sort();
    let mut expected = vec![a.fingerprint().to_string(), b.fingerprint().to_string()];
    expected.sort();
    assert_eq!(fps, expected);

    let record = h
        .gateway
        .message(a.fingerprint())
        .await
        .expect("get")
        .expect("stored");
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert_eq!(
        record.backend_id,
        Some(format!("txn-{}", &a.fingerprint()[..8]))
    );

    let stats = h.gateway.sync_stats().await.expect("stats");
    assert_eq!(stats.synced, 2);
    assert_eq!(stats.synced_percentage, 100.0);
    assert_eq!(h.gateway.observe_stats().borrow().synced, 2);

    let again = h.gateway.drain_once().await.expect("drain again");
    assert_eq!(again.attempted, 0);
    assert_eq!(h.backend.received_len().await, 2);
}

#[tokio::test]
async fn three_failures_exhaust_two_retries() {
    let h = harness(test_policy(), InMemoryBackend::failing(3)).await;
    let outcome = h
        .gateway
        .ingest(sms("+250788000111", "TXN 1000 RWF", 1_700_000_000_000))
        .await
        .expect("ingest");
    let fp = outcome.fingerprint().to_string();

    let first = h.gateway.drain_once().await.expect("drain 1");
    assert_eq!(first.failed, 1);
    let record = h.gateway.message(&fp).await.expect("get").expect("stored");
    assert_eq!(record.sync_status, SyncStatus::Failed);
    assert_eq!(record.retry_count, 1);

    let early = h.gateway.drain_once().await.expect("backing off");
    assert_eq!(early.attempted, 0);

    h.clock.advance(1_000);
    let second = h.gateway.drain_once().await.expect("drain 2");
    assert_eq!(second.failed, 1);
    assert_eq!(
        h.gateway.message(&fp).await.expect("get").expect("stored").retry_count,
        2
    );

    h.clock.advance(2_000);
    let third = h.gateway.drain_once().await.expect("drain 3");
    assert_eq!(third.failed, 1);

    let record = h.gateway.message(&fp).await.expect("get").expect("stored");
    assert_eq!(record.sync_status, SyncStatus::Failed);
    assert_eq!(record.retry_count, 2);
    assert!(record.permanently_failed);

    h.clock.advance(60 * 60 * 1000);
    let after = h.gateway.drain_once().await.expect("drain 4");
    assert_eq!(after.attempted, 0);
    assert_eq!(h.backend.received_len().await, 3);

    let failed = h.gateway.permanently_failed(10).await.expect("list");
    assert_eq!(failed.len(), 1);
    assert_eq!(h.gateway.session_counters().errors_seen, 3);
    assert_eq!(h.gateway.sync_stats().await.expect("stats").permanently_failed, 1);
}

#[tokio::test]
async fn retry_succeeds_after_backoff() {
    let h = harness(test_policy(), InMemoryBackend::failing(1)).await;
    let outcome = h.gateway.ingest(sms("MTN", "x", 1)).await.expect("ingest");
    assert_eq!(h.gateway.drain_once().await.expect("drain").failed, 1);
    h.clock.advance(1_000);
    assert_eq!(h.gateway.drain_once().await.expect("drain").succeeded, 1);

    let record = h
        .gateway
        .message(outcome.fingerprint())
        .await
        .expect("get")
        .expect("stored");
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert_eq!(record.retry_count, 1);
}

#[tokio::test]
async fn rejected_message_is_retried_with_reason() {
    let backend = InMemoryBackend::new();
    backend
        .push_reply(ScriptedReply::Fail(BackendError::rejected(
            "MALFORMED",
            "body not parseable",
        )))
        .await;
    let h = harness(test_policy(), backend).await;
    let outcome = h.gateway.ingest(sms("MTN", "x", 1)).await.expect("ingest");
    h.gateway.drain_once().await.expect("drain");
    let record = h
        .gateway
        .message(outcome.fingerprint())
        .await
        .expect("get")
        .expect("stored");
    assert_eq!(record.sync_status, SyncStatus::Failed);
    assert_eq!(
        record.last_error.as_deref(),
        Some("MALFORMED: body not parseable (rejected)")
    );
}

#[tokio::test]
async fn concurrent_drains_send_each_message_once() {
    let policy = SyncPolicy {
        max_in_flight: 2,
        ..test_policy()
    };
    let h = harness(policy, InMemoryBackend::new()).await;
    for i in 0..6u64 {
        h.gateway
            .ingest(sms("MTN", &format!("msg {i}"), 1_000 + i))
            .await
            .expect("ingest");
    }

    let (a, b) = tokio::join!(h.gateway.drain_once(), h.gateway.drain_once());
    let a = a.expect("drain a");
    let b = b.expect("drain b");
    assert_eq!(a.attempted + b.attempted, 6);
    assert_eq!(a.succeeded + b.succeeded, 6);

    let sent = h.backend.received().await;
    assert_eq!(sent.len(), 6);
    let mut fps: Vec<_> = sent.into_iter().map(|r| r.fingerprint).collect();
    fps.sort();
    fps.dedup();
    assert_eq!(fps.len(), 6);
    assert_eq!(h.gateway.sync_stats().await.expect("stats").synced, 6);
}

#[tokio::test]
async fn hung_backend_times_out_as_failure() {
    let policy = SyncPolicy {
        send_timeout_ms: 50,
        ..test_policy()
    };
    let backend = InMemoryBackend::new();
    backend.push_reply(ScriptedReply::Hang).await;
    let h = harness(policy, backend).await;
    let outcome = h.gateway.ingest(sms("MTN", "x", 1)).await.expect("ingest");

    let report = h.gateway.drain_once().await.expect("drain");
    assert_eq!(report.failed, 1);
    let record = h
        .gateway
        .message(outcome.fingerprint())
        .await
        .expect("get")
        .expect("stored");
    assert_eq!(record.sync_status, SyncStatus::Failed);
    assert_eq!(record.retry_count, 1);
    assert!(record
        .last_error
        .as_deref()
        .unwrap_or_default()
        .starts_with("BACKEND_TIMEOUT"));
}

#[tokio::test]
async fn running_send_is_not_reclaimed_as_stale() {
    let policy = SyncPolicy {
        send_timeout_ms: 300,
        stale_syncing_ms: 10,
        ..test_policy()
    };
    let backend = InMemoryBackend::new();
    backend.push_reply(ScriptedReply::Hang).await;
    let h = harness(policy, backend).await;
    let outcome = h.gateway.ingest(sms("MTN", "slow", 1)).await.expect("ingest");

    let gateway = h.gateway.clone();
    let first = tokio::spawn(async move { gateway.drain_once().await });
    tokio::time::timeout(std::time::Duration::from_secs(2), async {
        while h.backend.received_len().await == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first send started");

    h.clock.advance(100);
    let second = h.gateway.drain_once().await.expect("second drain");
    assert_eq!(second.attempted, 0);

    let first = first.await.expect("join").expect("first drain");
    assert_eq!(first.failed, 1);
    assert_eq!(h.backend.received_len().await, 1);
    let record = h
        .gateway
        .message(outcome.fingerprint())
        .await
        .expect("get")
        .expect("stored");
    assert_eq!(record.sync_status, SyncStatus::Failed);
    assert_eq!(record.retry_count, 1);
}

#[tokio::test]
async fn claim_error_still_records_spawned_sends() {
    let h = harness(test_policy(), InMemoryBackend::new()).await;
    let first = h.gateway.ingest(sms("MTN", "first", 1)).await.expect("ingest");
    let second = h.gateway.ingest(sms("MTN", "second", 2)).await.expect("ingest");
    let trigger = format!(
        "CREATE TRIGGER refuse_claim BEFORE UPDATE ON messages
         WHEN NEW.fingerprint = '{}' AND NEW.sync_status = 'SYNCING'
         BEGIN SELECT RAISE(ABORT, 'disk full'); END",
        second.fingerprint()
    );
    h.gateway.store().raw_execute(&trigger).await.expect("trigger");

    let err = h.gateway.drain_once().await.expect_err("claim fails");
    assert!(matches!(err, CoreError::Storage(_)));

    let sent = h
        .gateway
        .message(first.fingerprint())
        .await
        .expect("get")
        .expect("stored");
    assert_eq!(sent.sync_status, SyncStatus::Synced);
    let blocked = h
        .gateway
        .message(second.fingerprint())
        .await
        .expect("get")
        .expect("stored");
    assert_eq!(blocked.sync_status, SyncStatus::Pending);
    assert_eq!(h.backend.received_len().await, 1);
}

#[tokio::test]
async fn drain_recovers_crashed_attempt() {
    let policy = test_policy();
    let h = harness(policy.clone(), InMemoryBackend::new()).await;
    let outcome = h.gateway.ingest(sms("MTN", "x", 1)).await.expect("ingest");
    let fp = outcome.fingerprint().to_string();
    assert!(h.gateway.store().try_claim(&fp).await.expect("claim"));

    assert_eq!(h.gateway.drain_once().await.expect("drain").attempted, 0);

    h.clock.advance(policy.stale_syncing_ms);
    let recovered = h.gateway.drain_once().await.expect("drain");
    assert_eq!(recovered.attempted, 0);
    let record = h.gateway.message(&fp).await.expect("get").expect("stored");
    assert_eq!(record.sync_status, SyncStatus::Failed);

    h.clock.advance(1_000);
    assert_eq!(h.gateway.drain_once().await.expect("drain").succeeded, 1);
    let events: Vec<_> = h
        .gateway
        .store()
        .audit_for(&fp)
        .await
        .expect("audit")
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert!(events.contains(&AuditEventType::StaleRecovered));
    assert_eq!(events.last(), Some(&AuditEventType::SyncSuccess));
}

#[tokio::test]
async fn manual_requeue_restarts_exhausted_message() {
    let policy = SyncPolicy {
        max_retries: 0,
        ..test_policy()
    };
    let h = harness(policy, InMemoryBackend::failing(1)).await;
    let outcome = h.gateway.ingest(sms("MTN", "x", 1)).await.expect("ingest");
    let fp = outcome.fingerprint().to_string();
    h.gateway.drain_once().await.expect("drain");
    assert_eq!(h.gateway.permanently_failed(10).await.expect("list").len(), 1);

    h.gateway.requeue(&fp).await.expect("requeue");
    assert_eq!(h.gateway.queue_depth().await.expect("depth"), 1);
    assert_eq!(h.gateway.drain_once().await.expect("drain").succeeded, 1);

    assert!(matches!(
        h.gateway.requeue(&"b".repeat(64)).await,
        Err(CoreError::NotFound)
    ));
    assert!(matches!(
        h.gateway.requeue("nope").await,
        Err(CoreError::Validation(_))
    ));
}

#[tokio::test]
async fn device_is_resolved_by_phone() {
    let h = harness_with(test_config(), test_policy(), InMemoryBackend::new()).await;
    assert!(!h.gateway.resolve_device("+250788000111").await.expect("lookup"));

    h.lookup.register("+250788000111", device()).await;
    assert!(h.gateway.resolve_device("+250788000111").await.expect("lookup"));
    h.gateway.ingest(sms("MTN", "x", 1)).await.expect("ingest");
    assert_eq!(h.gateway.drain_once().await.expect("drain").succeeded, 1);
}

#[tokio::test]
async fn configured_phone_is_resolved_at_init() {
    let lookup = crate::device::InMemoryDeviceLookup::new();
    lookup.register("+250788000111", device()).await;
    let gateway = crate::Gateway::init(
        CoreConfig {
            device_phone: Some("+250788000111".to_string()),
            ..test_config()
        },
        test_policy(),
        std::sync::Arc::new(InMemoryBackend::new()),
        std::sync::Arc::new(lookup),
        std::sync::Arc::new(crate::time::ManualClock::new(super::START_MS)),
    )
    .await
    .expect("gateway");
    assert!(gateway.device_configured().await);
}

#[tokio::test]
async fn background_worker_drains() {
    let h = harness(test_policy(), InMemoryBackend::new()).await;
    h.gateway.ingest(sms("MTN", "x", 1)).await.expect("ingest");
    let mut stats = h.gateway.observe_stats();
    let worker = h
        .gateway
        .start_sync_worker(std::time::Duration::from_millis(10));
    tokio::time::timeout(
        std::time::Duration::from_secs(2),
        stats.wait_for(|s| s.synced == 1),
    )
    .await
    .expect("worker in time")
    .expect("stats channel");
    worker.abort();
    assert_eq!(h.backend.received_len().await, 1);
}

#[tokio::test]
async fn init_worker_can_be_stopped() {
    let config = CoreConfig {
        sync_interval_ms: 10,
        ..test_config()
    };
    let h = harness_with(config, test_policy(), InMemoryBackend::new()).await;
    h.gateway.configure_device(Some(device())).await;
    h.gateway.ingest(sms("MTN", "first", 1)).await.expect("ingest");
    let mut stats = h.gateway.observe_stats();
    tokio::time::timeout(
        std::time::Duration::from_secs(2),
        stats.wait_for(|s| s.synced == 1),
    )
    .await
    .expect("worker in time")
    .expect("stats channel");

    assert!(h.gateway.stop_sync_worker().await);
    assert!(!h.gateway.stop_sync_worker().await);

    h.gateway.ingest(sms("MTN", "second", 2)).await.expect("ingest");
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(h.backend.received_len().await, 1);
    assert_eq!(h.gateway.sync_stats().await.expect("stats").pending, 1);
}
