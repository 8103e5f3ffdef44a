use smsgate_api::SessionCountersDto;
use std::sync::Arc;
use tokio::sync::watch;

/// In-process counters for the current session. They are never persisted and
/// are independent from the status counts kept in the store.
#[derive(Clone)]
pub struct SessionCounters {
    sms_seen: Arc<watch::Sender<u64>>,
    errors_seen: Arc<watch::Sender<u64>>,
}

impl SessionCounters {
    pub fn new() -> Self {
        let (sms_seen, _) = watch::channel(0);
        let (errors_seen, _) = watch::channel(0);
        Self {
            sms_seen: Arc::new(sms_seen),
            errors_seen: Arc::new(errors_seen),
        }
    }

    pub fn record_sms(&self) {
        self.sms_seen.send_modify(|v| *v = v.saturating_add(1));
    }

    pub fn record_error(&self) {
        self.errors_seen.send_modify(|v| *v = v.saturating_add(1));
    }

    pub fn reset(&self) {
        self.sms_seen.send_replace(0);
        self.errors_seen.send_replace(0);
    }

    pub fn sms_seen(&self) -> u64 {
        *self.sms_seen.borrow()
    }

    pub fn errors_seen(&self) -> u64 {
        *self.errors_seen.borrow()
    }

    pub fn observe_sms(&self) -> watch::Receiver<u64> {
        self.sms_seen.subscribe()
    }

    pub fn observe_errors(&self) -> watch::Receiver<u64> {
        self.errors_seen.subscribe()
    }

    pub fn snapshot(&self) -> SessionCountersDto {
        SessionCountersDto {
            sms_seen: self.sms_seen(),
            errors_seen: self.errors_seen(),
        }
    }
}

impl Default for SessionCounters {
    fn default() -> Self {
        Self::new()
    }
}
