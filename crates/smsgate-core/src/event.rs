use smsgate_api::SyncStats;
use std::sync::Arc;
use tokio::sync::watch;

pub type StatsReceiver = watch::Receiver<SyncStats>;

#[derive(Clone)]
pub struct StatsBus {
    tx: Arc<watch::Sender<SyncStats>>,
}

impl StatsBus {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SyncStats::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> StatsReceiver {
        self.tx.subscribe()
    }

    pub fn publish(&self, stats: SyncStats) {
        self.tx.send_replace(stats);
    }
}

impl Default for StatsBus {
    fn default() -> Self {
        Self::new()
    }
}
