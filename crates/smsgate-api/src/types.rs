use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InboundSms {
    pub sender: String,
    pub body: String,
    pub received_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sim_slot: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl SyncStatus {
    pub const ALL: [SyncStatus; 4] = [
        SyncStatus::Pending,
        SyncStatus::Syncing,
        SyncStatus::Synced,
        SyncStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "PENDING",
            SyncStatus::Syncing => "SYNCING",
            SyncStatus::Synced => "SYNCED",
            SyncStatus::Failed => "FAILED",
        }
    }

    /// Decodes a persisted status. Values written by a newer schema fall back
    /// to `Pending` so the record is picked up again instead of lost.
    pub fn parse_lenient(value: &str) -> SyncStatus {
        match value.trim().to_ascii_uppercase().as_str() {
            "SYNCING" => SyncStatus::Syncing,
            "SYNCED" => SyncStatus::Synced,
            "FAILED" => SyncStatus::Failed,
            _ => SyncStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStatus::Synced)
    }
}

impl Display for SyncStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AuditEventType {
    MessageReceived,
    DuplicateRejected,
    SyncAttempt,
    SyncSuccess,
    SyncFailure,
    RetryRequeued,
    StaleRecovered,
    ManualRequeue,
    CountersReset,
    SecurityEvent,
    Other(String),
}

impl AuditEventType {
    pub fn as_str(&self) -> &str {
        match self {
            AuditEventType::MessageReceived => "message-received",
            AuditEventType::DuplicateRejected => "duplicate-rejected",
            AuditEventType::SyncAttempt => "sync-attempt",
            AuditEventType::SyncSuccess => "sync-success",
            AuditEventType::SyncFailure => "sync-failure",
            AuditEventType::RetryRequeued => "retry-requeued",
            AuditEventType::StaleRecovered => "stale-recovered",
            AuditEventType::ManualRequeue => "manual-requeue",
            AuditEventType::CountersReset => "counters-reset",
            AuditEventType::SecurityEvent => "security-event",
            AuditEventType::Other(name) => name.as_str(),
        }
    }

    pub fn parse(value: &str) -> AuditEventType {
        match value {
            "message-received" => AuditEventType::MessageReceived,
            "duplicate-rejected" => AuditEventType::DuplicateRejected,
            "sync-attempt" => AuditEventType::SyncAttempt,
            "sync-success" => AuditEventType::SyncSuccess,
            "sync-failure" => AuditEventType::SyncFailure,
            "retry-requeued" => AuditEventType::RetryRequeued,
            "stale-recovered" => AuditEventType::StaleRecovered,
            "manual-requeue" => AuditEventType::ManualRequeue,
            "counters-reset" => AuditEventType::CountersReset,
            "security-event" => AuditEventType::SecurityEvent,
            other => AuditEventType::Other(other.to_string()),
        }
    }
}

impl Display for AuditEventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngestOutcome {
    Inserted { fingerprint: String },
    Duplicate { fingerprint: String },
}

impl IngestOutcome {
    pub fn fingerprint(&self) -> &str {
        match self {
            IngestOutcome::Inserted { fingerprint } | IngestOutcome::Duplicate { fingerprint } => {
                fingerprint
            }
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, IngestOutcome::Duplicate { .. })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub attempted: u32,
    pub succeeded: u32,
    pub failed: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub syncing: u64,
    pub synced: u64,
    pub failed: u64,
    pub permanently_failed: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.syncing + self.synced + self.failed
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStats {
    pub pending: u64,
    pub syncing: u64,
    pub synced: u64,
    pub failed: u64,
    pub permanently_failed: u64,
    pub total: u64,
    pub synced_percentage: f64,
}

impl From<StatusCounts> for SyncStats {
    fn from(counts: StatusCounts) -> Self {
        let total = counts.total();
        let synced_percentage = if total == 0 {
            0.0
        } else {
            counts.synced as f64 * 100.0 / total as f64
        };
        SyncStats {
            pending: counts.pending,
            syncing: counts.syncing,
            synced: counts.synced,
            failed: counts.failed,
            permanently_failed: counts.permanently_failed,
            total,
            synced_percentage,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCountersDto {
    pub sms_seen: u64,
    pub errors_seen: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDto {
    pub fingerprint: String,
    pub sender: String,
    pub body: String,
    pub received_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sim_slot: Option<u32>,
    pub sync_status: SyncStatus,
    pub retry_count: u32,
    pub permanently_failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntryDto {
    pub id: i64,
    pub timestamp: u64,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    pub detail: String,
}

/// Payload posted to the ingestion backend for one message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendIngestRequest {
    pub device_id: String,
    pub fingerprint: String,
    pub sender: String,
    pub body: String,
    pub received_at: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendIngestResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub parse_status: Option<String>,
    #[serde(default)]
    pub model_used: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLookupResponse {
    pub device_id: String,
    pub device_secret: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValidationLimits {
    pub max_body_bytes: usize,
    pub max_sender_len: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_body_bytes: 16 * 1024,
            max_sender_len: 64,
        }
    }
}
