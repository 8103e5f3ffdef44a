use smsgate_api::{AuditEntryDto, AuditEventType, InboundSms, MessageDto, SyncStatus};

use crate::fingerprint::fingerprint;

/// A captured message and its delivery bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageRecord {
    pub fingerprint: String,
    pub sender: String,
    pub body: String,
    pub received_at: u64,
    pub sim_slot: Option<u32>,
    pub sync_status: SyncStatus,
    pub retry_count: u32,
    pub last_attempt_at: Option<u64>,
    pub last_error: Option<String>,
    /// Earliest time a failed record becomes eligible again.
    pub next_attempt_at: u64,
    pub syncing_since: Option<u64>,
    pub permanently_failed: bool,
    pub backend_id: Option<String>,
    pub created_at: u64,
    pub synced_at: Option<u64>,
}

impl MessageRecord {
    pub fn capture(sms: &InboundSms, now_ms: u64) -> Self {
        let sender = sms.sender.trim().to_string();
        Self {
            fingerprint: fingerprint(&sender, &sms.body, sms.received_at),
            sender,
            body: sms.body.clone(),
            received_at: sms.received_at,
            sim_slot: sms.sim_slot,
            sync_status: SyncStatus::Pending,
            retry_count: 0,
            last_attempt_at: None,
            last_error: None,
            next_attempt_at: 0,
            syncing_since: None,
            permanently_failed: false,
            backend_id: None,
            created_at: now_ms,
            synced_at: None,
        }
    }

    pub fn is_eligible(&self, now_ms: u64) -> bool {
        match self.sync_status {
            SyncStatus::Pending => true,
            SyncStatus::Failed => !self.permanently_failed && self.next_attempt_at <= now_ms,
            SyncStatus::Syncing | SyncStatus::Synced => false,
        }
    }

    pub fn to_dto(&self) -> MessageDto {
        MessageDto {
            fingerprint: self.fingerprint.clone(),
            sender: self.sender.clone(),
            body: self.body.clone(),
            received_at: self.received_at,
            sim_slot: self.sim_slot,
            sync_status: self.sync_status,
            retry_count: self.retry_count,
            permanently_failed: self.permanently_failed,
            last_attempt_at: self.last_attempt_at,
            last_error: self.last_error.clone(),
            backend_id: self.backend_id.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: u64,
    pub event_type: AuditEventType,
    pub fingerprint: Option<String>,
    pub detail: String,
}

impl AuditEntry {
    pub fn to_dto(&self) -> AuditEntryDto {
        AuditEntryDto {
            id: self.id,
            timestamp: self.timestamp,
            event_type: self.event_type.as_str().to_string(),
            fingerprint: self.fingerprint.clone(),
            detail: self.detail.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    NotFound,
}
