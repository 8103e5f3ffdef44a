//! SQLite-backed system of record for captured messages and the audit log.
//!
//! Every operation runs inside one critical section on the connection, so the
//! insert-if-absent and claim paths are atomic with respect to each other.
//! Rows are mapped to and from [`MessageRecord`] only through [`MessageRow`].

use crate::counters::SessionCounters;
use crate::error::CoreError;
use crate::queue::{transition_allowed, RetryDecision, RetryPolicy};
use crate::record::{AuditEntry, InsertOutcome, MessageRecord, UpdateOutcome};
use crate::time::Clock;
use log::{debug, warn};
use rusqlite::{params, Connection, OptionalExtension, Row};
use smsgate_api::{AuditEventType, StatusCounts, SyncStatus};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const DB_FILE: &str = "smsgate.db";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS messages (
        fingerprint        TEXT PRIMARY KEY,
        sender             TEXT NOT NULL,
        body               TEXT NOT NULL,
        received_at        INTEGER NOT NULL,
        sim_slot           INTEGER,
        sync_status        TEXT NOT NULL,
        retry_count        INTEGER NOT NULL DEFAULT 0,
        last_attempt_at    INTEGER,
        last_error         TEXT,
        next_attempt_at    INTEGER NOT NULL DEFAULT 0,
        syncing_since      INTEGER,
        permanently_failed INTEGER NOT NULL DEFAULT 0,
        backend_id         TEXT,
        created_at         INTEGER NOT NULL,
        synced_at          INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_messages_status_received
        ON messages(sync_status, received_at);

    CREATE TABLE IF NOT EXISTS audit_log (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp   INTEGER NOT NULL,
        event_type  TEXT NOT NULL,
        fingerprint TEXT,
        detail      TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_audit_fingerprint ON audit_log(fingerprint);
";

const MESSAGE_COLUMNS: &str = "fingerprint, sender, body, received_at, sim_slot, sync_status,
    retry_count, last_attempt_at, last_error, next_attempt_at, syncing_since,
    permanently_failed, backend_id, created_at, synced_at";

// Rows whose status text is not one of ours decode as PENDING, so the
// eligibility query has to treat them the same way.
const ELIGIBLE_WHERE: &str = "(sync_status = 'PENDING'
    OR sync_status NOT IN ('PENDING', 'SYNCING', 'SYNCED', 'FAILED')
    OR (sync_status = 'FAILED' AND permanently_failed = 0 AND next_attempt_at <= ?1))";

const STALE_ERROR: &str = "stale in-flight attempt";

/// Storage representation of a message row.
#[derive(Clone, Debug)]
struct MessageRow {
    fingerprint: String,
    sender: String,
    body: String,
    received_at: i64,
    sim_slot: Option<i64>,
    sync_status: String,
    retry_count: i64,
    last_attempt_at: Option<i64>,
    last_error: Option<String>,
    next_attempt_at: i64,
    syncing_since: Option<i64>,
    permanently_failed: i64,
    backend_id: Option<String>,
    created_at: i64,
    synced_at: Option<i64>,
}

impl MessageRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            fingerprint: row.get(0)?,
            sender: row.get(1)?,
            body: row.get(2)?,
            received_at: row.get(3)?,
            sim_slot: row.get(4)?,
            sync_status: row.get(5)?,
            retry_count: row.get(6)?,
            last_attempt_at: row.get(7)?,
            last_error: row.get(8)?,
            next_attempt_at: row.get(9)?,
            syncing_since: row.get(10)?,
            permanently_failed: row.get(11)?,
            backend_id: row.get(12)?,
            created_at: row.get(13)?,
            synced_at: row.get(14)?,
        })
    }
}

impl From<MessageRow> for MessageRecord {
    fn from(row: MessageRow) -> Self {
        MessageRecord {
            fingerprint: row.fingerprint,
            sender: row.sender,
            body: row.body,
            received_at: row.received_at.max(0) as u64,
            sim_slot: row.sim_slot.and_then(|v| u32::try_from(v).ok()),
            sync_status: SyncStatus::parse_lenient(&row.sync_status),
            retry_count: u32::try_from(row.retry_count.max(0)).unwrap_or(u32::MAX),
            last_attempt_at: row.last_attempt_at.map(|v| v.max(0) as u64),
            last_error: row.last_error,
            next_attempt_at: row.next_attempt_at.max(0) as u64,
            syncing_since: row.syncing_since.map(|v| v.max(0) as u64),
            permanently_failed: row.permanently_failed != 0,
            backend_id: row.backend_id,
            created_at: row.created_at.max(0) as u64,
            synced_at: row.synced_at.map(|v| v.max(0) as u64),
        }
    }
}

impl From<&MessageRecord> for MessageRow {
    fn from(record: &MessageRecord) -> Self {
        MessageRow {
            fingerprint: record.fingerprint.clone(),
            sender: record.sender.clone(),
            body: record.body.clone(),
            received_at: record.received_at as i64,
            sim_slot: record.sim_slot.map(i64::from),
            sync_status: record.sync_status.as_str().to_string(),
            retry_count: i64::from(record.retry_count),
            last_attempt_at: record.last_attempt_at.map(|v| v as i64),
            last_error: record.last_error.clone(),
            next_attempt_at: record.next_attempt_at as i64,
            syncing_since: record.syncing_since.map(|v| v as i64),
            permanently_failed: i64::from(record.permanently_failed),
            backend_id: record.backend_id.clone(),
            created_at: record.created_at as i64,
            synced_at: record.synced_at.map(|v| v as i64),
        }
    }
}

fn read_audit(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    let event: String = row.get(2)?;
    Ok(AuditEntry {
        id: row.get(0)?,
        timestamp: row.get::<_, i64>(1)?.max(0) as u64,
        event_type: AuditEventType::parse(&event),
        fingerprint: row.get(3)?,
        detail: row.get(4)?,
    })
}

fn append_audit_row(
    conn: &Connection,
    now_ms: u64,
    event: &AuditEventType,
    fingerprint: Option<&str>,
    detail: &str,
) -> Result<i64, CoreError> {
    conn.execute(
        "INSERT INTO audit_log (timestamp, event_type, fingerprint, detail)
         VALUES (?1, ?2, ?3, ?4)",
        params![now_ms as i64, event.as_str(), fingerprint, detail],
    )?;
    Ok(conn.last_insert_rowid())
}

fn load_record(conn: &Connection, fingerprint: &str) -> Result<Option<MessageRecord>, CoreError> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE fingerprint = ?1");
    let row = conn
        .query_row(&sql, params![fingerprint], MessageRow::read)
        .optional()?;
    Ok(row.map(MessageRecord::from))
}

/// What a successful transition changed, for counters and logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Effect {
    Claimed,
    Synced,
    RetryScheduled,
    Exhausted,
    Requeued,
}

#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    counters: SessionCounters,
}

impl LocalStore {
    /// Open or create the database file at `path`.
    pub fn open(
        path: &Path,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| CoreError::Storage(e.to_string()))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::with_connection(conn, retry, clock)
    }

    pub fn open_in_memory(retry: RetryPolicy, clock: Arc<dyn Clock>) -> Result<Self, CoreError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, retry, clock)
    }

    fn with_connection(
        conn: Connection,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            retry,
            clock,
            counters: SessionCounters::new(),
        })
    }

    pub fn counters(&self) -> &SessionCounters {
        &self.counters
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub async fn insert_if_absent(
        &self,
        record: &MessageRecord,
    ) -> Result<InsertOutcome, CoreError> {
        let now = self.clock.now_ms();
        let row = MessageRow::from(record);
        let mut guard = self.conn.lock().await;
        let tx = guard.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO messages
             (fingerprint, sender, body, received_at, sim_slot, sync_status, retry_count,
              last_attempt_at, last_error, next_attempt_at, syncing_since,
              permanently_failed, backend_id, created_at, synced_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                row.fingerprint,
                row.sender,
                row.body,
                row.received_at,
                row.sim_slot,
                row.sync_status,
                row.retry_count,
                row.last_attempt_at,
                row.last_error,
                row.next_attempt_at,
                row.syncing_since,
                row.permanently_failed,
                row.backend_id,
                row.created_at,
                row.synced_at,
            ],
        )?;
        let outcome = if inserted == 1 {
            let detail = format!("from {} at {}", record.sender, record.received_at);
            append_audit_row(
                &tx,
                now,
                &AuditEventType::MessageReceived,
                Some(&record.fingerprint),
                &detail,
            )?;
            InsertOutcome::Inserted
        } else {
            append_audit_row(
                &tx,
                now,
                &AuditEventType::DuplicateRejected,
                Some(&record.fingerprint),
                "fingerprint already stored",
            )?;
            InsertOutcome::Duplicate
        };
        tx.commit()?;
        drop(guard);
        if outcome == InsertOutcome::Inserted {
            self.counters.record_sms();
        }
        Ok(outcome)
    }

    pub async fn get(&self, fingerprint: &str) -> Result<Option<MessageRecord>, CoreError> {
        let guard = self.conn.lock().await;
        load_record(&guard, fingerprint)
    }

    pub async fn update_status(
        &self,
        fingerprint: &str,
        status: SyncStatus,
        error: Option<&str>,
    ) -> Result<UpdateOutcome, CoreError> {
        self.transition(fingerprint, status, error, None).await
    }

    pub async fn mark_synced(
        &self,
        fingerprint: &str,
        backend_id: Option<&str>,
    ) -> Result<UpdateOutcome, CoreError> {
        self.transition(fingerprint, SyncStatus::Synced, None, backend_id)
            .await
    }

    /// Atomically move an eligible record into `Syncing`. Returns `false` when
    /// the record is missing, already in flight, finished, or still backing off.
    pub async fn try_claim(&self, fingerprint: &str) -> Result<bool, CoreError> {
        let now = self.clock.now_ms();
        let mut guard = self.conn.lock().await;
        let tx = guard.transaction()?;
        let Some(current) = load_record(&tx, fingerprint)? else {
            return Ok(false);
        };
        if !current.is_eligible(now) {
            return Ok(false);
        }
        self.apply(&tx, &current, SyncStatus::Syncing, None, None, now)?;
        tx.commit()?;
        Ok(true)
    }

    async fn transition(
        &self,
        fingerprint: &str,
        status: SyncStatus,
        error: Option<&str>,
        backend_id: Option<&str>,
    ) -> Result<UpdateOutcome, CoreError> {
        let now = self.clock.now_ms();
        let mut guard = self.conn.lock().await;
        let tx = guard.transaction()?;
        let Some(current) = load_record(&tx, fingerprint)? else {
            return Ok(UpdateOutcome::NotFound);
        };
        let effect = self.apply(&tx, &current, status, error, backend_id, now)?;
        tx.commit()?;
        drop(guard);
        if matches!(effect, Effect::RetryScheduled | Effect::Exhausted) {
            self.counters.record_error();
        }
        Ok(UpdateOutcome::Updated)
    }

    fn apply(
        &self,
        conn: &Connection,
        current: &MessageRecord,
        to: SyncStatus,
        error: Option<&str>,
        backend_id: Option<&str>,
        now: u64,
    ) -> Result<Effect, CoreError> {
        let from = current.sync_status;
        if !transition_allowed(from, to, current.permanently_failed) {
            return Err(CoreError::IllegalTransition { from, to });
        }
        let fp = current.fingerprint.as_str();
        match to {
            SyncStatus::Syncing => {
                if from == SyncStatus::Failed {
                    let detail =
                        format!("retry {}/{}", current.retry_count, self.retry.max_retries);
                    let event = AuditEventType::RetryRequeued;
                    append_audit_row(conn, now, &event, Some(fp), &detail)?;
                }
                conn.execute(
                    "UPDATE messages SET sync_status = 'SYNCING', syncing_since = ?2
                     WHERE fingerprint = ?1",
                    params![fp, now as i64],
                )?;
                let detail = format!("attempt {}", current.retry_count + 1);
                append_audit_row(conn, now, &AuditEventType::SyncAttempt, Some(fp), &detail)?;
                Ok(Effect::Claimed)
            }
            SyncStatus::Synced => {
                conn.execute(
                    "UPDATE messages SET sync_status = 'SYNCED', syncing_since = NULL,
                         synced_at = ?2, backend_id = ?3
                     WHERE fingerprint = ?1",
                    params![fp, now as i64, backend_id],
                )?;
                let detail = match backend_id {
                    Some(id) => format!("accepted as {id}"),
                    None => "accepted".to_string(),
                };
                append_audit_row(conn, now, &AuditEventType::SyncSuccess, Some(fp), &detail)?;
                Ok(Effect::Synced)
            }
            SyncStatus::Failed => {
                let error = error.unwrap_or("unknown error");
                match self.retry.decide(current.retry_count, now) {
                    RetryDecision::RetryAt {
                        retry_count,
                        next_attempt_at,
                    } => {
                        conn.execute(
                            "UPDATE messages SET sync_status = 'FAILED', syncing_since = NULL,
                                 retry_count = ?2, next_attempt_at = ?3,
                                 last_attempt_at = ?4, last_error = ?5
                             WHERE fingerprint = ?1",
                            params![
                                fp,
                                i64::from(retry_count),
                                next_attempt_at as i64,
                                now as i64,
                                error
                            ],
                        )?;
                        let detail = format!(
                            "{error}; retry {retry_count}/{} after {next_attempt_at}",
                            self.retry.max_retries
                        );
                        let event = AuditEventType::SyncFailure;
                        append_audit_row(conn, now, &event, Some(fp), &detail)?;
                        debug!("store: {} failed, {}", short(fp), detail);
                        Ok(Effect::RetryScheduled)
                    }
                    RetryDecision::Exhausted { retry_count } => {
                        conn.execute(
                            "UPDATE messages SET sync_status = 'FAILED', syncing_since = NULL,
                                 permanently_failed = 1, last_attempt_at = ?2, last_error = ?3
                             WHERE fingerprint = ?1",
                            params![fp, now as i64, error],
                        )?;
                        let detail = format!(
                            "{error}; retries exhausted ({retry_count}/{})",
                            self.retry.max_retries
                        );
                        let event = AuditEventType::SyncFailure;
                        append_audit_row(conn, now, &event, Some(fp), &detail)?;
                        warn!("store: {} permanently failed: {}", short(fp), error);
                        Ok(Effect::Exhausted)
                    }
                }
            }
            SyncStatus::Pending => {
                conn.execute(
                    "UPDATE messages SET sync_status = 'PENDING', next_attempt_at = 0
                     WHERE fingerprint = ?1",
                    params![fp],
                )?;
                let detail = format!("retry {}/{}", current.retry_count, self.retry.max_retries);
                append_audit_row(conn, now, &AuditEventType::RetryRequeued, Some(fp), &detail)?;
                Ok(Effect::Requeued)
            }
        }
    }

    /// Oldest-first records that may be sent now.
    pub async fn fetch_pending(&self, limit: usize) -> Result<Vec<MessageRecord>, CoreError> {
        let now = self.clock.now_ms();
        let guard = self.conn.lock().await;
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE {ELIGIBLE_WHERE}
             ORDER BY received_at ASC, fingerprint ASC LIMIT ?2"
        );
        let mut stmt = guard.prepare(&sql)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![now as i64, limit], MessageRow::read)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(MessageRecord::from(row?));
        }
        Ok(result)
    }

    pub async fn count_eligible(&self) -> Result<u64, CoreError> {
        let now = self.clock.now_ms();
        let guard = self.conn.lock().await;
        let sql = format!("SELECT COUNT(*) FROM messages WHERE {ELIGIBLE_WHERE}");
        let count: i64 = guard.query_row(&sql, params![now as i64], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    pub async fn counts_by_status(&self) -> Result<StatusCounts, CoreError> {
        let guard = self.conn.lock().await;
        let mut stmt = guard.prepare(
            "SELECT sync_status, COUNT(*), SUM(permanently_failed)
             FROM messages GROUP BY sync_status",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<i64>>(2)?,
            ))
        })?;
        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, count, exhausted) = row?;
            let count = count.max(0) as u64;
            match SyncStatus::parse_lenient(&status) {
                SyncStatus::Pending => counts.pending += count,
                SyncStatus::Syncing => counts.syncing += count,
                SyncStatus::Synced => counts.synced += count,
                SyncStatus::Failed => {
                    counts.failed += count;
                    counts.permanently_failed += exhausted.unwrap_or(0).max(0) as u64;
                }
            }
        }
        Ok(counts)
    }

    /// Turn attempts left in `Syncing` for longer than `threshold_ms` (for
    /// example by a crash mid-send) into failures so they are retried.
    pub async fn recover_stale(&self, threshold_ms: u64) -> Result<usize, CoreError> {
        let now = self.clock.now_ms();
        let cutoff = now.saturating_sub(threshold_ms) as i64;
        let mut guard = self.conn.lock().await;
        let tx = guard.transaction()?;
        let stale = {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE sync_status = 'SYNCING'
                   AND (syncing_since IS NULL OR syncing_since <= ?1)
                 ORDER BY received_at ASC"
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(params![cutoff], MessageRow::read)?;
            let mut records = Vec::new();
            for row in rows {
                records.push(MessageRecord::from(row?));
            }
            records
        };
        for record in stale.iter() {
            let detail = match record.syncing_since {
                Some(since) => format!("in flight since {since}"),
                None => "in flight with no start time".to_string(),
            };
            append_audit_row(
                &tx,
                now,
                &AuditEventType::StaleRecovered,
                Some(&record.fingerprint),
                &detail,
            )?;
            self.apply(&tx, record, SyncStatus::Failed, Some(STALE_ERROR), None, now)?;
        }
        tx.commit()?;
        drop(guard);
        for _ in stale.iter() {
            self.counters.record_error();
        }
        if !stale.is_empty() {
            warn!("store: recovered {} stale in-flight record(s)", stale.len());
        }
        Ok(stale.len())
    }

    pub async fn list_permanently_failed(
        &self,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, CoreError> {
        let guard = self.conn.lock().await;
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE sync_status = 'FAILED' AND permanently_failed = 1
             ORDER BY received_at ASC LIMIT ?1"
        );
        let mut stmt = guard.prepare(&sql)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], MessageRow::read)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(MessageRecord::from(row?));
        }
        Ok(result)
    }

    /// Operator-driven restart of a failed record: back to `Pending` with a
    /// fresh retry budget.
    pub async fn requeue_failed(&self, fingerprint: &str) -> Result<UpdateOutcome, CoreError> {
        let now = self.clock.now_ms();
        let mut guard = self.conn.lock().await;
        let tx = guard.transaction()?;
        let Some(current) = load_record(&tx, fingerprint)? else {
            return Ok(UpdateOutcome::NotFound);
        };
        if current.sync_status != SyncStatus::Failed {
            return Err(CoreError::IllegalTransition {
                from: current.sync_status,
                to: SyncStatus::Pending,
            });
        }
        tx.execute(
            "UPDATE messages SET sync_status = 'PENDING', retry_count = 0,
                 permanently_failed = 0, next_attempt_at = 0
             WHERE fingerprint = ?1",
            params![fingerprint],
        )?;
        let detail = format!(
            "reset after {} retries, last error: {}",
            current.retry_count,
            current.last_error.as_deref().unwrap_or("none")
        );
        append_audit_row(
            &tx,
            now,
            &AuditEventType::ManualRequeue,
            Some(fingerprint),
            &detail,
        )?;
        tx.commit()?;
        Ok(UpdateOutcome::Updated)
    }

    pub async fn append_audit(
        &self,
        event: AuditEventType,
        fingerprint: Option<&str>,
        detail: &str,
    ) -> Result<i64, CoreError> {
        let now = self.clock.now_ms();
        let guard = self.conn.lock().await;
        append_audit_row(&guard, now, &event, fingerprint, detail)
    }

    pub async fn record_security_event(&self, detail: &str) -> Result<i64, CoreError> {
        self.append_audit(AuditEventType::SecurityEvent, None, detail)
            .await
    }

    /// Most recent entries first.
    pub async fn list_audit(&self, limit: usize) -> Result<Vec<AuditEntry>, CoreError> {
        let guard = self.conn.lock().await;
        let mut stmt = guard.prepare(
            "SELECT id, timestamp, event_type, fingerprint, detail
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], read_audit)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Entries for one message in the order they were written.
    pub async fn audit_for(&self, fingerprint: &str) -> Result<Vec<AuditEntry>, CoreError> {
        let guard = self.conn.lock().await;
        let mut stmt = guard.prepare(
            "SELECT id, timestamp, event_type, fingerprint, detail
             FROM audit_log WHERE fingerprint = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![fingerprint], read_audit)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Clears the session counters. Stored rows are not touched.
    pub async fn reset_counters(&self) -> Result<(), CoreError> {
        let before = self.counters.snapshot();
        self.counters.reset();
        let detail = format!(
            "sms_seen={} errors_seen={}",
            before.sms_seen, before.errors_seen
        );
        self.append_audit(AuditEventType::CountersReset, None, &detail)
            .await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn raw_execute(&self, sql: &str) -> Result<usize, CoreError> {
        let guard = self.conn.lock().await;
        Ok(guard.execute(sql, [])?)
    }
}

pub(crate) fn short(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}
