use smsgate_api::SyncStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("storage {0}")]
    Storage(String),
    #[error("validation {0}")]
    Validation(String),
    #[error("device not configured")]
    DeviceNotConfigured,
    #[error("lookup {0}")]
    Lookup(String),
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: SyncStatus, to: SyncStatus },
    #[error("not found")]
    NotFound,
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Storage(err.to_string())
    }
}

/// Failure reported by the ingestion backend for a single send attempt.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct BackendError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl BackendError {
    pub fn transient(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn rejected(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn timeout(after_ms: u64) -> Self {
        Self::transient("BACKEND_TIMEOUT", format!("no response after {after_ms} ms"))
    }
}
