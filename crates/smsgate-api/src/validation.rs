use crate::types::*;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("empty field {0}")]
    Empty(&'static str),
    #[error("too long {0}")]
    TooLong(&'static str),
    #[error("invalid {0}")]
    Invalid(&'static str),
}

pub fn validate_sender(sender: &str, limits: &ValidationLimits) -> Result<(), ValidationError> {
    let trimmed = sender.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty("sender"));
    }
    if trimmed.len() > limits.max_sender_len {
        return Err(ValidationError::TooLong("sender"));
    }
    if trimmed.chars().any(|c| c.is_control()) {
        return Err(ValidationError::Invalid("sender"));
    }
    Ok(())
}

pub fn validate_inbound(
    sms: &InboundSms,
    limits: &ValidationLimits,
) -> Result<(), ValidationError> {
    validate_sender(&sms.sender, limits)?;
    if sms.body.len() > limits.max_body_bytes {
        return Err(ValidationError::TooLong("body"));
    }
    // Stored in a signed 64-bit column.
    if sms.received_at == 0 || sms.received_at > i64::MAX as u64 {
        return Err(ValidationError::Invalid("received_at"));
    }
    Ok(())
}

pub fn validate_fingerprint(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty("fingerprint"));
    }
    if value.len() != 64 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ValidationError::Invalid("fingerprint"));
    }
    Ok(())
}
