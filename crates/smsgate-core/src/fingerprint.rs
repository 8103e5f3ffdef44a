use sha2::{Digest, Sha256};

const DELIMITER: &str = "|";

/// Content key for deduplication: hex SHA-256 over `sender|body|received_at`.
///
/// Two messages with the same sender, body and millisecond timestamp are the
/// same logical event.
pub fn fingerprint(sender: &str, body: &str, received_at: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sender.as_bytes());
    hasher.update(DELIMITER.as_bytes());
    hasher.update(body.as_bytes());
    hasher.update(DELIMITER.as_bytes());
    hasher.update(received_at.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
