use sha2::{Digest, Sha256};
use std::fmt::Write;

/// Number of digest bytes kept in a log-safe identifier
const LOG_ID_BYTES: usize = 6;

/// Salted, truncated SHA-256 of an identifier, stable across log lines so a
/// single user's session can still be followed without exposing the raw id.
pub fn log_safe_id(id: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(id.as_bytes());
    let digest = hasher.finalize();

    digest[..LOG_ID_BYTES]
        .iter()
        .fold(String::with_capacity(LOG_ID_BYTES * 2), |mut out, b| {
            let _ = write!(out, "{:02x}", b);
            out
        })
}
