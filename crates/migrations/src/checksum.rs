//! Content checksums used for drift detection

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 over `up || down`
pub fn compute_checksum(up: &str, down: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(up.as_bytes());
    hasher.update(down.as_bytes());
    hex::encode(hasher.finalize())
}
