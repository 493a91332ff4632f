//! Content digests.
//!
//! A blob's identity is the SHA-256 of its raw bytes, hex encoded. Two blobs
//! with the same digest are treated as the same content everywhere.

use sha2::{Digest, Sha256};

/// Stable lowercase-hex SHA-256 digest of `bytes`.
pub fn content_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
