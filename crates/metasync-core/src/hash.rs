//! Content hashing for large text values such as view definitions

use sha2::{Digest, Sha256};

/// Hex SHA-256 of the raw text
///
/// The text is hashed as-is: whitespace-only edits produce a new hash.
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}
