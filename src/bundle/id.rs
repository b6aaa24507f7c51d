//! Content hashing for bundles
//!
//! `refs.content_hash = hex(blake3(content_bytes))`, where the content bytes of
//! an inline payload are its canonical JSON encoding (object keys sorted).

use crate::types::Hash;
use blake3::Hasher;
use serde_json::Value;

/// Compute the BLAKE3 hash of raw content bytes.
pub fn compute_content_hash(bytes: &[u8]) -> Hash {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    *hasher.finalize().as_bytes()
}

/// Canonical byte encoding of an inline payload.
///
/// `serde_json::Map` is ordered by key, so equal values always encode identically.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}

/// Hex content hash of an inline payload.
pub fn inline_content_hash_hex(value: &Value) -> String {
    hex::encode(compute_content_hash(&canonical_bytes(value)))
}
