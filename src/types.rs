//! Shared identifier types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// BLAKE3 digest.
pub type Hash = [u8; 32];

/// ContextBundle identifier: a hyphenated UUIDv7, so ids sort by creation time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundleId(String);

impl BundleId {
    /// Mint a fresh time-sortable id.
    pub fn generate() -> Self {
        BundleId(uuid::Uuid::now_v7().hyphenated().to_string())
    }

    pub fn new(raw: impl Into<String>) -> Self {
        BundleId(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BundleId {
    fn from(raw: &str) -> Self {
        BundleId(raw.to_string())
    }
}

impl From<String> for BundleId {
    fn from(raw: String) -> Self {
        BundleId(raw)
    }
}

/// Ledger event identifier, `<writer>:<seq>` with a zero-padded hex sequence
/// so lexical order equals issue order for a single writer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn for_writer(writer: &str, seq: u64) -> Self {
        EventId(format!("{}:{:016x}", writer, seq))
    }

    pub fn new(raw: impl Into<String>) -> Self {
        EventId(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(raw: &str) -> Self {
        EventId(raw.to_string())
    }
}
