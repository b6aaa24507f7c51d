//! Lineage Ledger
//!
//! Append-only signed event log; the only source of provenance truth. Ledger
//! order is append order. Readers work on immutable snapshots and reconstruct
//! causal order from `refs` and `(at, event_id)`.

pub mod persistence;
pub mod signing;
pub mod store;
pub mod sync;

pub use persistence::NdjsonLedgerFile;
pub use signing::{sign_event, KeyRing};
pub use store::{Ledger, LedgerSnapshot, MergeReport};
pub use sync::RemoteLedgerClient;

use crate::error::LedgerError;
use crate::types::{BundleId, EventId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lineage event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    Created,
    Transformed,
    DerivedFrom,
    LinkedTo,
    AttestedBy,
    Redacted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "created",
            EventType::Transformed => "transformed",
            EventType::DerivedFrom => "derivedFrom",
            EventType::LinkedTo => "linkedTo",
            EventType::AttestedBy => "attestedBy",
            EventType::Redacted => "redacted",
        }
    }

    /// Relation types whose meaning lives in `refs`.
    pub fn requires_refs(&self) -> bool {
        matches!(
            self,
            EventType::DerivedFrom | EventType::LinkedTo | EventType::AttestedBy
        )
    }

    pub fn parse(raw: &str) -> Option<EventType> {
        [
            EventType::Created,
            EventType::Transformed,
            EventType::DerivedFrom,
            EventType::LinkedTo,
            EventType::AttestedBy,
            EventType::Redacted,
        ]
        .into_iter()
        .find(|t| t.as_str() == raw)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// LineageEvent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageEvent {
    pub event_id: EventId,
    #[serde(rename = "type")]
    pub kind: EventType,
    /// Bundle id or content-hash reference.
    pub object: BundleId,
    #[serde(default)]
    pub refs: Vec<BundleId>,
    /// Signer identity, looked up in the [`KeyRing`].
    pub by: String,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
    /// Hex ed25519 signature over every other field.
    #[serde(default)]
    pub sig: String,
}

impl LineageEvent {
    /// Unsigned event.
    pub fn new(
        event_id: EventId,
        kind: EventType,
        object: impl Into<BundleId>,
        by: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        LineageEvent {
            event_id,
            kind,
            object: object.into(),
            refs: Vec::new(),
            by: by.into(),
            at,
            payload: Value::Null,
            sig: String::new(),
        }
    }

    pub fn with_refs(mut self, refs: Vec<BundleId>) -> Self {
        self.refs = refs;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Deduplication key.
    pub fn key(&self) -> (EventId, String) {
        (self.event_id.clone(), self.sig.clone())
    }

    /// Whether `id` is the object or one of the refs.
    pub fn references(&self, id: &BundleId) -> bool {
        self.object == *id || self.refs.contains(id)
    }

    /// Structural checks run before signature verification.
    pub fn check_well_formed(&self) -> Result<(), LedgerError> {
        let malformed = |reason: &str| LedgerError::MalformedEvent {
            event_id: self.event_id.clone(),
            reason: reason.to_string(),
        };
        if self.event_id.is_empty() {
            return Err(malformed("missing event_id"));
        }
        if self.object.as_str().is_empty() {
            return Err(malformed("missing object"));
        }
        if self.by.trim().is_empty() {
            return Err(malformed("missing signer"));
        }
        if self.sig.is_empty() {
            return Err(malformed("missing sig"));
        }
        if self.kind.requires_refs() && self.refs.is_empty() {
            return Err(malformed(&format!("{} event without refs", self.kind)));
        }
        Ok(())
    }
}

/// Issues `<writer>:<seq>` ids, monotonically increasing for one writer.
#[derive(Debug)]
pub struct EventIdGenerator {
    writer: String,
    next: AtomicU64,
}

impl EventIdGenerator {
    pub fn new(writer: impl Into<String>) -> Self {
        EventIdGenerator {
            writer: writer.into(),
            next: AtomicU64::new(1),
        }
    }

    /// Continue after the highest sequence this writer has already used.
    pub fn resume(writer: impl Into<String>, snapshot: &LedgerSnapshot) -> Self {
        let writer = writer.into();
        let last = snapshot.last_sequence(&writer).unwrap_or(0);
        EventIdGenerator {
            writer,
            next: AtomicU64::new(last + 1),
        }
    }

    pub fn writer(&self) -> &str {
        &self.writer
    }

    pub fn next_id(&self) -> EventId {
        EventId::for_writer(&self.writer, self.next.fetch_add(1, Ordering::SeqCst))
    }
}

/// Split an event id into writer and sequence.
pub fn parse_event_id(id: &EventId) -> Option<(&str, u64)> {
    let (writer, seq) = id.as_str().rsplit_once(':')?;
    u64::from_str_radix(seq, 16).ok().map(|seq| (writer, seq))
}
