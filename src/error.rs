//! Error types for the context broker.
//!
//! Only [`BrokerError`] ever reaches a query caller. Policy denials, unresolved
//! candidates, and channel timeouts are response data, not errors.

use crate::types::{BundleId, EventId};
use thiserror::Error;

/// A single validator failure on one bundle field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Schema violations; reject ingestion of one bundle.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Missing required fields: {}", missing_fields.join(", "))]
    MissingFields { missing_fields: Vec<String> },

    #[error("Validator violation: {}", format_violations(violations))]
    ValidatorViolation { violations: Vec<Violation> },

    #[error("Frame not found: {name} (version {version:?})")]
    UnknownFrame { name: String, version: Option<u32> },

    #[error("Invalid frame definition {name}: {message}")]
    InvalidDefinition { name: String, message: String },

    #[error("Provenance cycle: {}", format_path(path))]
    ProvenanceCycle { path: Vec<BundleId> },

    #[error("Duplicate bundle id: {0}")]
    DuplicateBundle(BundleId),
}

fn format_path(path: &[BundleId]) -> String {
    path.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Content-addressed integrity failures; fatal for the affected bundle.
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("Content hash mismatch for {bundle_id}: expected {expected}, got {actual}")]
    HashMismatch {
        bundle_id: BundleId,
        expected: String,
        actual: String,
    },

    #[error("Content reference for {bundle_id} could not be resolved: {reason}")]
    Unresolvable { bundle_id: BundleId, reason: String },
}

/// Ledger append and sync errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Invalid signature on event {event_id} by {signer}")]
    InvalidSignature { event_id: EventId, signer: String },

    #[error("Malformed event {event_id}: {reason}")]
    MalformedEvent { event_id: EventId, reason: String },

    #[error("Ledger persistence error: {0}")]
    Persistence(String),

    #[error("Ledger sync failed: {0}")]
    Sync(String),

    #[error("Ledger I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors surfaced by external index services.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Index unavailable: {0}")]
    Unavailable(String),

    #[error("Index query failed: {0}")]
    QueryFailed(String),
}

/// Bundle persistence errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Bundle not found: {0}")]
    BundleNotFound(BundleId),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        StorageError::IoError(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("sled: {}", err),
        ))
    }
}

/// Ingestion errors (validation, integrity, or persistence).
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Load(String),

    #[error("Configuration validation failed:\n{0}")]
    Invalid(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::Load(err.to_string())
    }
}

/// Hard failures returned to a query caller. No partial response accompanies them.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker fault during {stage}: {message}")]
    Fault { stage: String, message: String },

    #[error("Request {0} cancelled")]
    Cancelled(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Broker initialization failed: {0}")]
    Init(String),
}

impl From<ConfigError> for BrokerError {
    fn from(err: ConfigError) -> Self {
        BrokerError::Init(err.to_string())
    }
}

impl From<FrameError> for BrokerError {
    fn from(err: FrameError) -> Self {
        BrokerError::Init(err.to_string())
    }
}

impl From<IngestError> for BrokerError {
    fn from(err: IngestError) -> Self {
        BrokerError::Init(err.to_string())
    }
}

impl From<LedgerError> for BrokerError {
    fn from(err: LedgerError) -> Self {
        BrokerError::Init(err.to_string())
    }
}

impl BrokerError {
    pub fn fault(stage: impl Into<String>, message: impl Into<String>) -> Self {
        BrokerError::Fault {
            stage: stage.into(),
            message: message.into(),
        }
    }
}
