//! Context Broker: evidence-resolving query engine over signed lineage
//!
//! Answers requests against symbolic, vector, and lineage evidence while
//! enforcing declared resolution floors, least-privilege redaction, and
//! deterministic explanations. Provenance comes from an append-only, signed
//! lineage ledger that merges out-of-order events from many writers.

pub mod broker;
pub mod bundle;
pub mod config;
pub mod error;
pub mod evidence;
pub mod explain;
pub mod frame;
pub mod index;
pub mod ledger;
pub mod logging;
pub mod policy;
pub mod resolution;
pub mod types;
pub mod wire;

pub use broker::{CancelHandle, ContextBroker, ContextBrokerBuilder, RequestStage};
pub use bundle::{BundleStore, ContextBundle};
pub use config::{BrokerConfig, ConfigLoader};
pub use error::BrokerError;
pub use ledger::{KeyRing, Ledger, LineageEvent};
pub use policy::Requester;
pub use types::{BundleId, EventId};
pub use wire::{QueryRequest, QueryResponse};
