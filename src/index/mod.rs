//! External index boundary.
//!
//! The relational, vector, and graph engines are pluggable lookup services.
//! The broker only sees these traits; `memory` holds reference implementations
//! and `lineage` serves the graph index from the ledger.

pub mod lineage;
pub mod memory;

pub use lineage::LedgerGraphIndex;
pub use memory::{InMemorySymbolicIndex, InMemoryVectorIndex};

use crate::bundle::BundleArena;
use crate::error::IndexError;
use crate::ledger::LedgerSnapshot;
use crate::types::BundleId;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Request filters: dotted field path -> expected value.
pub type Filters = Map<String, Value>;

/// Exact-match/boolean lookup.
#[async_trait]
pub trait SymbolicIndex: Send + Sync {
    async fn query(
        &self,
        filters: &Filters,
        frame_scope: &BTreeSet<String>,
    ) -> Result<BTreeSet<BundleId>, IndexError>;
}

/// Similarity lookup. Results are ordered best first.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn nearest(
        &self,
        embedding_handle: &str,
        k: usize,
    ) -> Result<Vec<(BundleId, f64)>, IndexError>;
}

/// Provenance neighborhood lookup.
#[async_trait]
pub trait GraphIndex: Send + Sync {
    async fn neighbors(
        &self,
        id: &BundleId,
        relation: &str,
        depth: u32,
    ) -> Result<BTreeSet<BundleId>, IndexError>;

    /// A view of this index bound to one request's snapshots.
    ///
    /// Indexes that read the ledger return `Some` so lineage sees the same
    /// state as support counting. External engines keep their own view.
    fn pinned(
        &self,
        _ledger: &Arc<LedgerSnapshot>,
        _arena: &Arc<BundleArena>,
    ) -> Option<Arc<dyn GraphIndex>> {
        None
    }
}
