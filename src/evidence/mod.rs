//! Evidence Aggregator
//!
//! Collects per-candidate signals from the symbolic, vector, and lineage
//! channels, then attaches deduplicated ledger support. Origin domain is the
//! diversity unit: attestations that share a domain count once.

pub mod aggregator;
pub mod support;

pub use aggregator::{AggregatorSettings, EvidenceAggregator, GatherQuery, Gathered};
pub use support::{dedupe_support, RawSupport, SupportUnit};

use crate::types::BundleId;
use serde::{Deserialize, Serialize};

/// Evidence channel, in explain priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Symbolic,
    Vector,
    Lineage,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Symbolic, Channel::Vector, Channel::Lineage];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Symbolic => "symbolic",
            Channel::Vector => "vector",
            Channel::Lineage => "lineage",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything gathered about one candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvidenceRecord {
    pub bundle_id: BundleId,
    pub frame: String,
    pub symbolic_hit: bool,
    pub vector_score: Option<f64>,
    /// Minimum hop count from another seed; `None` when unreached.
    pub lineage_hops: Option<u32>,
    pub origin_domain: Option<String>,
    /// Diversity units, sorted by domain.
    pub support: Vec<SupportUnit>,
    /// Attestations before domain deduplication.
    pub raw_support: usize,
}

impl EvidenceRecord {
    pub fn new(bundle_id: BundleId, frame: impl Into<String>) -> Self {
        EvidenceRecord {
            bundle_id,
            frame: frame.into(),
            symbolic_hit: false,
            vector_score: None,
            lineage_hops: None,
            origin_domain: None,
            support: Vec::new(),
            raw_support: 0,
        }
    }

    /// Deduplicated support count.
    pub fn support_count(&self) -> u32 {
        u32::try_from(self.support.len()).unwrap_or(u32::MAX)
    }

    pub fn has_pending(&self) -> bool {
        self.support.iter().any(|u| u.pending)
    }

    pub fn support_domains(&self) -> Vec<&str> {
        self.support.iter().map(|u| u.domain.as_str()).collect()
    }
}
