//! Graph index served by the ledger itself.
//!
//! Edges come from relation events (`object` <-> each ref) and from bundle
//! `lineage.parents`. Edges are walked in both directions.

use crate::bundle::{BundleArena, BundleStore};
use crate::error::IndexError;
use crate::index::GraphIndex;
use crate::ledger::{EventType, Ledger, LedgerSnapshot};
use crate::types::BundleId;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Relation name accepting every provenance edge.
pub const ANY_RELATION: &str = "*";

const PROVENANCE_EDGES: [EventType; 3] = [
    EventType::DerivedFrom,
    EventType::LinkedTo,
    EventType::Transformed,
];

enum Source {
    Live {
        ledger: Arc<Ledger>,
        bundles: Arc<BundleStore>,
    },
    Pinned {
        ledger: Arc<LedgerSnapshot>,
        arena: Arc<BundleArena>,
    },
}

pub struct LedgerGraphIndex {
    source: Source,
}

impl LedgerGraphIndex {
    /// Reads whatever the ledger and store hold at call time.
    pub fn new(ledger: Arc<Ledger>, bundles: Arc<BundleStore>) -> Self {
        LedgerGraphIndex {
            source: Source::Live { ledger, bundles },
        }
    }

    /// Reads only the given snapshots.
    pub fn at(ledger: Arc<LedgerSnapshot>, arena: Arc<BundleArena>) -> Self {
        LedgerGraphIndex {
            source: Source::Pinned { ledger, arena },
        }
    }

    fn views(&self) -> (Arc<LedgerSnapshot>, Arc<BundleArena>) {
        match &self.source {
            Source::Live { ledger, bundles } => (ledger.snapshot(), bundles.snapshot()),
            Source::Pinned { ledger, arena } => (Arc::clone(ledger), Arc::clone(arena)),
        }
    }

    fn edge_types(relation: &str) -> Result<Vec<EventType>, IndexError> {
        if relation == ANY_RELATION {
            return Ok(PROVENANCE_EDGES.to_vec());
        }
        EventType::parse(relation)
            .map(|t| vec![t])
            .ok_or_else(|| IndexError::QueryFailed(format!("unknown relation '{}'", relation)))
    }
}

#[async_trait]
impl GraphIndex for LedgerGraphIndex {
    async fn neighbors(
        &self,
        id: &BundleId,
        relation: &str,
        depth: u32,
    ) -> Result<BTreeSet<BundleId>, IndexError> {
        let edge_types = Self::edge_types(relation)?;
        let follow_parents = edge_types.contains(&EventType::DerivedFrom);
        let (ledger, arena) = self.views();

        let mut seen: BTreeSet<BundleId> = BTreeSet::from([id.clone()]);
        let mut frontier = vec![id.clone()];
        for _ in 0..depth {
            let mut next = Vec::new();
            for node in &frontier {
                let mut adjacent: Vec<BundleId> = Vec::new();
                for event in ledger.events_for(node) {
                    if !edge_types.contains(&event.kind) {
                        continue;
                    }
                    if event.object == *node {
                        adjacent.extend(event.refs.iter().cloned());
                    } else {
                        adjacent.push(event.object.clone());
                    }
                }
                if follow_parents {
                    if let Some(bundle) = arena.get(node) {
                        adjacent.extend(bundle.lineage.parents.iter().cloned());
                    }
                    adjacent.extend(arena.children_of(node));
                }
                for neighbor in adjacent {
                    if seen.insert(neighbor.clone()) {
                        next.push(neighbor);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        seen.remove(id);
        Ok(seen)
    }

    fn pinned(
        &self,
        ledger: &Arc<LedgerSnapshot>,
        arena: &Arc<BundleArena>,
    ) -> Option<Arc<dyn GraphIndex>> {
        Some(Arc::new(LedgerGraphIndex::at(Arc::clone(ledger), Arc::clone(arena))))
    }
}
