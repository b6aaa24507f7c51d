//! Provenance arena
//!
//! Bundles keyed by id; parent links are ids resolved lazily, so a child may
//! arrive before its parents (orphan-tolerant). Cycle detection is a separate
//! validation pass over the whole index, never an insertion check.

use crate::bundle::ContextBundle;
use crate::error::FrameError;
use crate::types::BundleId;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct BundleArena {
    bundles: BTreeMap<BundleId, Arc<ContextBundle>>,
    /// parent id -> child ids; parents need not be present.
    children: BTreeMap<BundleId, BTreeSet<BundleId>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl BundleArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a bundle. Ids are write-once.
    pub fn insert(&mut self, bundle: ContextBundle) -> Result<Arc<ContextBundle>, FrameError> {
        if self.bundles.contains_key(&bundle.id) {
            return Err(FrameError::DuplicateBundle(bundle.id.clone()));
        }
        for parent in &bundle.lineage.parents {
            self.children
                .entry(parent.clone())
                .or_default()
                .insert(bundle.id.clone());
        }
        let bundle = Arc::new(bundle);
        self.bundles.insert(bundle.id.clone(), Arc::clone(&bundle));
        Ok(bundle)
    }

    pub fn get(&self, id: &BundleId) -> Option<Arc<ContextBundle>> {
        self.bundles.get(id).cloned()
    }

    pub fn contains(&self, id: &BundleId) -> bool {
        self.bundles.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    /// All bundles in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ContextBundle>> {
        self.bundles.values()
    }

    /// Ids of bundles whose frame is in `scope`; every bundle when `scope` is empty.
    pub fn ids_in_scope(&self, scope: &BTreeSet<String>) -> Vec<BundleId> {
        self.bundles
            .values()
            .filter(|b| scope.is_empty() || scope.contains(&b.frame.name))
            .map(|b| b.id.clone())
            .collect()
    }

    /// Parents that are present in the arena.
    pub fn known_parents(&self, id: &BundleId) -> Vec<&BundleId> {
        self.bundles
            .get(id)
            .map(|b| {
                b.lineage
                    .parents
                    .iter()
                    .filter(|p| self.bundles.contains_key(*p))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Children that have named `id` as a parent.
    pub fn children_of(&self, id: &BundleId) -> Vec<BundleId> {
        self.children
            .get(id)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// `(child, missing parent)` pairs for parents not yet ingested.
    pub fn missing_parents(&self) -> Vec<(BundleId, BundleId)> {
        let mut missing = Vec::new();
        for bundle in self.bundles.values() {
            for parent in &bundle.lineage.parents {
                if !self.bundles.contains_key(parent) {
                    missing.push((bundle.id.clone(), parent.clone()));
                }
            }
        }
        missing
    }

    /// Validation pass: the parent graph must be a DAG.
    ///
    /// Returns the first cycle found (in id order), as the path from the first
    /// revisited bundle back to itself.
    pub fn check_acyclic(&self) -> Result<(), FrameError> {
        let mut marks: HashMap<&BundleId, Mark> = HashMap::new();

        for root in self.bundles.keys() {
            if marks.contains_key(root) {
                continue;
            }
            marks.insert(root, Mark::Visiting);
            let mut stack: Vec<(&BundleId, usize)> = vec![(root, 0)];

            while let Some(&(node, next)) = stack.last() {
                let parents = self.known_parents(node);
                if next < parents.len() {
                    if let Some(top) = stack.last_mut() {
                        top.1 += 1;
                    }
                    let parent = parents[next];
                    match marks.get(parent) {
                        Some(Mark::Visiting) => {
                            let start = stack
                                .iter()
                                .position(|(id, _)| *id == parent)
                                .unwrap_or(0);
                            let mut path: Vec<BundleId> =
                                stack[start..].iter().map(|(id, _)| (*id).clone()).collect();
                            path.push(parent.clone());
                            return Err(FrameError::ProvenanceCycle { path });
                        }
                        Some(Mark::Done) => {}
                        None => {
                            marks.insert(parent, Mark::Visiting);
                            stack.push((parent, 0));
                        }
                    }
                } else {
                    marks.insert(node, Mark::Done);
                    stack.pop();
                }
            }
        }
        Ok(())
    }
}
