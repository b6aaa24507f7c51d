//! In-memory symbolic and vector indexes.

use crate::bundle::ContextBundle;
use crate::error::IndexError;
use crate::frame::validate::lookup_path;
use crate::index::{Filters, SymbolicIndex, VectorIndex};
use crate::types::BundleId;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Filter match over a per-bundle document:
/// `{ "frame", "domain", "keywords", "content" }`.
///
/// A filter holds when the value at its path equals the expected value, or,
/// for array values, contains it. An empty filter set matches nothing.
#[derive(Default)]
pub struct InMemorySymbolicIndex {
    docs: RwLock<BTreeMap<BundleId, (String, Value)>>,
    delay: Option<Duration>,
}

impl InMemorySymbolicIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated query latency.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn insert(&self, bundle: &ContextBundle) {
        let doc = json!({
            "frame": bundle.frame.name,
            "domain": bundle.origin_domain(),
            "keywords": bundle.semantics.keywords,
            "content": bundle.inline_content().cloned().unwrap_or(Value::Null),
        });
        self.docs
            .write()
            .insert(bundle.id.clone(), (bundle.frame.name.clone(), doc));
    }
}

fn filter_holds(doc: &Value, path: &str, expected: &Value) -> bool {
    match lookup_path(doc, path) {
        Some(Value::Array(items)) if !expected.is_array() => items.contains(expected),
        Some(actual) => actual == expected,
        None => false,
    }
}

#[async_trait]
impl SymbolicIndex for InMemorySymbolicIndex {
    async fn query(
        &self,
        filters: &Filters,
        frame_scope: &BTreeSet<String>,
    ) -> Result<BTreeSet<BundleId>, IndexError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if filters.is_empty() {
            return Ok(BTreeSet::new());
        }
        let docs = self.docs.read();
        Ok(docs
            .iter()
            .filter(|(_, (frame, _))| frame_scope.is_empty() || frame_scope.contains(frame))
            .filter(|(_, (_, doc))| {
                filters
                    .iter()
                    .all(|(path, expected)| filter_holds(doc, path, expected))
            })
            .map(|(id, _)| id.clone())
            .collect())
    }
}

/// Cosine similarity over registered vectors, clamped to [0, 1].
///
/// Query handles and bundles share one vector table; a bundle is registered
/// under its id and optionally its `semantics.embedding` handle.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    handles: RwLock<BTreeMap<String, Vec<f32>>>,
    bundles: RwLock<BTreeMap<BundleId, Vec<f32>>>,
    delay: Option<Duration>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Register a query handle (e.g. an intent string).
    pub fn insert_handle(&self, handle: impl Into<String>, vector: Vec<f32>) {
        self.handles.write().insert(handle.into(), vector);
    }

    pub fn insert_bundle(&self, id: BundleId, vector: Vec<f32>) {
        self.bundles.write().insert(id, vector);
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| f64::from(*x) * f64::from(*y)).sum();
    let norm_a: f64 = a.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn nearest(
        &self,
        embedding_handle: &str,
        k: usize,
    ) -> Result<Vec<(BundleId, f64)>, IndexError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let Some(query) = self.handles.read().get(embedding_handle).cloned() else {
            return Ok(Vec::new());
        };
        let mut scored: Vec<(BundleId, f64)> = self
            .bundles
            .read()
            .iter()
            .map(|(id, vector)| (id.clone(), cosine(&query, vector)))
            .filter(|(_, score)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }
}
