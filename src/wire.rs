//! Request and response wire format (JSON).

use crate::bundle::ResolutionLimits;
use crate::evidence::Channel;
use crate::explain::{AttentionBudget, ExplainEntry, ResolutionStatus};
use crate::index::Filters;
use crate::policy::PolicyView;
use crate::resolution::UnresolvedCandidate;
use crate::types::BundleId;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub intent: String,
    /// Frame scope. Accepts a single name or a list; empty means every frame.
    #[serde(default, deserialize_with = "frame_scope")]
    pub frame: BTreeSet<String>,
    #[serde(default)]
    pub filters: Filters,
    #[serde(default)]
    pub resolution: ResolutionLimits,
    #[serde(default)]
    pub attention_budget: AttentionBudget,
    /// Channels to consult. Empty means all of them.
    #[serde(default)]
    pub evidence: Vec<Channel>,
    #[serde(default)]
    pub policy_view: PolicyView,
}

fn frame_scope<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scope {
        One(String),
        Many(Vec<String>),
    }
    Ok(match Option::<Scope>::deserialize(deserializer)? {
        None => BTreeSet::new(),
        Some(Scope::One(name)) if name.is_empty() => BTreeSet::new(),
        Some(Scope::One(name)) => BTreeSet::from([name]),
        Some(Scope::Many(names)) => names.into_iter().filter(|n| !n.is_empty()).collect(),
    })
}

impl QueryRequest {
    pub fn new(intent: impl Into<String>) -> Self {
        QueryRequest {
            intent: intent.into(),
            ..Default::default()
        }
    }

    pub fn with_frame(mut self, frame: impl Into<String>) -> Self {
        self.frame.insert(frame.into());
        self
    }

    pub fn with_filter(mut self, path: impl Into<String>, value: Value) -> Self {
        self.filters.insert(path.into(), value);
        self
    }

    pub fn with_resolution(mut self, resolution: ResolutionLimits) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn with_budget(mut self, budget: AttentionBudget) -> Self {
        self.attention_budget = budget;
        self
    }

    pub fn with_evidence(mut self, channels: &[Channel]) -> Self {
        self.evidence = channels.to_vec();
        self
    }

    pub fn with_view(mut self, view: PolicyView) -> Self {
        self.policy_view = view;
        self
    }

    pub fn channels(&self) -> BTreeSet<Channel> {
        if self.evidence.is_empty() {
            Channel::ALL.into_iter().collect()
        } else {
            self.evidence.iter().copied().collect()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    pub id: BundleId,
    pub frame: String,
    pub resolution_status: ResolutionStatus,
    pub coherence: f64,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub redacted_fields: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_domain: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Telemetry {
    pub coherence_score: f64,
    pub unresolved_clusters: Vec<UnresolvedCandidate>,
    pub redaction_rate: f64,
    pub attention_used_ms: u64,
    pub denied: usize,
    pub view_downgraded: bool,
    pub timed_out_channels: Vec<Channel>,
    pub exploratory: usize,
    /// Rows whose support includes pending attestations.
    pub pending_evidence: usize,
    pub integrity_failures: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResponse {
    pub request_id: String,
    pub rows: Vec<Row>,
    /// One entry per row in row order, then denial entries by id.
    pub explain: Vec<ExplainEntry>,
    pub telemetry: Telemetry,
}

impl QueryResponse {
    pub fn row(&self, id: &BundleId) -> Option<&Row> {
        self.rows.iter().find(|r| &r.id == id)
    }

    /// Explain entry keyed by row id.
    pub fn explain_for(&self, id: &BundleId) -> Option<&ExplainEntry> {
        self.explain.iter().find(|e| &e.id == id)
    }
}
