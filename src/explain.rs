//! Explain & Coherence Engine
//!
//! Renders one explain entry per returned row (and one per denial) with a
//! fixed line order, so identical bundle state and an identical query always
//! produce byte-identical explanations.

use crate::evidence::{Channel, EvidenceRecord};
use crate::policy::{DenialReason, PolicyOutcome};
use crate::resolution::format_metric;
use crate::types::BundleId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Cap on `why` lines per entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttentionBudget {
    Low,
    #[default]
    Medium,
    High,
}

impl AttentionBudget {
    /// `None` = unbounded.
    pub fn max_lines(self) -> Option<usize> {
        match self {
            AttentionBudget::Low => Some(3),
            AttentionBudget::Medium => Some(6),
            AttentionBudget::High => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoherenceWeights {
    pub symbolic: f64,
    pub vector: f64,
    pub lineage: f64,
}

impl Default for CoherenceWeights {
    fn default() -> Self {
        CoherenceWeights {
            symbolic: 0.4,
            vector: 0.4,
            lineage: 0.2,
        }
    }
}

impl CoherenceWeights {
    fn weight(&self, channel: Channel) -> f64 {
        match channel {
            Channel::Symbolic => self.symbolic,
            Channel::Vector => self.vector,
            Channel::Lineage => self.lineage,
        }
    }
}

/// Per-channel agreement signals; `None` for channels the request did not use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CoherenceInputs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbolic: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lineage: Option<f64>,
}

impl CoherenceInputs {
    fn get(&self, channel: Channel) -> Option<f64> {
        match channel {
            Channel::Symbolic => self.symbolic,
            Channel::Vector => self.vector,
            Channel::Lineage => self.lineage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coherence {
    pub score: f64,
    pub inputs: CoherenceInputs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStatus {
    Met,
    Exploratory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExplainKind {
    Row,
    Denial,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExplainEntry {
    pub id: BundleId,
    pub kind: ExplainKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_status: Option<ResolutionStatus>,
    pub exploratory: bool,
    /// Unresolved reason carried by exploratory rows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub why: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coherence: Option<Coherence>,
    /// Channels that produced a signal, in priority order.
    pub channels: Vec<Channel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_class: Option<String>,
}

/// Everything known about one row at explain time.
#[derive(Debug, Clone, Copy)]
pub struct RowContext<'a> {
    pub record: &'a EvidenceRecord,
    pub coherence: &'a Coherence,
    pub separation: Option<f64>,
    /// The unresolved reason when the row was drawn by exploration.
    pub exploration: Option<&'a str>,
    pub outcome: &'a PolicyOutcome,
}

#[derive(Debug, Clone)]
pub struct ExplainEngine {
    weights: CoherenceWeights,
    lineage_depth: u32,
}

impl ExplainEngine {
    pub fn new(weights: CoherenceWeights, lineage_depth: u32) -> Self {
        ExplainEngine {
            weights,
            lineage_depth,
        }
    }

    /// Weighted mean over the requested channels, weights renormalized.
    pub fn coherence(&self, record: &EvidenceRecord, channels: &BTreeSet<Channel>) -> Coherence {
        let wants = |c: Channel| channels.contains(&c);
        let inputs = CoherenceInputs {
            symbolic: wants(Channel::Symbolic).then(|| if record.symbolic_hit { 1.0 } else { 0.0 }),
            vector: wants(Channel::Vector)
                .then(|| record.vector_score.unwrap_or(0.0).clamp(0.0, 1.0)),
            lineage: wants(Channel::Lineage).then(|| {
                record.lineage_hops.map_or(0.0, |hops| {
                    (1.0 - f64::from(hops) / (f64::from(self.lineage_depth) + 1.0)).max(0.0)
                })
            }),
        };

        let (mut weighted, mut total) = (0.0, 0.0);
        for channel in Channel::ALL {
            if let Some(signal) = inputs.get(channel) {
                let weight = self.weights.weight(channel);
                weighted += weight * signal;
                total += weight;
            }
        }
        let score = if total > 0.0 {
            (weighted / total).clamp(0.0, 1.0)
        } else {
            0.0
        };
        Coherence { score, inputs }
    }

    pub fn render(&self, row: &RowContext<'_>, budget: AttentionBudget) -> ExplainEntry {
        let record = row.record;
        let mut why = Vec::new();

        if let Some(hit) = row.coherence.inputs.symbolic.map(|s| s > 0.0) {
            why.push(if hit {
                "symbolic: filter match".to_string()
            } else {
                "symbolic: no filter match".to_string()
            });
        }
        if row.coherence.inputs.vector.is_some() {
            why.push(match (record.vector_score, row.separation) {
                (Some(score), Some(sep)) => format!(
                    "vector: similarity {} (separation {})",
                    format_metric(score),
                    format_metric(sep)
                ),
                (Some(score), None) => format!("vector: similarity {}", format_metric(score)),
                (None, _) => "vector: no similarity hit".to_string(),
            });
        }
        if row.coherence.inputs.lineage.is_some() {
            why.push(match record.lineage_hops {
                Some(1) => "lineage: 1 hop".to_string(),
                Some(hops) => format!("lineage: {} hops", hops),
                None => "lineage: unreached".to_string(),
            });
        }
        why.push(support_line(record));
        why.push(policy_line(row.outcome));
        if let Some(reason) = row.exploration {
            why.push(format!("exploration: sampled from unresolved ({})", reason));
        }
        truncate(&mut why, budget);

        ExplainEntry {
            id: record.bundle_id.clone(),
            kind: ExplainKind::Row,
            resolution_status: Some(if row.exploration.is_some() {
                ResolutionStatus::Exploratory
            } else {
                ResolutionStatus::Met
            }),
            exploratory: row.exploration.is_some(),
            reason: row.exploration.map(str::to_string),
            why,
            coherence: Some(*row.coherence),
            channels: signalled_channels(record),
            policy_class: row.outcome.policy_class().map(str::to_string),
        }
    }

    /// Denial entry: names the policy class, never the content.
    pub fn render_denial(&self, id: &BundleId, outcome: &PolicyOutcome) -> ExplainEntry {
        ExplainEntry {
            id: id.clone(),
            kind: ExplainKind::Denial,
            resolution_status: None,
            exploratory: false,
            reason: None,
            why: vec![policy_line(outcome)],
            coherence: None,
            channels: Vec::new(),
            policy_class: outcome.policy_class().map(str::to_string),
        }
    }
}

fn support_line(record: &EvidenceRecord) -> String {
    if record.support.is_empty() {
        return "support: none".to_string();
    }
    let mut domains = record.support_domains();
    domains.sort_unstable();
    let mut line = format!(
        "support: {} domain{} [{}] from {} attestation{}",
        domains.len(),
        if domains.len() == 1 { "" } else { "s" },
        domains.join(", "),
        record.raw_support,
        if record.raw_support == 1 { "" } else { "s" },
    );
    if record.has_pending() {
        line.push_str(" (pending)");
    }
    line
}

fn policy_line(outcome: &PolicyOutcome) -> String {
    match outcome {
        PolicyOutcome::Allowed {
            policy_class: None, ..
        } => "policy: no read rules".to_string(),
        PolicyOutcome::Allowed { raw: true, policy_class: Some(class), .. } => {
            format!("policy: raw view under {}", class)
        }
        PolicyOutcome::Allowed {
            redacted_fields,
            policy_class: Some(class),
            ..
        } if !redacted_fields.is_empty() => format!(
            "policy: redacted {} by {}",
            redacted_fields.join(", "),
            class
        ),
        PolicyOutcome::Allowed {
            policy_class: Some(class),
            ..
        } => format!("policy: allowed by {}", class),
        PolicyOutcome::Denied {
            policy_class,
            reason,
        } => {
            let reason = match reason {
                DenialReason::NoMatchingRule => "no matching rule",
                DenialReason::Expired => "expired",
                DenialReason::Purpose => "purpose not permitted",
            };
            format!("policy: denied by {} ({})", policy_class, reason)
        }
    }
}

fn signalled_channels(record: &EvidenceRecord) -> Vec<Channel> {
    Channel::ALL
        .into_iter()
        .filter(|c| match c {
            Channel::Symbolic => record.symbolic_hit,
            Channel::Vector => record.vector_score.is_some(),
            Channel::Lineage => record.lineage_hops.is_some(),
        })
        .collect()
}

/// Keep the highest-priority prefix.
fn truncate(why: &mut Vec<String>, budget: AttentionBudget) {
    if let Some(max) = budget.max_lines() {
        why.truncate(max);
    }
}
