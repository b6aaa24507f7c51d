//! Resolution Floor Enforcer
//!
//! Decides whether a candidate's evidence is strong enough to assert. Anything
//! below the floor is reported as unresolved with a machine-readable reason,
//! and a small exploration share of the best unresolved candidates is
//! surfaced alongside the resolved rows.

use crate::bundle::ResolutionLimits;
use crate::evidence::EvidenceRecord;
use crate::types::BundleId;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;

pub const DEFAULT_EXPLORATION_FRACTION: f64 = 0.07;
/// Upper bound on the exploratory share of returned rows.
pub const MAX_EXPLORATION_SHARE: f64 = 0.10;
pub const DEFAULT_PENDING_DISCOUNT: f64 = 0.8;

/// Fixed 4-decimal rendering with trailing zeros trimmed (`0.5`, `0.4167`, `1`).
pub fn format_metric(value: f64) -> String {
    let rendered = format!("{:.4}", value);
    let trimmed = rendered.trim_end_matches('0').trim_end_matches('.');
    match trimmed {
        "" | "-0" => "0".to_string(),
        other => other.to_string(),
    }
}

/// Measured evidence strength for one candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub id: BundleId,
    /// Deduplicated support count.
    pub support: u32,
    /// `None` when the candidate has no vector evidence.
    pub separation: Option<f64>,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved,
    Unresolved { reason: String },
}

impl Resolution {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Resolution::Resolved)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Resolution::Resolved => None,
            Resolution::Unresolved { reason } => Some(reason),
        }
    }
}

/// Check support, then separation, then confidence. The first failing check
/// names the reason.
pub fn classify(assessment: &Assessment, limits: &ResolutionLimits) -> Resolution {
    let min_support = limits.min_support_or_zero();
    if assessment.support < min_support {
        return Resolution::Unresolved {
            reason: format!("support<{} ({})", min_support, assessment.support),
        };
    }
    if let Some(separation) = assessment.separation {
        let min_separation = limits.min_separation_or_zero();
        if separation < min_separation {
            return Resolution::Unresolved {
                reason: format!(
                    "separation<{} ({})",
                    format_metric(min_separation),
                    format_metric(separation)
                ),
            };
        }
    }
    let min_confidence = limits.confidence_or_zero();
    if assessment.confidence < min_confidence {
        return Resolution::Unresolved {
            reason: format!(
                "confidence<{} ({})",
                format_metric(min_confidence),
                format_metric(assessment.confidence)
            ),
        };
    }
    Resolution::Resolved
}

/// Vector separation per candidate: own similarity minus the best similarity
/// of any candidate from a different origin domain, clamped to [0, 1].
///
/// Candidates without an origin domain count as distinct from everyone.
pub fn separations(candidates: &BTreeMap<BundleId, EvidenceRecord>) -> BTreeMap<BundleId, f64> {
    let scored: Vec<(&BundleId, f64, Option<&str>)> = candidates
        .values()
        .filter_map(|r| {
            r.vector_score
                .map(|s| (&r.bundle_id, s, r.origin_domain.as_deref()))
        })
        .collect();

    scored
        .iter()
        .map(|(id, score, domain)| {
            let rival = scored
                .iter()
                .filter(|(other, _, other_domain)| {
                    other != id && (domain.is_none() || other_domain != domain)
                })
                .map(|(_, s, _)| *s)
                .fold(None, |best: Option<f64>, s| Some(best.map_or(s, |b| b.max(s))));
            let separation = match rival {
                Some(best) => score - best,
                None => *score,
            };
            ((*id).clone(), separation.clamp(0.0, 1.0))
        })
        .collect()
}

/// An unresolved candidate as reported in telemetry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnresolvedCandidate {
    pub id: BundleId,
    pub reason: String,
    pub confidence: f64,
}

/// Classification of every gathered candidate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Partition {
    /// Sorted by id.
    pub resolved: Vec<BundleId>,
    /// Exploration picks in rank order.
    pub exploratory: Vec<UnresolvedCandidate>,
    /// Remaining unresolved, sorted by id.
    pub unresolved: Vec<UnresolvedCandidate>,
}

impl Partition {
    pub fn len(&self) -> usize {
        self.resolved.len() + self.exploratory.len() + self.unresolved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolutionEnforcer {
    exploration_fraction: f64,
    pending_discount: f64,
}

impl Default for ResolutionEnforcer {
    fn default() -> Self {
        ResolutionEnforcer::new(DEFAULT_EXPLORATION_FRACTION, DEFAULT_PENDING_DISCOUNT)
    }
}

impl ResolutionEnforcer {
    pub fn new(exploration_fraction: f64, pending_discount: f64) -> Self {
        ResolutionEnforcer {
            exploration_fraction,
            pending_discount,
        }
    }

    /// Aggregate confidence: coherence, discounted when support is pending.
    pub fn confidence(&self, coherence: f64, pending: bool) -> f64 {
        if pending {
            coherence * self.pending_discount
        } else {
            coherence
        }
    }

    /// `ceil(fraction × resolved)`, tolerant of float noise (0.07 × 100 = 7),
    /// then capped so picks stay within [`MAX_EXPLORATION_SHARE`] of returned
    /// rows. Fewer than nine resolved rows leave no room for a pick.
    pub fn exploration_count(&self, resolved: usize) -> usize {
        let raw = self.exploration_fraction * resolved as f64 - 1e-9;
        if raw <= 0.0 {
            return 0;
        }
        // picks <= share × (resolved + picks)
        let cap = (MAX_EXPLORATION_SHARE * resolved as f64 / (1.0 - MAX_EXPLORATION_SHARE) + 1e-9)
            .floor() as usize;
        (raw.ceil() as usize).min(cap)
    }

    /// Classify each candidate against its effective limits and draw the
    /// exploration sample from the unresolved ones.
    pub fn partition<I>(&self, assessed: I) -> Partition
    where
        I: IntoIterator<Item = (Assessment, ResolutionLimits)>,
    {
        let mut partition = Partition::default();
        let mut unresolved = Vec::new();
        for (assessment, limits) in assessed {
            match classify(&assessment, &limits) {
                Resolution::Resolved => partition.resolved.push(assessment.id),
                Resolution::Unresolved { reason } => unresolved.push(UnresolvedCandidate {
                    id: assessment.id,
                    reason,
                    confidence: assessment.confidence,
                }),
            }
        }
        partition.resolved.sort();

        unresolved.sort_by(rank);
        let picks = self.exploration_count(partition.resolved.len()).min(unresolved.len());
        let mut rest = unresolved.split_off(picks);
        partition.exploratory = unresolved;
        rest.sort_by(|a, b| a.id.cmp(&b.id));
        partition.unresolved = rest;
        partition
    }
}

/// Exploration rank: confidence desc, then id asc.
fn rank(a: &UnresolvedCandidate, b: &UnresolvedCandidate) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then_with(|| a.id.cmp(&b.id))
}
