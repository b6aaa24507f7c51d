//! Support counting with origin-domain deduplication.

use crate::bundle::{normalize_domain, BundleArena};
use crate::ledger::{EventType, LedgerSnapshot, LineageEvent};
use crate::types::BundleId;
use serde::Serialize;
use std::collections::BTreeMap;

/// One attestation before deduplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSupport {
    pub domain: String,
    pub source: String,
    pub pending: bool,
}

/// Attestations collapsed onto one origin domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupportUnit {
    pub domain: String,
    /// Attesting bundles or signers, sorted.
    pub sources: Vec<String>,
    /// True when any merged attestation references an unknown object.
    pub pending: bool,
}

/// Merge raw attestations by domain. Output is sorted by domain.
pub fn dedupe_support(raw: &[RawSupport]) -> Vec<SupportUnit> {
    let mut by_domain: BTreeMap<&str, SupportUnit> = BTreeMap::new();
    for item in raw {
        let unit = by_domain
            .entry(item.domain.as_str())
            .or_insert_with(|| SupportUnit {
                domain: item.domain.clone(),
                sources: Vec::new(),
                pending: false,
            });
        unit.sources.push(item.source.clone());
        unit.pending |= item.pending;
    }
    by_domain
        .into_values()
        .map(|mut unit| {
            unit.sources.sort();
            unit.sources.dedup();
            unit
        })
        .collect()
}

/// Raw attestations of `candidate`: `attestedBy` events whose object it is.
///
/// The unit's domain is the attesting bundle's origin (`refs[0]`) when that
/// bundle is known, else `payload.domain`, else the signer. A ref unknown to
/// both the ledger and the bundle arena marks the unit pending.
pub fn collect_support(
    candidate: &BundleId,
    ledger: &LedgerSnapshot,
    arena: &BundleArena,
) -> Vec<RawSupport> {
    ledger
        .events_for(candidate)
        .iter()
        .filter(|e| e.kind == EventType::AttestedBy && e.object == *candidate)
        .map(|event| raw_support(event, ledger, arena))
        .collect()
}

fn raw_support(event: &LineageEvent, ledger: &LedgerSnapshot, arena: &BundleArena) -> RawSupport {
    let attester = event.refs.first();
    let from_bundle = attester
        .and_then(|id| arena.get(id))
        .and_then(|bundle| bundle.origin_domain());
    let from_payload = || {
        event
            .payload
            .get("domain")
            .and_then(|d| d.as_str())
            .map(normalize_domain)
            .filter(|d| !d.is_empty())
    };
    let domain = from_bundle
        .or_else(from_payload)
        .unwrap_or_else(|| normalize_domain(&event.by));
    let pending = event
        .refs
        .iter()
        .any(|r| !ledger.is_known(r) && !arena.contains(r));
    RawSupport {
        domain,
        source: attester
            .map(|id| id.to_string())
            .unwrap_or_else(|| event.by.clone()),
        pending,
    }
}
