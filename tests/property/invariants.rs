//! Property-based tests for support counting, partitioning, explain budgets,
//! and ledger merge.

use chrono::{TimeZone, Utc};
use context_broker::bundle::ResolutionLimits;
use context_broker::evidence::{dedupe_support, Channel, EvidenceRecord, RawSupport};
use context_broker::explain::{AttentionBudget, CoherenceWeights, ExplainEngine, RowContext};
use context_broker::ledger::{sign_event, EventType};
use context_broker::policy::PolicyOutcome;
use context_broker::resolution::{Assessment, ResolutionEnforcer, MAX_EXPLORATION_SHARE};
use context_broker::{BundleId, EventId, KeyRing, Ledger, LineageEvent};
use ed25519_dalek::SigningKey;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

const DOMAINS: &[&str] = &["reuters.com", "apnews.com", "bbc.co.uk", "nature.com", "example.org"];

fn raw_support() -> impl Strategy<Value = Vec<RawSupport>> {
    prop::collection::vec(
        (0..DOMAINS.len(), 0u8..20, any::<bool>()),
        0..24,
    )
    .prop_map(|items| {
        items
            .into_iter()
            .map(|(d, s, pending)| RawSupport {
                domain: DOMAINS[d].to_string(),
                source: format!("s-{}", s),
                pending,
            })
            .collect()
    })
}

/// Deduplicated support never exceeds raw support, and equals the number of
/// distinct domains.
#[test]
fn test_dedup_bounded_by_raw_support() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&raw_support(), |raw| {
            let units = dedupe_support(&raw);
            let distinct: BTreeSet<&str> = raw.iter().map(|r| r.domain.as_str()).collect();

            prop_assert!(units.len() <= raw.len());
            prop_assert_eq!(units.len(), distinct.len());
            for unit in &units {
                let any_pending = raw.iter().any(|r| r.domain == unit.domain && r.pending);
                prop_assert_eq!(unit.pending, any_pending);
            }
            Ok(())
        })
        .unwrap();
}

/// Distinct domains are never collapsed.
#[test]
fn test_distinct_domains_count_fully() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&prop::sample::subsequence(DOMAINS.to_vec(), 0..=DOMAINS.len()), |domains| {
            let raw: Vec<RawSupport> = domains
                .iter()
                .map(|d| RawSupport {
                    domain: d.to_string(),
                    source: format!("src-{}", d),
                    pending: false,
                })
                .collect();
            prop_assert_eq!(dedupe_support(&raw).len(), raw.len());
            Ok(())
        })
        .unwrap();
}

fn assessments() -> impl Strategy<Value = Vec<(Assessment, ResolutionLimits)>> {
    prop::collection::vec(
        (0u32..5, prop::option::of(0.0f64..1.0), 0.0f64..1.0, 0u32..5),
        0..60,
    )
    .prop_map(|items| {
        items
            .into_iter()
            .enumerate()
            .map(|(i, (support, separation, confidence, min_support))| {
                (
                    Assessment {
                        id: BundleId::from(format!("b-{:03}", i).as_str()),
                        support,
                        separation,
                        confidence,
                    },
                    ResolutionLimits {
                        min_support: Some(min_support),
                        min_separation: Some(0.2),
                        ..Default::default()
                    },
                )
            })
            .collect()
    })
}

/// Every candidate lands in exactly one of resolved, exploratory, unresolved.
#[test]
fn test_partition_is_disjoint_and_complete() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&(assessments(), 0.05f64..=0.10), |(assessed, fraction)| {
            let ids: BTreeSet<BundleId> = assessed.iter().map(|(a, _)| a.id.clone()).collect();
            let partition = ResolutionEnforcer::new(fraction, 0.8).partition(assessed);

            let mut seen = BTreeSet::new();
            let placed = partition
                .resolved
                .iter()
                .chain(partition.exploratory.iter().map(|c| &c.id))
                .chain(partition.unresolved.iter().map(|c| &c.id));
            for id in placed {
                prop_assert!(seen.insert(id.clone()), "{} placed twice", id);
            }
            prop_assert_eq!(seen, ids);

            let budget = (fraction * partition.resolved.len() as f64).ceil() as usize;
            prop_assert!(partition.exploratory.len() <= budget);
            let returned = partition.resolved.len() + partition.exploratory.len();
            prop_assert!(partition.exploratory.len() as f64 <= MAX_EXPLORATION_SHARE * returned as f64 + 1e-9);
            if partition.resolved.is_empty() {
                prop_assert!(partition.exploratory.is_empty());
            }
            Ok(())
        })
        .unwrap();
}

fn evidence_record() -> impl Strategy<Value = EvidenceRecord> {
    (
        any::<bool>(),
        prop::option::of(0.0f64..1.0),
        prop::option::of(1u32..4),
        raw_support(),
    )
        .prop_map(|(symbolic_hit, vector_score, lineage_hops, raw)| {
            let mut record = EvidenceRecord::new(BundleId::from("c-1"), "claim");
            record.symbolic_hit = symbolic_hit;
            record.vector_score = vector_score;
            record.lineage_hops = lineage_hops;
            record.raw_support = raw.len();
            record.support = dedupe_support(&raw);
            record
        })
}

/// The `low` budget caps why lines at three; `high` never truncates.
#[test]
fn test_attention_budget_caps_why_lines() {
    let mut runner = proptest::test_runner::TestRunner::default();
    let engine = ExplainEngine::new(CoherenceWeights::default(), 3);
    let channels: BTreeSet<Channel> = Channel::ALL.into_iter().collect();
    let outcome = PolicyOutcome::Allowed {
        content: None,
        redacted_fields: Vec::new(),
        policy_class: Some("claim/read".to_string()),
        raw: false,
    };

    runner
        .run(&(evidence_record(), any::<bool>()), |(record, explored)| {
            let coherence = engine.coherence(&record, &channels);
            let row = RowContext {
                record: &record,
                coherence: &coherence,
                separation: record.vector_score,
                exploration: explored.then_some("support<3 (1)"),
                outcome: &outcome,
            };
            let low = engine.render(&row, AttentionBudget::Low);
            let high = engine.render(&row, AttentionBudget::High);

            prop_assert!(low.why.len() <= 3);
            prop_assert!(high.why.len() >= low.why.len());
            prop_assert_eq!(&high.why[..low.why.len()], &low.why[..]);
            Ok(())
        })
        .unwrap();
}

fn signed_events() -> Vec<LineageEvent> {
    (1..=3u8)
        .flat_map(|writer| {
            let key = SigningKey::from_bytes(&[writer; 32]);
            (1..=4u64).map(move |seq| {
                let by = format!("writer-{}", writer);
                let mut event = LineageEvent::new(
                    EventId::for_writer(&by, seq),
                    EventType::Created,
                    BundleId::from(format!("b-{}-{}", writer, seq).as_str()),
                    by,
                    Utc.timestamp_opt(1_700_000_000 + seq as i64, 0).unwrap(),
                );
                sign_event(&mut event, &key).unwrap();
                event
            })
        })
        .collect()
}

fn key_ring() -> Arc<KeyRing> {
    let keys = Arc::new(KeyRing::new());
    for writer in 1..=3u8 {
        keys.insert(
            format!("writer-{}", writer),
            SigningKey::from_bytes(&[writer; 32]).verifying_key(),
        );
    }
    keys
}

/// Merging any batches of the same events, in any order and any number of
/// times, converges on one state.
#[test]
fn test_merge_idempotent_and_commutative() {
    let mut runner = proptest::test_runner::TestRunner::default();
    let events = signed_events();
    let reference = Ledger::new(key_ring());
    reference.merge(events.clone()).unwrap();
    let digest = reference.state_digest();

    runner
        .run(
            &(
                Just(events.clone()).prop_shuffle(),
                prop::collection::vec(0..events.len(), 0..8),
            ),
            |(shuffled, repeats)| {
                let ledger = Ledger::new(key_ring());
                let (head, tail) = shuffled.split_at(shuffled.len() / 2);
                ledger.merge(tail.to_vec()).unwrap();
                ledger.merge(repeats.iter().map(|&i| events[i].clone())).unwrap();
                ledger.merge(head.to_vec()).unwrap();
                ledger.merge(shuffled.clone()).unwrap();

                prop_assert_eq!(ledger.len(), events.len());
                prop_assert_eq!(ledger.state_digest(), digest.clone());
                Ok(())
            },
        )
        .unwrap();
}
