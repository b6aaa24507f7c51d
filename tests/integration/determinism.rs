//! Same state, same request, same explain bytes.

use crate::integration::test_utils::{claim, explain_bytes, frames, key_ring, signing_key, World, WRITER};
use chrono::{TimeZone, Utc};
use context_broker::bundle::ResolutionLimits;
use context_broker::config::BrokerConfig;
use context_broker::evidence::Channel;
use context_broker::ledger::{sign_event, EventType};
use context_broker::{BundleId, CancelHandle, ContextBroker, EventId, LineageEvent, QueryRequest, Requester};
use serde_json::json;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn populated_world() -> World {
    let world = World::new();
    for (i, domain) in ["reuters.com", "apnews.com", "bbc.co.uk", "nature.com"]
        .iter()
        .enumerate()
    {
        let id = world.ingest(claim(&format!("c-{}", i), "Arctic ice"));
        world.vector.insert_bundle(id.clone(), vec![1.0, i as f32 * 0.3]);
        for j in 0..=i {
            world.attest(&id, &format!("s-{}-{}", i, j), domain);
        }
    }
    world.vector.insert_handle("arctic", vec![1.0, 0.0]);
    world
}

fn request() -> QueryRequest {
    QueryRequest::new("arctic")
        .with_frame("claim")
        .with_filter("content.topic", json!("climate"))
        .with_resolution(ResolutionLimits {
            min_support: Some(1),
            ..Default::default()
        })
}

#[tokio::test]
async fn test_repeated_requests_produce_identical_explain() {
    let world = populated_world();
    let broker = world.broker();
    let requester = Requester::new("alice");

    let first = broker
        .query(request(), &requester, &CancelHandle::new())
        .await
        .unwrap();
    assert!(!first.rows.is_empty());
    for _ in 0..5 {
        let again = broker
            .query(request(), &requester, &CancelHandle::new())
            .await
            .unwrap();
        assert_eq!(explain_bytes(&again), explain_bytes(&first));
        assert_ne!(again.request_id, first.request_id);
    }
}

#[tokio::test]
async fn test_separate_brokers_over_same_state_agree() {
    let world = populated_world();
    let requester = Requester::new("alice");
    let a = world
        .broker()
        .query(request(), &requester, &CancelHandle::new())
        .await
        .unwrap();
    let b = world
        .broker()
        .query(request(), &requester, &CancelHandle::new())
        .await
        .unwrap();
    assert_eq!(explain_bytes(&a), explain_bytes(&b));
    assert_eq!(a.rows, b.rows);
}

fn write_frames(root: &Path) {
    let dir = root.join("frames");
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("claims.toml"),
        r#"
            [[frames]]
            name = "claim"
            version = 1
            required = ["content.title"]

            [[frames]]
            name = "source"
            version = 1
        "#,
    )
    .unwrap();
}

fn derived(seq: u64, object: &BundleId, parent: &BundleId) -> LineageEvent {
    let mut event = LineageEvent::new(
        EventId::for_writer(WRITER, seq),
        EventType::DerivedFrom,
        object.clone(),
        WRITER,
        Utc.timestamp_opt(1_700_000_000 + seq as i64, 0).unwrap(),
    )
    .with_refs(vec![parent.clone()]);
    sign_event(&mut event, &signing_key(1)).unwrap();
    event
}

fn lineage_request() -> QueryRequest {
    QueryRequest::new("lineage")
        .with_frame("claim")
        .with_evidence(&[Channel::Lineage])
}

#[tokio::test]
async fn test_restart_preserves_explain_bytes() {
    let temp_dir = TempDir::new().unwrap();
    write_frames(temp_dir.path());
    let requester = Requester::new("alice");

    let before = {
        let broker = ContextBroker::open(temp_dir.path(), BrokerConfig::default(), key_ring())
            .unwrap()
            .build();
        let registry = frames();
        let mut ids = Vec::new();
        for i in 0..4 {
            let id = broker
                .store()
                .ingest(claim(&format!("c-{}", i), "chain"), &registry)
                .unwrap();
            broker.ledger().register_object(id.clone());
            ids.push(id);
        }
        broker.ledger().append(derived(1, &ids[1], &ids[0])).unwrap();
        broker.ledger().append(derived(2, &ids[2], &ids[1])).unwrap();
        broker.store().flush().unwrap();

        let response = broker
            .query(lineage_request(), &requester, &CancelHandle::new())
            .await
            .unwrap();
        assert_eq!(response.rows.len(), 4);
        explain_bytes(&response)
    };

    let broker = ContextBroker::open(temp_dir.path(), BrokerConfig::default(), key_ring())
        .unwrap()
        .build();
    assert_eq!(broker.store().len(), 4);
    assert_eq!(broker.ledger().len(), 2);
    let after = broker
        .query(lineage_request(), &requester, &CancelHandle::new())
        .await
        .unwrap();
    assert_eq!(explain_bytes(&after), before);
}
