//! Shared test utilities for integration tests
//!
//! `World` wires a bundle store, a signed ledger, a frame registry, and the
//! in-memory indexes together the way an embedding application would.

use chrono::{TimeZone, Utc};
use context_broker::bundle::{ContextBundle, Origin};
use context_broker::config::BrokerConfig;
use context_broker::frame::{FrameDef, FrameRegistry, InMemoryFrameRegistry};
use context_broker::index::{InMemorySymbolicIndex, InMemoryVectorIndex, SymbolicIndex, VectorIndex};
use context_broker::ledger::{sign_event, EventIdGenerator, EventType};
use context_broker::{BundleId, BundleStore, ContextBroker, EventId, KeyRing, Ledger, LineageEvent};
use ed25519_dalek::SigningKey;
use serde_json::json;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Global mutex to serialize environment variable access across all tests
static ENV_MUTEX: Mutex<()> = Mutex::new(());

pub const WRITER: &str = "writer-1";

/// Deterministic signing key for writer `n`.
pub fn signing_key(n: u8) -> SigningKey {
    SigningKey::from_bytes(&[n; 32])
}

/// Key ring trusting writers 1..=3 as `writer-<n>`.
pub fn key_ring() -> Arc<KeyRing> {
    let keys = Arc::new(KeyRing::new());
    for n in 1..=3u8 {
        keys.insert(format!("writer-{}", n), signing_key(n).verifying_key());
    }
    keys
}

pub fn claim(id: &str, title: &str) -> ContextBundle {
    ContextBundle::inline("claim", json!({ "title": title, "topic": "climate" }))
        .with_id(id)
        .with_origin(Origin::from_uri(format!("https://www.{}.example/{}", id, id)))
}

pub fn source(id: &str, domain: &str) -> ContextBundle {
    ContextBundle::inline("source", json!({ "url": format!("https://{}/{}", domain, id) }))
        .with_id(id)
        .with_origin(Origin::from_domain(domain))
}

pub fn frames() -> InMemoryFrameRegistry {
    let registry = InMemoryFrameRegistry::new();
    registry
        .register_frame(FrameDef::new("claim", 1).require("content.title"))
        .unwrap();
    registry.register_frame(FrameDef::new("source", 1)).unwrap();
    registry
}

pub struct World {
    pub keys: Arc<KeyRing>,
    pub ledger: Arc<Ledger>,
    pub store: Arc<BundleStore>,
    pub registry: Arc<InMemoryFrameRegistry>,
    pub symbolic: Arc<InMemorySymbolicIndex>,
    pub vector: Arc<InMemoryVectorIndex>,
    signer: SigningKey,
    ids: EventIdGenerator,
    clock: AtomicI64,
}

impl World {
    pub fn new() -> Self {
        let keys = key_ring();
        World {
            ledger: Arc::new(Ledger::new(Arc::clone(&keys))),
            keys,
            store: Arc::new(BundleStore::in_memory()),
            registry: Arc::new(frames()),
            symbolic: Arc::new(InMemorySymbolicIndex::new()),
            vector: Arc::new(InMemoryVectorIndex::new()),
            signer: signing_key(1),
            ids: EventIdGenerator::new(WRITER),
            clock: AtomicI64::new(1_700_000_000),
        }
    }

    /// A signed event with a fixed, strictly increasing timestamp.
    pub fn event(&self, kind: EventType, object: &BundleId, refs: &[&BundleId]) -> LineageEvent {
        let at = Utc
            .timestamp_opt(self.clock.fetch_add(1, Ordering::SeqCst), 0)
            .unwrap();
        let mut event = LineageEvent::new(self.ids.next_id(), kind, object.clone(), WRITER, at)
            .with_refs(refs.iter().map(|r| (*r).clone()).collect());
        sign_event(&mut event, &self.signer).unwrap();
        event
    }

    pub fn record(&self, kind: EventType, object: &BundleId, refs: &[&BundleId]) -> EventId {
        self.ledger.append(self.event(kind, object, refs)).unwrap()
    }

    /// Ingest, index, and record a `created` event.
    pub fn ingest(&self, bundle: ContextBundle) -> BundleId {
        let id = self.store.ingest(bundle, self.registry.as_ref()).unwrap();
        self.symbolic.insert(&self.store.get(&id).unwrap());
        self.ledger.register_object(id.clone());
        self.record(EventType::Created, &id, &[]);
        id
    }

    /// Ingest a source bundle from `domain` and record that it attests `claim`.
    pub fn attest(&self, claim: &BundleId, source_id: &str, domain: &str) -> BundleId {
        let source = self.ingest(source(source_id, domain));
        self.record(EventType::AttestedBy, claim, &[&source]);
        source
    }

    pub fn broker(&self) -> ContextBroker {
        self.broker_with(BrokerConfig::default())
    }

    pub fn broker_with(&self, config: BrokerConfig) -> ContextBroker {
        ContextBroker::builder(
            Arc::clone(&self.store),
            Arc::clone(&self.ledger),
            Arc::clone(&self.registry) as Arc<dyn FrameRegistry>,
        )
        .symbolic(Arc::clone(&self.symbolic) as Arc<dyn SymbolicIndex>)
        .vector(Arc::clone(&self.vector) as Arc<dyn VectorIndex>)
        .ledger_graph()
        .config(config)
        .build()
    }
}

/// Explain block serialized for byte comparison.
pub fn explain_bytes(response: &context_broker::QueryResponse) -> Vec<u8> {
    serde_json::to_vec(&response.explain).unwrap()
}

/// Run `f` with XDG_CONFIG_HOME and HOME pointed into `test_dir`,
/// restoring the original environment afterwards.
pub fn with_xdg_env<F, R>(test_dir: &TempDir, f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    let saved: Vec<(&str, Option<String>)> = ["HOME", "XDG_CONFIG_HOME", "CONTEXT_BROKER_ENV"]
        .into_iter()
        .map(|key| (key, std::env::var(key).ok()))
        .collect();

    let test_home = test_dir.path().join("home");
    std::fs::create_dir_all(&test_home).unwrap();
    std::env::set_var("HOME", &test_home);
    std::env::set_var("XDG_CONFIG_HOME", test_dir.path().join("xdg"));
    std::env::remove_var("CONTEXT_BROKER_ENV");

    let result = f();

    for (key, value) in saved {
        match value {
            Some(v) => std::env::set_var(key, v),
            None => std::env::remove_var(key),
        }
    }
    result
}
