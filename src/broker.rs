//! Context Broker
//!
//! Per-request orchestration: `received -> aggregating -> classifying ->
//! authorizing -> explaining -> responded`, with `error` reachable from any
//! stage. A fatal fault returns one structured error and no partial rows;
//! denials and unresolved candidates are part of a successful response.

use crate::bundle::content::resolve_content;
use crate::bundle::{BundleStore, ContentSource};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::evidence::{EvidenceAggregator, GatherQuery};
use crate::explain::{ExplainEngine, ExplainEntry, ResolutionStatus, RowContext};
use crate::frame::{FrameRegistry, InMemoryFrameRegistry};
use crate::index::{GraphIndex, LedgerGraphIndex, SymbolicIndex, VectorIndex};
use crate::ledger::{KeyRing, Ledger};
use crate::policy::{effective_read_rules, PolicyMembrane, PolicyOutcome, Requester};
use crate::resolution::{separations, Assessment, ResolutionEnforcer, UnresolvedCandidate};
use crate::types::BundleId;
use crate::wire::{QueryRequest, QueryResponse, Row, Telemetry};
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    Received,
    Aggregating,
    Classifying,
    Authorizing,
    Explaining,
    Responded,
    Error,
}

impl RequestStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStage::Received => "received",
            RequestStage::Aggregating => "aggregating",
            RequestStage::Classifying => "classifying",
            RequestStage::Authorizing => "authorizing",
            RequestStage::Explaining => "explaining",
            RequestStage::Responded => "responded",
            RequestStage::Error => "error",
        }
    }
}

impl std::fmt::Display for RequestStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-side cancellation, checked at every stage boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct ContextBrokerBuilder {
    store: Arc<BundleStore>,
    ledger: Arc<Ledger>,
    registry: Arc<dyn FrameRegistry>,
    symbolic: Option<Arc<dyn SymbolicIndex>>,
    vector: Option<Arc<dyn VectorIndex>>,
    graph: Option<Arc<dyn GraphIndex>>,
    content_source: Option<Arc<dyn ContentSource>>,
    config: BrokerConfig,
}

impl ContextBrokerBuilder {
    pub fn symbolic(mut self, index: Arc<dyn SymbolicIndex>) -> Self {
        self.symbolic = Some(index);
        self
    }

    pub fn vector(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.vector = Some(index);
        self
    }

    pub fn graph(mut self, index: Arc<dyn GraphIndex>) -> Self {
        self.graph = Some(index);
        self
    }

    /// Serve the graph channel from the ledger and bundle store.
    pub fn ledger_graph(self) -> Self {
        let index = LedgerGraphIndex::new(Arc::clone(&self.ledger), Arc::clone(&self.store));
        self.graph(Arc::new(index))
    }

    pub fn content_source(mut self, source: Arc<dyn ContentSource>) -> Self {
        self.content_source = Some(source);
        self
    }

    pub fn config(mut self, config: BrokerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> ContextBroker {
        let settings = &self.config.broker;
        let mut aggregator = EvidenceAggregator::new(settings.aggregator_settings());
        if let Some(index) = self.symbolic {
            aggregator = aggregator.with_symbolic(index);
        }
        if let Some(index) = self.vector {
            aggregator = aggregator.with_vector(index);
        }
        if let Some(index) = self.graph {
            aggregator = aggregator.with_graph(index);
        }
        ContextBroker {
            store: self.store,
            ledger: self.ledger,
            registry: self.registry,
            content_source: self.content_source,
            aggregator,
            enforcer: ResolutionEnforcer::new(
                settings.exploration_fraction,
                settings.pending_discount,
            ),
            membrane: PolicyMembrane::new(settings.admin_capability.clone()),
            explainer: ExplainEngine::new(self.config.coherence.weights(), settings.lineage_depth),
            strict_integrity: settings.strict_integrity,
        }
    }
}

/// Scores computed during classification, reused when explaining.
struct Scored {
    coherence: crate::explain::Coherence,
    confidence: f64,
    separation: Option<f64>,
}

enum Placement {
    Resolved,
    Exploratory(String),
    Unresolved(UnresolvedCandidate),
}

pub struct ContextBroker {
    store: Arc<BundleStore>,
    ledger: Arc<Ledger>,
    registry: Arc<dyn FrameRegistry>,
    content_source: Option<Arc<dyn ContentSource>>,
    aggregator: EvidenceAggregator,
    enforcer: ResolutionEnforcer,
    membrane: PolicyMembrane,
    explainer: ExplainEngine,
    strict_integrity: bool,
}

impl ContextBroker {
    pub fn builder(
        store: Arc<BundleStore>,
        ledger: Arc<Ledger>,
        registry: Arc<dyn FrameRegistry>,
    ) -> ContextBrokerBuilder {
        ContextBrokerBuilder {
            store,
            ledger,
            registry,
            symbolic: None,
            vector: None,
            graph: None,
            content_source: None,
            config: BrokerConfig::default(),
        }
    }

    /// Open persistent state under `root` as laid out by `config`: the sled
    /// bundle store, the NDJSON ledger, and the frames directory (when present).
    /// The graph channel is served from the ledger.
    pub fn open(
        root: &Path,
        config: BrokerConfig,
        keys: Arc<KeyRing>,
    ) -> Result<ContextBrokerBuilder, BrokerError> {
        let store = Arc::new(BundleStore::open(root.join(&config.storage.bundle_store_path))?);
        let ledger_path = root.join(&config.ledger.path);
        if let Some(parent) = ledger_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                BrokerError::Init(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        let ledger = Arc::new(Ledger::open(&ledger_path, keys)?);
        for bundle in store.snapshot().iter() {
            ledger.register_object(bundle.id.clone());
        }
        let frames_dir = root.join(&config.storage.frames_dir);
        let registry = if frames_dir.is_dir() {
            InMemoryFrameRegistry::load_dir(&frames_dir)?
        } else {
            debug!(dir = %frames_dir.display(), "No frames directory; starting with an empty registry");
            InMemoryFrameRegistry::new()
        };
        info!(root = %root.display(), bundles = store.len(), events = ledger.len(), "Opened broker state");
        Ok(ContextBroker::builder(store, ledger, Arc::new(registry))
            .config(config)
            .ledger_graph())
    }

    pub fn store(&self) -> &Arc<BundleStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Answer one request.
    pub async fn query(
        &self,
        request: QueryRequest,
        requester: &Requester,
        cancel: &CancelHandle,
    ) -> Result<QueryResponse, BrokerError> {
        let request_id = Uuid::now_v7().to_string();
        debug!(request_id = %request_id, stage = %RequestStage::Received, requester = %requester.id, "Request stage");
        match self.run(&request_id, request, requester, cancel).await {
            Ok(response) => {
                info!(
                    request_id = %request_id,
                    stage = %RequestStage::Responded,
                    rows = response.rows.len(),
                    unresolved = response.telemetry.unresolved_clusters.len(),
                    denied = response.telemetry.denied,
                    attention_used_ms = response.telemetry.attention_used_ms,
                    "Request answered"
                );
                Ok(response)
            }
            Err(e) => {
                warn!(request_id = %request_id, stage = %RequestStage::Error, error = %e, "Request failed");
                Err(e)
            }
        }
    }

    /// JSON in, JSON out. A malformed body is `InvalidRequest`.
    pub async fn handle_json(
        &self,
        body: &str,
        requester: &Requester,
        cancel: &CancelHandle,
    ) -> Result<String, BrokerError> {
        let request: QueryRequest = serde_json::from_str(body)
            .map_err(|e| BrokerError::InvalidRequest(e.to_string()))?;
        let response = self.query(request, requester, cancel).await?;
        serde_json::to_string(&response)
            .map_err(|e| BrokerError::fault(RequestStage::Responded.as_str(), e.to_string()))
    }

    fn enter(
        &self,
        request_id: &str,
        stage: RequestStage,
        cancel: &CancelHandle,
    ) -> Result<(), BrokerError> {
        if cancel.is_cancelled() {
            info!(request_id = %request_id, stage = %stage, "Request cancelled");
            return Err(BrokerError::Cancelled(request_id.to_string()));
        }
        debug!(request_id = %request_id, stage = %stage, "Request stage");
        Ok(())
    }

    fn check_request(request: &QueryRequest) -> Result<(), BrokerError> {
        let limits = &request.resolution;
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if limits.min_separation.map_or(false, |v| !in_unit(v)) {
            return Err(BrokerError::InvalidRequest(
                "resolution.min_separation must be within [0, 1]".to_string(),
            ));
        }
        if limits.confidence.map_or(false, |c| !in_unit(c.value())) {
            return Err(BrokerError::InvalidRequest(
                "resolution.confidence must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }

    async fn run(
        &self,
        request_id: &str,
        request: QueryRequest,
        requester: &Requester,
        cancel: &CancelHandle,
    ) -> Result<QueryResponse, BrokerError> {
        let started = Instant::now();
        Self::check_request(&request)?;
        let channels = request.channels();

        // Both snapshots stay fixed for the lifetime of the request.
        self.enter(request_id, RequestStage::Aggregating, cancel)?;
        let arena = self.store.snapshot();
        let ledger = self.ledger.snapshot();
        let query = GatherQuery {
            intent: &request.intent,
            frame_scope: &request.frame,
            filters: &request.filters,
            channels: &channels,
        };
        let mut gathered = self.aggregator.gather(&query, &arena, &ledger).await?;

        let mut contents: BTreeMap<BundleId, Value> = BTreeMap::new();
        let mut integrity_failures = 0;
        for id in gathered.candidates.keys().cloned().collect::<Vec<_>>() {
            let Some(bundle) = arena.get(&id) else {
                continue;
            };
            match resolve_content(&bundle, self.content_source.as_deref()) {
                Ok(value) => {
                    contents.insert(id, value);
                }
                Err(e) if self.strict_integrity => {
                    return Err(BrokerError::fault(RequestStage::Aggregating.as_str(), e.to_string()));
                }
                Err(e) => {
                    warn!(request_id = %request_id, bundle_id = %id, error = %e, "Excluded candidate failing integrity check");
                    gathered.candidates.remove(&id);
                    integrity_failures += 1;
                }
            }
        }

        self.enter(request_id, RequestStage::Classifying, cancel)?;
        let separation = separations(&gathered.candidates);
        let mut scored: BTreeMap<BundleId, Scored> = BTreeMap::new();
        let mut assessed = Vec::with_capacity(gathered.candidates.len());
        for (id, record) in &gathered.candidates {
            let coherence = self.explainer.coherence(record, &channels);
            let confidence = self.enforcer.confidence(coherence.score, record.has_pending());
            let declared = arena.get(id).map(|b| b.resolution).unwrap_or_default();
            let limits = request.resolution.or(declared);
            assessed.push((
                Assessment {
                    id: id.clone(),
                    support: record.support_count(),
                    separation: separation.get(id).copied(),
                    confidence,
                },
                limits,
            ));
            scored.insert(
                id.clone(),
                Scored {
                    coherence,
                    confidence,
                    separation: separation.get(id).copied(),
                },
            );
        }
        let partition = self.enforcer.partition(assessed);
        debug!(
            request_id = %request_id,
            resolved = partition.resolved.len(),
            exploratory = partition.exploratory.len(),
            unresolved = partition.unresolved.len(),
            "Classified candidates"
        );

        self.enter(request_id, RequestStage::Authorizing, cancel)?;
        let view = self.membrane.resolve_view(requester, request.policy_view);
        let now = Utc::now();
        let placements = partition
            .resolved
            .into_iter()
            .map(|id| (id, Placement::Resolved))
            .chain(
                partition
                    .exploratory
                    .into_iter()
                    .map(|c| (c.id.clone(), Placement::Exploratory(c.reason))),
            )
            .chain(
                partition
                    .unresolved
                    .into_iter()
                    .map(|c| (c.id.clone(), Placement::Unresolved(c))),
            );
        let mut authorized: Vec<(BundleId, Placement, PolicyOutcome)> = Vec::new();
        for (id, placement) in placements {
            let Some(bundle) = arena.get(&id) else {
                continue;
            };
            let frame = self
                .registry
                .get_frame(&bundle.frame.name, bundle.frame.version)
                .ok();
            let rules = effective_read_rules(&bundle, frame.as_deref(), self.registry.as_ref());
            let outcome = self.membrane.authorize(
                &bundle,
                contents.remove(&id),
                &rules,
                requester,
                view.view,
                now,
            );
            authorized.push((id, placement, outcome));
        }

        self.enter(request_id, RequestStage::Explaining, cancel)?;
        let total = authorized.len();
        let redacted = authorized.iter().filter(|(_, _, o)| o.is_redacted()).count();
        let mut met: Vec<(Row, ExplainEntry)> = Vec::new();
        let mut explored: Vec<(Row, ExplainEntry)> = Vec::new();
        let mut denials: Vec<ExplainEntry> = Vec::new();
        let mut unresolved_clusters: Vec<UnresolvedCandidate> = Vec::new();
        for (id, placement, outcome) in authorized {
            if outcome.is_denied() {
                denials.push(self.explainer.render_denial(&id, &outcome));
                continue;
            }
            let exploration = match placement {
                Placement::Unresolved(candidate) => {
                    unresolved_clusters.push(candidate);
                    continue;
                }
                Placement::Resolved => None,
                Placement::Exploratory(reason) => Some(reason),
            };
            let (Some(record), Some(score)) = (gathered.candidates.get(&id), scored.get(&id)) else {
                continue;
            };
            let entry = self.explainer.render(
                &RowContext {
                    record,
                    coherence: &score.coherence,
                    separation: score.separation,
                    exploration: exploration.as_deref(),
                    outcome: &outcome,
                },
                request.attention_budget,
            );
            let PolicyOutcome::Allowed {
                content,
                redacted_fields,
                ..
            } = outcome
            else {
                continue;
            };
            let row = Row {
                id: id.clone(),
                frame: record.frame.clone(),
                resolution_status: if exploration.is_some() {
                    ResolutionStatus::Exploratory
                } else {
                    ResolutionStatus::Met
                },
                coherence: score.coherence.score,
                confidence: score.confidence,
                content,
                redacted_fields,
                origin_domain: record.origin_domain.clone(),
            };
            if exploration.is_some() {
                explored.push((row, entry));
            } else {
                met.push((row, entry));
            }
        }

        met.sort_by(|(a, _), (b, _)| {
            b.coherence
                .total_cmp(&a.coherence)
                .then_with(|| a.id.cmp(&b.id))
        });
        denials.sort_by(|a, b| a.id.cmp(&b.id));
        unresolved_clusters.sort_by(|a, b| a.id.cmp(&b.id));

        let mut rows = Vec::with_capacity(met.len() + explored.len());
        let mut explain = Vec::with_capacity(met.len() + explored.len() + denials.len());
        for (row, entry) in met.into_iter().chain(explored) {
            rows.push(row);
            explain.push(entry);
        }
        let denied = denials.len();
        explain.extend(denials);

        let coherence_score = if rows.is_empty() {
            0.0
        } else {
            rows.iter().map(|r| r.coherence).sum::<f64>() / rows.len() as f64
        };
        let pending_evidence = rows
            .iter()
            .filter(|r| gathered.candidates.get(&r.id).map_or(false, |c| c.has_pending()))
            .count();
        let telemetry = Telemetry {
            coherence_score,
            unresolved_clusters,
            redaction_rate: if total == 0 {
                0.0
            } else {
                (redacted + denied) as f64 / total as f64
            },
            attention_used_ms: started.elapsed().as_millis() as u64,
            denied,
            view_downgraded: view.downgraded,
            timed_out_channels: gathered.timed_out,
            exploratory: rows
                .iter()
                .filter(|r| r.resolution_status == ResolutionStatus::Exploratory)
                .count(),
            pending_evidence,
            integrity_failures,
        };

        Ok(QueryResponse {
            request_id: request_id.to_string(),
            rows,
            explain,
            telemetry,
        })
    }
}
