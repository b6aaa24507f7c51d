//! Channel fan-out and candidate assembly.

use crate::bundle::BundleArena;
use crate::error::{BrokerError, IndexError};
use crate::evidence::support::{collect_support, dedupe_support};
use crate::evidence::{Channel, EvidenceRecord};
use crate::index::{Filters, GraphIndex, SymbolicIndex, VectorIndex};
use crate::ledger::LedgerSnapshot;
use crate::types::BundleId;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const STAGE: &str = "aggregating";

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorSettings {
    pub channel_timeout: Duration,
    pub vector_k: usize,
    pub lineage_depth: u32,
    pub lineage_relation: String,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        AggregatorSettings {
            channel_timeout: Duration::from_millis(2000),
            vector_k: 32,
            lineage_depth: 3,
            lineage_relation: "derivedFrom".to_string(),
        }
    }
}

/// Query inputs the aggregator needs.
#[derive(Debug, Clone, Copy)]
pub struct GatherQuery<'a> {
    /// Used as the vector channel's embedding handle.
    pub intent: &'a str,
    pub frame_scope: &'a BTreeSet<String>,
    pub filters: &'a Filters,
    pub channels: &'a BTreeSet<Channel>,
}

#[derive(Debug, Clone, Default)]
pub struct Gathered {
    pub candidates: BTreeMap<BundleId, EvidenceRecord>,
    /// Channels that contributed absence because they timed out.
    pub timed_out: Vec<Channel>,
    /// Hits dropped as unknown or out of scope.
    pub dropped: usize,
}

enum ChannelOutcome<T> {
    Skipped,
    TimedOut,
    Hits(T),
}

impl<T> ChannelOutcome<T> {
    fn hits(self) -> Option<T> {
        match self {
            ChannelOutcome::Hits(hits) => Some(hits),
            _ => None,
        }
    }
}

pub struct EvidenceAggregator {
    symbolic: Option<Arc<dyn SymbolicIndex>>,
    vector: Option<Arc<dyn VectorIndex>>,
    graph: Option<Arc<dyn GraphIndex>>,
    settings: AggregatorSettings,
}

impl EvidenceAggregator {
    pub fn new(settings: AggregatorSettings) -> Self {
        EvidenceAggregator {
            symbolic: None,
            vector: None,
            graph: None,
            settings,
        }
    }

    pub fn with_symbolic(mut self, index: Arc<dyn SymbolicIndex>) -> Self {
        self.symbolic = Some(index);
        self
    }

    pub fn with_vector(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.vector = Some(index);
        self
    }

    pub fn with_graph(mut self, index: Arc<dyn GraphIndex>) -> Self {
        self.graph = Some(index);
        self
    }

    pub fn settings(&self) -> &AggregatorSettings {
        &self.settings
    }

    async fn timed<T, F>(&self, channel: Channel, query: F) -> Result<ChannelOutcome<T>, BrokerError>
    where
        F: Future<Output = Result<T, IndexError>>,
    {
        match tokio::time::timeout(self.settings.channel_timeout, query).await {
            Ok(Ok(hits)) => Ok(ChannelOutcome::Hits(hits)),
            Ok(Err(e)) => Err(BrokerError::fault(
                STAGE,
                format!("{} index failed: {}", channel, e),
            )),
            Err(_) => {
                warn!(
                    channel = %channel,
                    timeout_ms = self.settings.channel_timeout.as_millis() as u64,
                    "Evidence channel timed out"
                );
                Ok(ChannelOutcome::TimedOut)
            }
        }
    }

    fn missing_index(channel: Channel) -> BrokerError {
        BrokerError::fault(STAGE, format!("no {} index configured", channel))
    }

    /// Gather candidates for one request.
    ///
    /// Symbolic and vector run concurrently; lineage runs after them, seeded
    /// with their in-scope hits (or with every in-scope bundle when neither ran).
    /// A ledger-served graph walks the same snapshots used for support.
    pub async fn gather(
        &self,
        query: &GatherQuery<'_>,
        arena: &Arc<BundleArena>,
        ledger: &Arc<LedgerSnapshot>,
    ) -> Result<Gathered, BrokerError> {
        let wants = |c: Channel| query.channels.contains(&c);

        let symbolic = async {
            if !wants(Channel::Symbolic) {
                return Ok::<_, BrokerError>(ChannelOutcome::Skipped);
            }
            let index = self
                .symbolic
                .as_ref()
                .ok_or_else(|| Self::missing_index(Channel::Symbolic))?;
            self.timed(Channel::Symbolic, index.query(query.filters, query.frame_scope))
                .await
        };
        let vector = async {
            if !wants(Channel::Vector) {
                return Ok::<_, BrokerError>(ChannelOutcome::Skipped);
            }
            let index = self
                .vector
                .as_ref()
                .ok_or_else(|| Self::missing_index(Channel::Vector))?;
            self.timed(
                Channel::Vector,
                index.nearest(query.intent, self.settings.vector_k),
            )
            .await
        };
        let (symbolic, vector) = futures::join!(symbolic, vector);
        let (symbolic, vector) = (symbolic?, vector?);

        let mut gathered = Gathered::default();
        if matches!(symbolic, ChannelOutcome::TimedOut) {
            gathered.timed_out.push(Channel::Symbolic);
        }
        if matches!(vector, ChannelOutcome::TimedOut) {
            gathered.timed_out.push(Channel::Vector);
        }

        let in_scope = |id: &BundleId| {
            arena
                .get(id)
                .filter(|b| query.frame_scope.is_empty() || query.frame_scope.contains(&b.frame.name))
        };
        let admit = |gathered: &mut Gathered, id: &BundleId| -> bool {
            if gathered.candidates.contains_key(id) {
                return true;
            }
            match in_scope(id) {
                Some(bundle) => {
                    let mut record = EvidenceRecord::new(id.clone(), bundle.frame.name.clone());
                    record.origin_domain = bundle.origin_domain();
                    gathered.candidates.insert(id.clone(), record);
                    true
                }
                None => {
                    debug!(bundle_id = %id, "Dropped unknown or out-of-scope hit");
                    gathered.dropped += 1;
                    false
                }
            }
        };

        let symbolic_ran = !matches!(symbolic, ChannelOutcome::Skipped);
        let vector_ran = !matches!(vector, ChannelOutcome::Skipped);
        for id in symbolic.hits().unwrap_or_default() {
            if admit(&mut gathered, &id) {
                if let Some(record) = gathered.candidates.get_mut(&id) {
                    record.symbolic_hit = true;
                }
            }
        }
        for (id, score) in vector.hits().unwrap_or_default() {
            if admit(&mut gathered, &id) {
                if let Some(record) = gathered.candidates.get_mut(&id) {
                    let score = score.clamp(0.0, 1.0);
                    record.vector_score = Some(record.vector_score.map_or(score, |s| s.max(score)));
                }
            }
        }

        if wants(Channel::Lineage) {
            let graph = self
                .graph
                .as_ref()
                .ok_or_else(|| Self::missing_index(Channel::Lineage))?;
            let graph = graph.pinned(ledger, arena).unwrap_or_else(|| Arc::clone(graph));
            let seeds: BTreeSet<BundleId> = if symbolic_ran || vector_ran {
                gathered.candidates.keys().cloned().collect()
            } else {
                arena.ids_in_scope(query.frame_scope).into_iter().collect()
            };
            let expansion = self.expand_lineage(&*graph, &seeds);
            match self.timed(Channel::Lineage, expansion).await? {
                ChannelOutcome::Hits(hops) => {
                    for (id, hop) in hops {
                        if admit(&mut gathered, &id) {
                            if let Some(record) = gathered.candidates.get_mut(&id) {
                                record.lineage_hops = Some(hop);
                            }
                        }
                    }
                }
                ChannelOutcome::TimedOut => gathered.timed_out.push(Channel::Lineage),
                ChannelOutcome::Skipped => {}
            }
        }

        for record in gathered.candidates.values_mut() {
            let raw = collect_support(&record.bundle_id, ledger, arena);
            record.raw_support = raw.len();
            record.support = dedupe_support(&raw);
        }
        debug!(
            candidates = gathered.candidates.len(),
            dropped = gathered.dropped,
            timed_out = gathered.timed_out.len(),
            "Gathered evidence"
        );
        Ok(gathered)
    }

    /// Minimum hop count from each reached node to the nearest seed other
    /// than itself. Walks one hop per `neighbors` call, up to `lineage_depth`.
    async fn expand_lineage(
        &self,
        graph: &dyn GraphIndex,
        seeds: &BTreeSet<BundleId>,
    ) -> Result<BTreeMap<BundleId, u32>, IndexError> {
        let relation = self.settings.lineage_relation.as_str();
        let mut adjacency: HashMap<BundleId, BTreeSet<BundleId>> = HashMap::new();
        let mut hops: BTreeMap<BundleId, u32> = BTreeMap::new();

        for seed in seeds {
            let mut seen: BTreeSet<BundleId> = BTreeSet::from([seed.clone()]);
            let mut frontier = vec![seed.clone()];
            for depth in 1..=self.settings.lineage_depth {
                let mut next = Vec::new();
                for node in &frontier {
                    if !adjacency.contains_key(node) {
                        let neighbors = graph.neighbors(node, relation, 1).await?;
                        adjacency.insert(node.clone(), neighbors);
                    }
                    let Some(neighbors) = adjacency.get(node) else {
                        continue;
                    };
                    for neighbor in neighbors {
                        if seen.insert(neighbor.clone()) {
                            next.push(neighbor.clone());
                            let best = hops.entry(neighbor.clone()).or_insert(depth);
                            *best = (*best).min(depth);
                        }
                    }
                }
                if next.is_empty() {
                    break;
                }
                frontier = next;
            }
        }
        Ok(hops)
    }
}
