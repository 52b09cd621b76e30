//! Source adapters.
//!
//! Each adapter turns one store's retrieval into the common
//! `{source_name, hits, latency_ms, degraded}` shape with scores already
//! mapped to [0, 1]. The vector adapter optionally routes the query
//! through the GNN enhancer behind a circuit breaker; in the Open state
//! enhancement is a no-op fallthrough.

use std::sync::Arc;

use engram_error::Result;
use engram_graph::GraphStore;
use engram_gnn::{GnnEnhancer, TrajectoryGraph};
use engram_reason::{PatternStore, ReasoningBank};
use engram_types::{DistanceMetric, Metadata, MetadataValue};
use engram_vector::{SearchOptions, VectorStore, similarity};
use tracing::debug;

use crate::breaker::CircuitBreaker;
use crate::normalize;

/// One scored hit from a source, score already in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterHit {
    pub id: String,
    pub score: f32,
    pub metadata: Metadata,
}

/// A source's typed contribution to one fused search.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterResult {
    pub source_name: &'static str,
    pub hits: Vec<AdapterHit>,
    pub latency_ms: u64,
    pub degraded: bool,
}

/// The query handed to every adapter.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub embedding: Vec<f32>,
    pub k: usize,
    pub metric: DistanceMetric,
    /// Route context for learned weights and trajectory retrieval.
    pub route: Option<String>,
    /// Optional graph context for GNN enhancement.
    pub trajectory_graph: Option<TrajectoryGraph>,
}

pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &'static str;
    fn search(&self, query: &SearchQuery) -> Result<Vec<AdapterHit>>;
}

// ── Vector ──

pub struct VectorAdapter {
    store: Arc<VectorStore>,
    enhancer: Option<Arc<GnnEnhancer>>,
    breaker: Arc<CircuitBreaker>,
}

impl VectorAdapter {
    #[must_use]
    pub fn new(
        store: Arc<VectorStore>,
        enhancer: Option<Arc<GnnEnhancer>>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            store,
            enhancer,
            breaker,
        }
    }

    /// Enhance the query behind the breaker; Open state falls through.
    fn maybe_enhance(&self, query: &SearchQuery) -> Vec<f32> {
        let Some(enhancer) = &self.enhancer else {
            return query.embedding.clone();
        };
        if !self.breaker.allow() {
            debug!(
                target: "engram.fusion::vector",
                "breaker open, skipping enhancement"
            );
            return query.embedding.clone();
        }
        match enhancer.enhance(&query.embedding, query.trajectory_graph.as_ref()) {
            Ok(outcome) if outcome.timed_out => {
                self.breaker.record_failure();
                outcome.vector
            }
            Ok(outcome) => {
                self.breaker.record_success();
                outcome.vector
            }
            Err(err) => {
                debug!(target: "engram.fusion::vector", error = %err, "enhancement failed");
                self.breaker.record_failure();
                query.embedding.clone()
            }
        }
    }
}

impl SourceAdapter for VectorAdapter {
    fn name(&self) -> &'static str {
        "vector"
    }

    fn search(&self, query: &SearchQuery) -> Result<Vec<AdapterHit>> {
        let embedding = self.maybe_enhance(query);
        let hits = self.store.search(
            &embedding,
            query.k,
            &SearchOptions {
                metric: query.metric,
                filter: None,
            },
        )?;
        Ok(hits
            .into_iter()
            .map(|hit| AdapterHit {
                id: hit.id.to_string(),
                score: normalize::unit_score(query.metric, hit.score),
                metadata: hit.metadata,
            })
            .collect())
    }
}

// ── Graph ──

pub struct GraphAdapter {
    graph: Arc<GraphStore>,
}

impl GraphAdapter {
    #[must_use]
    pub fn new(graph: Arc<GraphStore>) -> Self {
        Self { graph }
    }
}

impl SourceAdapter for GraphAdapter {
    fn name(&self) -> &'static str {
        "graph"
    }

    fn search(&self, query: &SearchQuery) -> Result<Vec<AdapterHit>> {
        let mut scored: Vec<AdapterHit> = Vec::new();
        for id in self.graph.node_ids() {
            let Ok(node) = self.graph.node(&id) else {
                continue;
            };
            if node.embedding.len() != query.embedding.len() {
                continue;
            }
            let raw = similarity(DistanceMetric::Cosine, &query.embedding, &node.embedding);
            let mut metadata = node.properties.clone();
            if !node.labels.is_empty() {
                metadata.insert(
                    "labels".into(),
                    MetadataValue::Text(
                        node.labels.iter().cloned().collect::<Vec<_>>().join(","),
                    ),
                );
            }
            scored.push(AdapterHit {
                id: id.to_string(),
                score: normalize::cosine_unit(raw),
                metadata,
            });
        }
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(query.k);
        Ok(scored)
    }
}

// ── Pattern memory ──

pub struct MemoryAdapter {
    patterns: Arc<PatternStore>,
}

impl MemoryAdapter {
    #[must_use]
    pub fn new(patterns: Arc<PatternStore>) -> Self {
        Self { patterns }
    }
}

impl SourceAdapter for MemoryAdapter {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn search(&self, query: &SearchQuery) -> Result<Vec<AdapterHit>> {
        let task_type = query.route.as_deref().unwrap_or("general");
        let patterns = self.patterns.query(task_type, &query.embedding, query.k)?;
        Ok(patterns
            .into_iter()
            .map(|pattern| {
                let mut metadata = Metadata::new();
                metadata.insert(
                    "task_type".into(),
                    MetadataValue::Text(pattern.task_type.clone()),
                );
                metadata.insert(
                    "successes".into(),
                    MetadataValue::Int(pattern.success_count as i64),
                );
                AdapterHit {
                    id: pattern.id.to_string(),
                    score: pattern.confidence.clamp(0.0, 1.0) as f32,
                    metadata,
                }
            })
            .collect())
    }
}

// ── Trajectories ──

pub struct PatternAdapter {
    bank: Arc<ReasoningBank>,
}

impl PatternAdapter {
    #[must_use]
    pub fn new(bank: Arc<ReasoningBank>) -> Self {
        Self { bank }
    }
}

impl SourceAdapter for PatternAdapter {
    fn name(&self) -> &'static str {
        "pattern"
    }

    fn search(&self, query: &SearchQuery) -> Result<Vec<AdapterHit>> {
        let route = query.route.as_deref().unwrap_or("default");
        let trajectories = self.bank.recent_trajectories(route, query.k);
        Ok(trajectories
            .into_iter()
            .map(|trajectory| {
                let mut metadata = Metadata::new();
                metadata.insert(
                    "route".into(),
                    MetadataValue::Text(trajectory.route.clone()),
                );
                if !trajectory.context_ids.is_empty() {
                    metadata.insert(
                        "contexts".into(),
                        MetadataValue::Int(trajectory.context_ids.len() as i64),
                    );
                }
                AdapterHit {
                    id: trajectory.id.to_string(),
                    // Unlabeled trajectories sit at the indifferent midpoint.
                    score: trajectory.outcome_quality.unwrap_or(0.5).clamp(0.0, 1.0) as f32,
                    metadata,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_types::{ManualClock, NORMALIZATION_TOLERANCE, SonaConfig, VectorId};

    fn unit(dim: usize, at: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[at] = 1.0;
        v
    }

    fn query(embedding: Vec<f32>, k: usize) -> SearchQuery {
        SearchQuery {
            embedding,
            k,
            metric: DistanceMetric::Cosine,
            route: Some("plan/review".to_string()),
            trajectory_graph: None,
        }
    }

    #[test]
    fn vector_adapter_normalizes_scores_into_unit_interval() {
        let store = Arc::new(VectorStore::new(8, NORMALIZATION_TOLERANCE));
        store
            .insert(VectorId::from("a"), unit(8, 0), Metadata::new())
            .unwrap();
        store
            .insert(VectorId::from("b"), unit(8, 1), Metadata::new())
            .unwrap();
        let breaker = Arc::new(CircuitBreaker::new(
            "gnn",
            3,
            30_000,
            Arc::new(ManualClock::new(0)),
        ));
        let adapter = VectorAdapter::new(store, None, breaker);
        let hits = adapter.search(&query(unit(8, 0), 2)).unwrap();
        assert_eq!(hits[0].id, "a");
        assert!((hits[0].score - 1.0).abs() < 1e-6, "cosine 1 maps to 1");
        assert!((hits[1].score - 0.5).abs() < 1e-6, "cosine 0 maps to 0.5");
    }

    #[test]
    fn memory_adapter_scores_by_confidence() {
        let patterns = Arc::new(PatternStore::new(8, NORMALIZATION_TOLERANCE));
        let id = patterns.observe("plan/review", &unit(8, 0)).unwrap();
        for _ in 0..3 {
            patterns.update(&id, true).unwrap();
        }
        let adapter = MemoryAdapter::new(patterns);
        let hits = adapter.search(&query(unit(8, 0), 5)).unwrap();
        assert_eq!(hits.len(), 1);
        // Beta(4, 1) mean = 0.8.
        assert!((hits[0].score - 0.8).abs() < 1e-6);
    }

    #[test]
    fn pattern_adapter_returns_route_trajectories() {
        let bank = Arc::new(ReasoningBank::new(SonaConfig::default()));
        let t = bank
            .create_trajectory("Plan/Review", [], vec!["ctx-1".to_string()])
            .unwrap();
        bank.provide_feedback(&t, 0.9).unwrap();
        let adapter = PatternAdapter::new(bank);
        let hits = adapter.search(&query(unit(8, 0), 5)).unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn graph_adapter_ranks_nodes_by_similarity() {
        use engram_graph::NodeLink;
        use std::collections::BTreeSet;
        let graph = Arc::new(GraphStore::new(8, NORMALIZATION_TOLERANCE));
        graph
            .create_node(
                engram_types::NodeId::from("match"),
                unit(8, 0),
                BTreeSet::new(),
                Metadata::new(),
                &NodeLink::seed(),
            )
            .unwrap();
        graph
            .create_node(
                engram_types::NodeId::from("other"),
                unit(8, 3),
                BTreeSet::new(),
                Metadata::new(),
                &NodeLink::seed(),
            )
            .unwrap();
        let adapter = GraphAdapter::new(graph);
        let hits = adapter.search(&query(unit(8, 0), 1)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "match");
    }
}
