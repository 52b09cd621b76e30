//! Fan-out, fusion, and the result envelope.
//!
//! Adapters run on their own threads with one shared deadline; a source
//! that misses it (or errors) contributes nothing, is marked degraded, and
//! the envelope reports `partial = true`. Late results are abandoned —
//! cancellation here means the fan-out stops waiting, never that durable
//! state mutates.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use engram_error::Result;
use engram_observability::{EventBus, EventStatus};
use engram_reason::ReasoningBank;
use engram_types::{DistanceMetric, Metadata, MetadataValue};
use engram_gnn::TrajectoryGraph;
use tracing::{debug, warn};

use crate::adapters::{AdapterHit, AdapterResult, SearchQuery, SourceAdapter};

const DEFAULT_ADAPTER_TIMEOUT_MS: u64 = 250;

/// Per-search knobs.
#[derive(Debug, Clone)]
pub struct FusionOptions {
    pub k: usize,
    pub metric: DistanceMetric,
    pub route: Option<String>,
    pub adapter_timeout_ms: u64,
    /// Explicit per-source weights; absent sources default to learned (or
    /// 1.0 with no reasoning bank attached).
    pub explicit_weights: Option<BTreeMap<String, f64>>,
    pub trajectory_graph: Option<TrajectoryGraph>,
}

impl Default for FusionOptions {
    fn default() -> Self {
        Self {
            k: 10,
            metric: DistanceMetric::Cosine,
            route: None,
            adapter_timeout_ms: DEFAULT_ADAPTER_TIMEOUT_MS,
            explicit_weights: None,
            trajectory_graph: None,
        }
    }
}

/// One fused result row.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedHit {
    pub id: String,
    pub score: f64,
    /// Raw per-source unit scores that contributed.
    pub per_source: BTreeMap<String, f32>,
    pub metadata: Metadata,
}

/// The complete answer to one unified search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchEnvelope {
    pub hits: Vec<FusedHit>,
    pub partial: bool,
    pub sources_degraded: Vec<String>,
    pub sources: Vec<AdapterResult>,
}

pub struct UnifiedSearch {
    adapters: Vec<Arc<dyn SourceAdapter>>,
    bank: Option<Arc<ReasoningBank>>,
    bus: Option<EventBus>,
}

impl UnifiedSearch {
    #[must_use]
    pub fn new(
        adapters: Vec<Arc<dyn SourceAdapter>>,
        bank: Option<Arc<ReasoningBank>>,
        bus: Option<EventBus>,
    ) -> Self {
        Self {
            adapters,
            bank,
            bus,
        }
    }

    /// Fan out, normalize, fuse.
    pub fn search(&self, embedding: &[f32], options: &FusionOptions) -> Result<SearchEnvelope> {
        if options.k == 0 || self.adapters.is_empty() {
            return Ok(SearchEnvelope {
                hits: Vec::new(),
                partial: false,
                sources_degraded: Vec::new(),
                sources: Vec::new(),
            });
        }

        let sources = self.fan_out(embedding, options);
        let envelope = self.fuse(sources, options);
        self.emit(&envelope, options);
        Ok(envelope)
    }

    fn fan_out(&self, embedding: &[f32], options: &FusionOptions) -> Vec<AdapterResult> {
        let (sender, receiver) = mpsc::channel::<(usize, Result<Vec<AdapterHit>>, u64)>();
        for (index, adapter) in self.adapters.iter().enumerate() {
            let adapter = Arc::clone(adapter);
            let sender = sender.clone();
            let query = SearchQuery {
                embedding: embedding.to_vec(),
                k: options.k,
                metric: options.metric,
                route: options.route.clone(),
                trajectory_graph: options.trajectory_graph.clone(),
            };
            let _ = std::thread::Builder::new()
                .name(format!("engram-fusion-{}", adapter.name()))
                .spawn(move || {
                    let started = Instant::now();
                    let outcome = adapter.search(&query);
                    let latency = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                    // The receiver may have given up already; that is fine.
                    let _ = sender.send((index, outcome, latency));
                });
        }
        drop(sender);

        let deadline = Instant::now() + Duration::from_millis(options.adapter_timeout_ms);
        let mut slots: Vec<Option<AdapterResult>> = (0..self.adapters.len()).map(|_| None).collect();
        let mut received = 0usize;
        while received < self.adapters.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match receiver.recv_timeout(remaining) {
                Ok((index, outcome, latency_ms)) => {
                    received += 1;
                    let name = self.adapters[index].name();
                    slots[index] = Some(match outcome {
                        Ok(hits) => AdapterResult {
                            source_name: name,
                            hits,
                            latency_ms,
                            degraded: false,
                        },
                        Err(err) => {
                            warn!(
                                target: "engram.fusion::search",
                                source = name,
                                error = %err,
                                "adapter failed, degrading source"
                            );
                            AdapterResult {
                                source_name: name,
                                hits: Vec::new(),
                                latency_ms,
                                degraded: true,
                            }
                        }
                    });
                }
                Err(_) => break,
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    let name = self.adapters[index].name();
                    debug!(
                        target: "engram.fusion::search",
                        source = name,
                        timeout_ms = options.adapter_timeout_ms,
                        "adapter missed the deadline"
                    );
                    AdapterResult {
                        source_name: name,
                        hits: Vec::new(),
                        latency_ms: options.adapter_timeout_ms,
                        degraded: true,
                    }
                })
            })
            .collect()
    }

    fn learned_weight(&self, route: Option<&str>, source: &str) -> f64 {
        let Some(bank) = &self.bank else {
            return 1.0;
        };
        let route = route.unwrap_or("default");
        bank.weight_of(&format!("{route}/{source}"))
    }

    fn fuse(&self, sources: Vec<AdapterResult>, options: &FusionOptions) -> SearchEnvelope {
        let union: BTreeSet<String> = sources
            .iter()
            .flat_map(|source| source.hits.iter().map(|hit| hit.id.clone()))
            .collect();

        let mut fused: BTreeMap<String, FusedHit> = union
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    FusedHit {
                        id: id.clone(),
                        score: 0.0,
                        per_source: BTreeMap::new(),
                        metadata: Metadata::new(),
                    },
                )
            })
            .collect();

        for source in &sources {
            if union.is_empty() {
                break;
            }
            let weight = options
                .explicit_weights
                .as_ref()
                .and_then(|weights| weights.get(source.source_name).copied())
                .unwrap_or_else(|| {
                    self.learned_weight(options.route.as_deref(), source.source_name)
                });

            // Per-source scores over the union; missing ids score zero.
            let by_id: BTreeMap<&str, f32> = source
                .hits
                .iter()
                .map(|hit| (hit.id.as_str(), hit.score))
                .collect();
            let values: Vec<f64> = union
                .iter()
                .map(|id| f64::from(by_id.get(id.as_str()).copied().unwrap_or(0.0)))
                .collect();
            let n = values.len() as f64;
            let mean = values.iter().sum::<f64>() / n;
            let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
            let std = variance.sqrt();

            for (id, value) in union.iter().zip(values.iter()) {
                let z = if std > 0.0 { (value - mean) / std } else { 0.0 };
                let row = fused.get_mut(id).expect("id in union");
                row.score += weight * z;
                if let Some(&raw) = by_id.get(id.as_str()) {
                    row.per_source.insert(source.source_name.to_string(), raw);
                }
            }
            for hit in &source.hits {
                let row = fused.get_mut(&hit.id).expect("id in union");
                if row.metadata.is_empty() && !hit.metadata.is_empty() {
                    row.metadata = hit.metadata.clone();
                }
            }
        }

        let mut hits: Vec<FusedHit> = fused.into_values().collect();
        // Ties break by min id; BTreeMap order makes the sort stable on it.
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(options.k);

        let sources_degraded: Vec<String> = sources
            .iter()
            .filter(|source| source.degraded)
            .map(|source| source.source_name.to_string())
            .collect();
        SearchEnvelope {
            partial: !sources_degraded.is_empty(),
            hits,
            sources_degraded,
            sources,
        }
    }

    fn emit(&self, envelope: &SearchEnvelope, options: &FusionOptions) {
        let Some(bus) = &self.bus else {
            return;
        };
        let mut metadata = Metadata::new();
        metadata.insert("hits".into(), MetadataValue::Int(envelope.hits.len() as i64));
        metadata.insert("k".into(), MetadataValue::Int(options.k as i64));
        metadata.insert(
            "degraded".into(),
            MetadataValue::Int(envelope.sources_degraded.len() as i64),
        );
        bus.emit_now(
            engram_types::epoch_ms(),
            "unified_search",
            "quad_fusion",
            if envelope.partial {
                EventStatus::Degraded
            } else {
                EventStatus::Ok
            },
            metadata,
        );
    }
}
