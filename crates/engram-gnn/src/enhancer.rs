//! The three-layer enhancement pipeline.
//!
//! `D → hidden₁ (ReLU) → hidden₂ (ReLU) → D (identity)`, residual add
//! wherever a layer's shapes match, final residual with the original
//! embedding, L2-renormalized output. Weights load from disk when
//! `auto_load` is set; checksum or shape mismatches warn loudly and fall
//! back to fresh Xavier initialization. Exceeding the enhancement budget
//! returns the raw embedding (graceful fallback) — the circuit breaker in
//! the search layer counts those.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use engram_error::{EngramError, Result};
use engram_types::{Clock, GnnConfig, VectorId};
use parking_lot::RwLock;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, warn};

use crate::aggregate::{TrajectoryGraph, aggregate};
use crate::cache::EnhancementCache;
use crate::layer::{Activation, DenseLayer, LayerActivation, clip_gradients};
use crate::weights;

/// Result of one enhancement request.
#[derive(Debug, Clone, PartialEq)]
pub struct EnhanceOutcome {
    pub vector: Vec<f32>,
    /// False when the pipeline fell back to the raw embedding.
    pub enhanced: bool,
    pub timed_out: bool,
    pub cache_hit: bool,
    pub elapsed_ms: u64,
}

pub struct GnnEnhancer {
    dim: usize,
    config: GnnConfig,
    layers: RwLock<Vec<DenseLayer>>,
    cache: EnhancementCache,
    weights_dir: Option<PathBuf>,
}

impl GnnEnhancer {
    #[must_use]
    pub fn new(
        dim: usize,
        config: GnnConfig,
        clock: Arc<dyn Clock>,
        weights_dir: Option<PathBuf>,
    ) -> Self {
        let cache = EnhancementCache::new(
            config.cache_capacity,
            config.cache_max_bytes,
            config.cache_ttl_ms,
            config.cache_key_prefix_coords,
            clock,
        );
        let layers = Self::build_layers(dim, &config, weights_dir.as_deref());
        Self {
            dim,
            config,
            layers: RwLock::new(layers),
            cache,
            weights_dir,
        }
    }

    fn shapes(dim: usize, config: &GnnConfig) -> [(usize, usize, Activation); 3] {
        [
            (dim, config.hidden1, Activation::Relu),
            (config.hidden1, config.hidden2, Activation::Relu),
            (config.hidden2, dim, Activation::Identity),
        ]
    }

    fn build_layers(dim: usize, config: &GnnConfig, dir: Option<&std::path::Path>) -> Vec<DenseLayer> {
        let mut rng = StdRng::seed_from_u64(config.weight_seed);
        Self::shapes(dim, config)
            .into_iter()
            .enumerate()
            .map(|(i, (d_in, d_out, act))| {
                let index = i + 1;
                if config.auto_load {
                    if let Some(dir) = dir {
                        match weights::load_layer(dir, index, d_in, d_out, act) {
                            Ok(layer) => {
                                debug!(
                                    target: "engram.gnn::enhancer",
                                    index,
                                    "loaded layer weights from disk"
                                );
                                return layer;
                            }
                            Err(EngramError::Io { .. }) => {
                                // First run: nothing persisted yet.
                            }
                            Err(err) => {
                                warn!(
                                    target: "engram.gnn::enhancer",
                                    index,
                                    error = %err,
                                    "weight load failed; falling back to fresh initialization"
                                );
                            }
                        }
                    }
                }
                DenseLayer::xavier(d_in, d_out, act, &mut rng)
            })
            .collect()
    }

    #[must_use]
    pub fn cache(&self) -> &EnhancementCache {
        &self.cache
    }

    /// Enhance a query embedding, optionally against a trajectory graph.
    pub fn enhance(
        &self,
        embedding: &[f32],
        graph: Option<&TrajectoryGraph>,
    ) -> Result<EnhanceOutcome> {
        if embedding.len() != self.dim {
            return Err(EngramError::DimensionMismatch {
                expected: self.dim,
                actual: embedding.len(),
            });
        }
        let empty_edges = Vec::new();
        let edge_ids = graph.map_or(&empty_edges, |g| &g.hyperedge_ids);
        let key = self.cache.key(embedding, edge_ids);
        if let Some(vector) = self.cache.get(key) {
            return Ok(EnhanceOutcome {
                vector,
                enhanced: true,
                timed_out: false,
                cache_hit: true,
                elapsed_ms: 0,
            });
        }

        let started = Instant::now();
        let input = graph.map_or_else(
            || embedding.to_vec(),
            |g| aggregate(embedding, g, self.config.max_graph_nodes),
        );

        let mut x = input;
        {
            let layers = self.layers.read();
            for layer in layers.iter() {
                let y = layer.forward(&x)?;
                // Residual add where the shapes allow it.
                x = if layer.dim_in == layer.dim_out {
                    y.iter().zip(x.iter()).map(|(a, b)| a + b).collect()
                } else {
                    y
                };
            }
        }
        for (slot, &orig) in x.iter_mut().zip(embedding.iter()) {
            *slot += orig;
        }

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if elapsed_ms > self.config.enhance_timeout_ms {
            debug!(
                target: "engram.gnn::enhancer",
                elapsed_ms,
                budget_ms = self.config.enhance_timeout_ms,
                "enhancement over budget, returning raw embedding"
            );
            return Ok(EnhanceOutcome {
                vector: embedding.to_vec(),
                enhanced: false,
                timed_out: true,
                cache_hit: false,
                elapsed_ms,
            });
        }

        let vector = match engram_vector::l2_normalize(&x) {
            Ok(normalized) => normalized,
            Err(_) => {
                warn!(
                    target: "engram.gnn::enhancer",
                    "enhanced vector collapsed to zero, returning raw embedding"
                );
                return Ok(EnhanceOutcome {
                    vector: embedding.to_vec(),
                    enhanced: false,
                    timed_out: false,
                    cache_hit: false,
                    elapsed_ms,
                });
            }
        };

        let node_ids = graph.map(|g| g.node_ids()).unwrap_or_default();
        self.cache.put(key, vector.clone(), node_ids);
        Ok(EnhanceOutcome {
            vector,
            enhanced: true,
            timed_out: false,
            cache_hit: false,
            elapsed_ms,
        })
    }

    /// Forward the raw projection stack, collecting per-layer activations
    /// for backprop. Training drives the stack directly (no aggregation or
    /// output residual).
    pub fn forward_collect(&self, input: &[f32]) -> Result<(Vec<f32>, Vec<LayerActivation>)> {
        let layers = self.layers.read();
        let mut activations = Vec::with_capacity(layers.len());
        let mut x = input.to_vec();
        for layer in layers.iter() {
            let cached = layer.forward_cached(&x)?;
            x = cached.post_activation.clone();
            activations.push(cached);
        }
        Ok((x, activations))
    }

    /// Backward through all layers, clip by global norm, apply SGD.
    ///
    /// A NaN/Inf gradient fails with `GradientInvalid` and the optimizer
    /// step is skipped entirely. Returns the pre-clip gradient norm.
    pub fn backward_and_apply(
        &self,
        d_output: &[f32],
        activations: &[LayerActivation],
        learning_rate: f32,
    ) -> Result<f32> {
        let mut layers = self.layers.write();
        if activations.len() != layers.len() {
            return Err(EngramError::Internal(format!(
                "activation cache has {} layers, expected {}",
                activations.len(),
                layers.len()
            )));
        }
        let mut grads = Vec::with_capacity(layers.len());
        let mut upstream = d_output.to_vec();
        for (layer, cache) in layers.iter().zip(activations.iter()).rev() {
            let grad = layer.backward(&upstream, cache)?;
            upstream = grad.d_input.clone();
            grads.push(grad);
        }
        grads.reverse();
        let norm = clip_gradients(&mut grads, self.config.grad_clip_norm)?;
        for (layer, grad) in layers.iter_mut().zip(grads.iter()) {
            layer.apply_gradients(grad, learning_rate)?;
        }
        Ok(norm)
    }

    /// Persist all layers atomically (each file via tmp + rename).
    pub fn save_weights(&self) -> Result<()> {
        let Some(dir) = &self.weights_dir else {
            return Err(EngramError::WeightPersistence(
                "no weights directory configured".to_string(),
            ));
        };
        let layers = self.layers.read();
        for (i, layer) in layers.iter().enumerate() {
            weights::save_layer(dir, i + 1, layer)?;
        }
        Ok(())
    }

    /// Rotate a numbered checkpoint of every layer.
    pub fn checkpoint(&self) -> Result<()> {
        let Some(dir) = &self.weights_dir else {
            return Err(EngramError::WeightPersistence(
                "no weights directory configured".to_string(),
            ));
        };
        let layers = self.layers.read();
        for (i, layer) in layers.iter().enumerate() {
            weights::checkpoint_layer(dir, i + 1, layer, self.config.checkpoint_keep)?;
        }
        Ok(())
    }

    /// Restore every layer from its newest checkpoint.
    pub fn restore_latest_checkpoint(&self) -> Result<()> {
        let Some(dir) = &self.weights_dir else {
            return Err(EngramError::CheckpointError(
                "no weights directory configured".to_string(),
            ));
        };
        let restored: Vec<DenseLayer> = Self::shapes(self.dim, &self.config)
            .into_iter()
            .enumerate()
            .map(|(i, (d_in, d_out, act))| {
                weights::load_checkpoint(dir, i + 1, None, d_in, d_out, act)
            })
            .collect::<Result<_>>()?;
        *self.layers.write() = restored;
        self.cache.invalidate_all();
        Ok(())
    }

    /// Current weight snapshot of one layer, for tests and diagnostics.
    pub fn layer_weights(&self, index: usize) -> Result<Vec<f32>> {
        self.layers
            .read()
            .get(index)
            .map(|layer| layer.weights.clone())
            .ok_or_else(|| EngramError::NotFound(format!("layer {index}")))
    }

    /// Drop any cached enhancement mentioning these vector ids.
    pub fn invalidate_nodes(&self, ids: &[engram_types::NodeId]) -> usize {
        self.cache.invalidate_nodes(ids)
    }

    #[must_use]
    pub fn validate_query(&self, id: &VectorId, embedding: &[f32], tolerance: f32) -> bool {
        engram_vector::ensure_query(id, embedding, self.dim, tolerance).is_ok()
    }
}
