//! Process configuration.
//!
//! Built once at program start and handed down; nothing in the substrate
//! reads the environment after construction. Environment surface:
//! `GOD_AGENT_HOME` (data directory), `GOD_AGENT_SOCKET` (socket override),
//! `GOD_AGENT_VECTOR_DIM` (must match persisted data or startup fails).

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::DEFAULT_DIM;

pub const ENV_HOME: &str = "GOD_AGENT_HOME";
pub const ENV_SOCKET: &str = "GOD_AGENT_SOCKET";
pub const ENV_VECTOR_DIM: &str = "GOD_AGENT_VECTOR_DIM";

const DEFAULT_HOME_DIR: &str = ".god-agent";
const FALLBACK_SOCKET: &str = "/tmp/god-agent.sock";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var} is not a valid dimension: {value}")]
    BadDimension { var: &'static str, value: String },
    #[error("no home directory available and {ENV_HOME} unset")]
    NoHome,
}

/// Heat model parameters for the compression scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatConfig {
    /// Recency weight α in `heat = α·recency + (1−α)·frequency`.
    pub alpha: f32,
    /// Recency half-life in milliseconds.
    pub half_life_ms: u64,
    /// Sliding access window (ring-buffer horizon).
    pub window_ms: u64,
    /// Scheduler tick interval.
    pub scheduler_interval_ms: u64,
    /// Accesses that saturate the frequency component.
    pub frequency_saturation: u32,
}

impl Default for HeatConfig {
    fn default() -> Self {
        Self {
            alpha: 0.6,
            half_life_ms: 6 * 60 * 60 * 1000,
            window_ms: 24 * 60 * 60 * 1000,
            scheduler_interval_ms: 60 * 60 * 1000,
            frequency_saturation: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Minimum vectors required before a PQ codebook trains.
    pub min_training_size: usize,
    /// Reconstruction error is measured on every n-th transition.
    pub error_sample_rate: u32,
    /// k-means iterations for codebook training.
    pub kmeans_iterations: u32,
    /// Encode the Warm tier with the int8 quantizer instead of f16.
    pub warm_int8: bool,
    /// Acceptance threshold for the int8 relative error metric.
    pub int8_max_relative_error: f32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            min_training_size: 256,
            error_sample_rate: 16,
            kmeans_iterations: 12,
            warm_int8: false,
            int8_max_relative_error: 0.02,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HnswConfig {
    /// Select the HNSW backend at store construction; false = flat scan.
    pub enabled: bool,
    /// Max links per node per layer.
    pub m: usize,
    /// Build-time candidate pool.
    pub ef_construction: usize,
    /// Query-time candidate pool.
    pub ef_search: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            m: 16,
            ef_construction: 200,
            ef_search: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GnnConfig {
    pub hidden1: usize,
    pub hidden2: usize,
    /// Max nodes accepted from a trajectory graph.
    pub max_graph_nodes: usize,
    pub cache_capacity: usize,
    pub cache_max_bytes: usize,
    pub cache_ttl_ms: u64,
    /// Leading embedding coordinates hashed into the cache key.
    pub cache_key_prefix_coords: usize,
    pub enhance_timeout_ms: u64,
    pub breaker_threshold: u32,
    pub breaker_reset_ms: u64,
    pub grad_clip_norm: f32,
    pub checkpoint_keep: usize,
    pub weight_seed: u64,
    pub auto_load: bool,
}

impl Default for GnnConfig {
    fn default() -> Self {
        Self {
            hidden1: 1024,
            hidden2: 1280,
            max_graph_nodes: 50,
            cache_capacity: 4096,
            cache_max_bytes: 64 << 20,
            cache_ttl_ms: 5 * 60 * 1000,
            cache_key_prefix_coords: 16,
            enhance_timeout_ms: 50,
            breaker_threshold: 3,
            breaker_reset_ms: 30_000,
            grad_clip_norm: 5.0,
            checkpoint_keep: 5,
            weight_seed: 0x5EED_CAFE,
            auto_load: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LScoreConfig {
    /// Depth penalty slope λ.
    pub lambda: f64,
    /// Chain length before the depth penalty engages.
    pub depth_soft_limit: usize,
    pub default_threshold: f64,
    /// Per-domain overrides of the acceptance threshold.
    pub domain_thresholds: BTreeMap<String, f64>,
    /// Citation traversal depth cap.
    pub max_citation_depth: usize,
}

impl Default for LScoreConfig {
    fn default() -> Self {
        Self {
            lambda: 0.1,
            depth_soft_limit: 3,
            default_threshold: 0.6,
            domain_thresholds: BTreeMap::new(),
            max_citation_depth: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SonaConfig {
    /// Learning rate η.
    pub learning_rate: f64,
    /// Fisher regularization strength λ.
    pub fisher_lambda: f64,
    /// Fisher information decay per update.
    pub fisher_decay: f64,
    pub w_init: f64,
    pub w_min: f64,
    pub w_max: f64,
    pub alert_threshold: f64,
    pub reject_threshold: f64,
    pub max_checkpoints: usize,
    pub auto_save_interval_ms: u64,
    /// Feedback below this quality records the outcome but skips the
    /// weight update.
    pub min_feedback_quality: f64,
    /// Consecutive failed updates before auto-rollback.
    pub failure_rollback_after: u32,
    /// Restores within this many steps of checkpoint creation count toward
    /// rollback-loop detection.
    pub rollback_loop_window: u64,
}

impl Default for SonaConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            fisher_lambda: 0.01,
            fisher_decay: 0.95,
            w_init: 0.5,
            w_min: 0.1,
            w_max: 2.0,
            alert_threshold: 0.15,
            reject_threshold: 0.20,
            max_checkpoints: 8,
            auto_save_interval_ms: 60_000,
            min_feedback_quality: 0.05,
            failure_rollback_after: 2,
            rollback_loop_window: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub max_connections: usize,
    pub request_timeout_ms: u64,
    pub max_message_bytes: usize,
    pub shutdown_budget_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            max_connections: 32,
            request_timeout_ms: 30_000,
            max_message_bytes: 1 << 20,
            shutdown_budget_ms: 30_000,
        }
    }
}

/// Top-level configuration handed to every component at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngramConfig {
    pub dim: usize,
    pub normalization_tolerance: f32,
    pub data_dir: PathBuf,
    pub socket_path: PathBuf,
    pub bus_capacity: usize,
    pub heat: HeatConfig,
    pub compression: CompressionConfig,
    pub hnsw: HnswConfig,
    pub gnn: GnnConfig,
    pub lscore: LScoreConfig,
    pub sona: SonaConfig,
    pub daemon: DaemonConfig,
}

impl Default for EngramConfig {
    fn default() -> Self {
        let data_dir = default_home().unwrap_or_else(|| PathBuf::from(DEFAULT_HOME_DIR));
        let socket_path = data_dir.join("daemon.sock");
        Self {
            dim: DEFAULT_DIM,
            normalization_tolerance: crate::NORMALIZATION_TOLERANCE,
            data_dir,
            socket_path,
            bus_capacity: 1024,
            heat: HeatConfig::default(),
            compression: CompressionConfig::default(),
            hnsw: HnswConfig::default(),
            gnn: GnnConfig::default(),
            lscore: LScoreConfig::default(),
            sona: SonaConfig::default(),
            daemon: DaemonConfig::default(),
        }
    }
}

impl EngramConfig {
    /// Build from the environment, falling back to defaults per variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(home) = std::env::var(ENV_HOME) {
            config.data_dir = PathBuf::from(home);
            config.socket_path = config.data_dir.join("daemon.sock");
        }
        if let Ok(socket) = std::env::var(ENV_SOCKET) {
            config.socket_path = PathBuf::from(socket);
        }
        if let Ok(dim) = std::env::var(ENV_VECTOR_DIM) {
            config.dim = dim.parse().map_err(|_| ConfigError::BadDimension {
                var: ENV_VECTOR_DIM,
                value: dim,
            })?;
            if config.dim == 0 {
                return Err(ConfigError::BadDimension {
                    var: ENV_VECTOR_DIM,
                    value: "0".to_string(),
                });
            }
        }
        Ok(config)
    }

    /// Socket path to use when the configured one is not creatable.
    #[must_use]
    pub fn fallback_socket() -> PathBuf {
        PathBuf::from(FALLBACK_SOCKET)
    }
}

fn default_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(DEFAULT_HOME_DIR))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let config = EngramConfig::default();
        assert_eq!(config.dim, DEFAULT_DIM);
        assert!(config.sona.alert_threshold < config.sona.reject_threshold);
        assert!(config.sona.w_min < config.sona.w_init);
        assert!(config.sona.w_init < config.sona.w_max);
        assert!(config.heat.alpha > 0.0 && config.heat.alpha < 1.0);
        assert_eq!(config.socket_path.file_name().unwrap(), "daemon.sock");
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = EngramConfig::default();
        let json = serde_json::to_string(&config).expect("serialize");
        let back: EngramConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, config);
    }
}
