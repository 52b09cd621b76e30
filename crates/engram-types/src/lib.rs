//! Core vocabulary shared by every engramdb crate: identifiers, compression
//! tiers, distance metrics, metadata values, clocks, and configuration.

pub mod clock;
pub mod config;
pub mod id;
pub mod metadata;
pub mod metric;
pub mod tier;

pub use clock::{Clock, ManualClock, SystemClock, epoch_ms};
pub use config::{
    CompressionConfig, ConfigError, DaemonConfig, EngramConfig, GnnConfig, HeatConfig, HnswConfig,
    LScoreConfig, SonaConfig,
};
pub use id::{
    EdgeId, IdError, NodeId, PatternId, ProvenanceId, SourceId, TrajectoryId, VectorId, mint_tagged,
};
pub use metadata::{Metadata, MetadataValue};
pub use metric::DistanceMetric;
pub use tier::{CompressionTier, VectorCodec};

/// Process-wide default embedding dimension.
pub const DEFAULT_DIM: usize = 1536;

/// Tolerance for `|‖v‖₂ − 1|` on stored vectors.
pub const NORMALIZATION_TOLERANCE: f32 = 1e-4;
