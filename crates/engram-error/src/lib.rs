//! Unified error type for the engramdb workspace.
//!
//! Every fallible public operation returns [`Result`]. Variants are grouped
//! by taxonomy: validation, storage, compression, learning, provenance,
//! concurrency, and IPC. The daemon maps each variant to a stable JSON-RPC
//! error code via [`EngramError::rpc_code`].

use std::path::PathBuf;

use engram_types::{CompressionTier, ConfigError, IdError, VectorId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngramError>;

/// JSON-RPC 2.0 reserved code: invalid request object.
pub const RPC_INVALID_REQUEST: i64 = -32600;
/// JSON-RPC 2.0 reserved code: method not found.
pub const RPC_METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC 2.0 reserved code: invalid params.
pub const RPC_INVALID_PARAMS: i64 = -32602;
/// JSON-RPC 2.0 reserved code: parse error.
pub const RPC_PARSE_ERROR: i64 = -32700;

#[derive(Debug, Error)]
pub enum EngramError {
    // ── Validation ──
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("vector `{id}` is not L2-normalized: ‖v‖₂ = {norm}")]
    NotNormalized { id: VectorId, norm: f32 },
    #[error("vector `{id}` contains a non-finite component at index {index}")]
    NonFiniteValue { id: VectorId, index: usize },
    #[error("zero vector cannot be normalized")]
    ZeroVector,
    #[error("invalid namespace `{0}`")]
    InvalidNamespace(String),
    #[error("hyperedge requires at least 3 participants, got {got}")]
    InvalidHyperedge { got: usize },
    #[error("node `{0}` would be orphaned; link it or mark it as seed")]
    OrphanNode(String),
    #[error("weight {value} outside [0, 1]")]
    InvalidWeight { value: f64 },

    // ── Storage ──
    #[error("not found: {0}")]
    NotFound(String),
    #[error("duplicate id: {0}")]
    DuplicateId(String),
    #[error("corrupt record at {path}: {detail}")]
    CorruptRecord { path: PathBuf, detail: String },
    #[error("checksum mismatch at {path}: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        path: PathBuf,
        stored: u32,
        computed: u32,
    },
    #[error("version mismatch at {path}: supported {supported}, found {found}")]
    VersionMismatch {
        path: PathBuf,
        supported: u32,
        found: u32,
    },

    // ── Compression ──
    #[error("invalid tier for operation: {0:?}")]
    InvalidTier(CompressionTier),
    #[error("codec for tier {tier:?} is not trained ({have}/{need} training vectors)")]
    CodecNotTrained {
        tier: CompressionTier,
        have: usize,
        need: usize,
    },
    #[error("backward tier transition rejected: {from:?} → {to:?}")]
    TierTransitionBackward {
        from: CompressionTier,
        to: CompressionTier,
    },
    #[error("reconstruction quality for `{id}` exceeds tier bound: {error} > {bound}")]
    ReconstructionQuality { id: VectorId, error: f32, bound: f32 },

    // ── Learning ──
    #[error("trajectory validation failed: {0}")]
    TrajectoryValidation(String),
    #[error("feedback validation failed: {0}")]
    FeedbackValidation(String),
    #[error("weight drift {drift:.4} for route `{route}` exceeds reject threshold {threshold:.4}")]
    DriftExceeded {
        route: String,
        drift: f64,
        threshold: f64,
    },
    #[error("weight persistence failed: {0}")]
    WeightPersistence(String),
    #[error("rollback loop detected for checkpoint {0}")]
    RollbackLoop(String),
    #[error("checkpoint error: {0}")]
    CheckpointError(String),
    #[error("gradient contains non-finite values in layer {layer}")]
    GradientInvalid { layer: usize },

    // ── Provenance ──
    #[error("provenance validation failed: {0}")]
    ProvenanceValidation(String),
    #[error("L-Score {score:.3} below threshold {threshold:.3} for domain `{domain}`")]
    LScoreRejection {
        score: f64,
        threshold: f64,
        domain: String,
    },

    // ── Concurrency ──
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation `{operation}` timed out after {elapsed_ms} ms")]
    Timeout { operation: String, elapsed_ms: u64 },
    #[error("circuit breaker open for `{0}`")]
    CircuitOpen(String),
    #[error("rate limited: {0}")]
    RateLimited(String),

    // ── IPC ──
    #[error("daemon is not running")]
    ServerNotRunning,
    #[error("daemon disconnected mid-request")]
    ServerDisconnected,
    #[error("unknown method `{0}`")]
    UnknownMethod(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("connection limit reached ({0})")]
    MaxConnections(usize),
    #[error("parse error: {0}")]
    ParseError(String),

    // ── Ambient ──
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("identifier error: {0}")]
    Id(#[from] IdError),
    #[error("i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("internal: {0}")]
    Internal(String),
}

impl EngramError {
    /// Wrap an I/O error with the path it occurred on.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Taxonomy bucket, used as the metrics/event `status` label.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::DimensionMismatch { .. }
            | Self::NotNormalized { .. }
            | Self::NonFiniteValue { .. }
            | Self::ZeroVector
            | Self::InvalidNamespace(_)
            | Self::InvalidHyperedge { .. }
            | Self::OrphanNode(_)
            | Self::InvalidWeight { .. } => "validation",
            Self::NotFound(_)
            | Self::DuplicateId(_)
            | Self::CorruptRecord { .. }
            | Self::ChecksumMismatch { .. }
            | Self::VersionMismatch { .. } => "storage",
            Self::InvalidTier(_)
            | Self::CodecNotTrained { .. }
            | Self::TierTransitionBackward { .. }
            | Self::ReconstructionQuality { .. } => "compression",
            Self::TrajectoryValidation(_)
            | Self::FeedbackValidation(_)
            | Self::DriftExceeded { .. }
            | Self::WeightPersistence(_)
            | Self::RollbackLoop(_)
            | Self::CheckpointError(_)
            | Self::GradientInvalid { .. } => "learning",
            Self::ProvenanceValidation(_) | Self::LScoreRejection { .. } => "provenance",
            Self::Cancelled | Self::Timeout { .. } | Self::CircuitOpen(_) | Self::RateLimited(_) => {
                "concurrency"
            }
            Self::ServerNotRunning
            | Self::ServerDisconnected
            | Self::UnknownMethod(_)
            | Self::InvalidRequest(_)
            | Self::MaxConnections(_)
            | Self::ParseError(_) => "ipc",
            Self::Config(_) | Self::Id(_) | Self::Io { .. } | Self::Internal(_) => "internal",
        }
    }

    /// Stable JSON-RPC error code for the daemon's error objects.
    ///
    /// Reserved JSON-RPC 2.0 codes map directly; everything else lands in
    /// the application range `-32000..=-32099`, one code per taxonomy bucket.
    #[must_use]
    pub fn rpc_code(&self) -> i64 {
        match self {
            Self::InvalidRequest(_) => RPC_INVALID_REQUEST,
            Self::UnknownMethod(_) => RPC_METHOD_NOT_FOUND,
            Self::FeedbackValidation(_) | Self::TrajectoryValidation(_) => RPC_INVALID_PARAMS,
            Self::ParseError(_) => RPC_PARSE_ERROR,
            Self::NotFound(_) => -32000,
            Self::DuplicateId(_) => -32001,
            Self::MaxConnections(_) => -32002,
            Self::Timeout { .. } => -32003,
            Self::Cancelled => -32004,
            Self::CircuitOpen(_) => -32005,
            Self::RateLimited(_) => -32006,
            Self::DriftExceeded { .. } => -32010,
            Self::LScoreRejection { .. } => -32011,
            other => match other.category() {
                "validation" => -32020,
                "storage" => -32021,
                "compression" => -32022,
                "learning" => -32023,
                "provenance" => -32024,
                _ => -32099,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_codes_stay_in_reserved_ranges() {
        let samples: Vec<EngramError> = vec![
            EngramError::InvalidRequest("bad".into()),
            EngramError::UnknownMethod("nope".into()),
            EngramError::ParseError("trailing garbage".into()),
            EngramError::NotFound("v1".into()),
            EngramError::Cancelled,
            EngramError::DriftExceeded {
                route: "a/b".into(),
                drift: 0.3,
                threshold: 0.2,
            },
            EngramError::ZeroVector,
            EngramError::Internal("x".into()),
        ];
        for err in &samples {
            let code = err.rpc_code();
            let reserved = matches!(
                code,
                RPC_INVALID_REQUEST | RPC_METHOD_NOT_FOUND | RPC_INVALID_PARAMS | RPC_PARSE_ERROR
            );
            let application = (-32099..=-32000).contains(&code);
            assert!(reserved || application, "{err} has out-of-range code {code}");
        }
    }

    #[test]
    fn categories_cover_the_taxonomy() {
        assert_eq!(
            EngramError::InvalidHyperedge { got: 2 }.category(),
            "validation"
        );
        assert_eq!(
            EngramError::TierTransitionBackward {
                from: CompressionTier::Cool,
                to: CompressionTier::Hot,
            }
            .category(),
            "compression"
        );
        assert_eq!(EngramError::ServerNotRunning.category(), "ipc");
    }
}
