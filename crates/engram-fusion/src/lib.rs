//! Unified search ("quad-fusion").
//!
//! One query fans out to four source adapters — vector, graph, pattern
//! memory, trajectory — each with its own deadline and typed result.
//! Scores are mapped to [0, 1] per metric, z-normalized per source over
//! the union of returned ids, and fused with explicit or learned weights. Adapter timeouts degrade that source and mark the
//! envelope partial; GNN enhancement is gated by a circuit breaker.

pub mod adapters;
pub mod breaker;
pub mod normalize;
pub mod search;

pub use adapters::{
    AdapterHit, AdapterResult, GraphAdapter, MemoryAdapter, PatternAdapter, SearchQuery,
    SourceAdapter, VectorAdapter,
};
pub use breaker::{BreakerState, CircuitBreaker};
pub use search::{FusedHit, FusionOptions, SearchEnvelope, UnifiedSearch};
