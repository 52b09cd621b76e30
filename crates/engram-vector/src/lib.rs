//! Vector storage.
//!
//! The store owns every vector byte; indexes hold ids only. Writers are
//! validated fail-fast (dimension, finiteness, L2 normalization); reads
//! decode stored payloads back to float32 through an injected codec.

pub mod distance;
pub mod persist;
pub mod store;
pub mod validate;

pub use distance::similarity;
pub use store::{
    AccessSink, NoOpAccessSink, PayloadCodec, PlainCodec, SearchHit, SearchOptions, StoreStats,
    StoredPayload, UpsertOutcome, VectorIndex, VectorRecord, VectorResolver, VectorStore,
    decode_f32,
};
pub use validate::{ensure_finite, ensure_normalized, ensure_query, l2_norm, l2_normalize};
