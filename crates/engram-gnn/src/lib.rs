//! GNN query enhancer.
//!
//! Transforms a query embedding into a graph-context-aware embedding
//! through three learned projection layers with attention-weighted
//! neighborhood aggregation in front. Supports a full backward pass with
//! activation caching and global-norm gradient clipping, an LRU enhancement
//! cache keyed on embedding-prefix and hyperedge hashes, and checksummed
//! weight persistence with rotated checkpoints.

pub mod aggregate;
pub mod cache;
pub mod enhancer;
pub mod layer;
pub mod weights;

pub use aggregate::{TrajectoryGraph, TrajectoryNode};
pub use cache::EnhancementCache;
pub use enhancer::{EnhanceOutcome, GnnEnhancer};
pub use layer::{Activation, DenseLayer, LayerActivation, LayerGrads, clip_gradients};
