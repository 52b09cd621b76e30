//! Reasoning memory.
//!
//! Three cooperating stores: patterns with Bayesian confidence, a causal
//! DAG with insert-time cycle rejection, and the Sona reasoning bank — a
//! trajectory ledger whose per-route weights learn from feedback under
//! drift guards and checkpointed rollback.

pub mod bank;
pub mod causal;
pub mod pattern;

pub use bank::{Checkpoint, ReasoningBank, RouteWeight, Trajectory, canonical_route};
pub use causal::{CausalChain, CausalLink, CausalMemory};
pub use pattern::{Pattern, PatternStore};
