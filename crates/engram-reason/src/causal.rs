//! Causal memory: a DAG of `cause → effect` links.
//!
//! Statements are interned into an arena of dense integer ids with
//! adjacency lists. Every insertion is cycle-checked (DFS over the
//! subgraph reachable from the new edge's effect) before commit, so the
//! graph is a DAG by construction. Chain traversal multiplies link
//! confidences.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use engram_error::{EngramError, Result};
use engram_types::{Clock, SystemClock};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

const CAUSAL_DB: &str = "causal.db";

/// Bound on the number of chains a traversal returns.
const MAX_CHAINS: usize = 64;

/// A directed causal link between interned statements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalLink {
    pub cause: String,
    pub effect: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence_ids: Vec<String>,
    pub created_at: u64,
}

/// An ordered causal chain with its compound confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct CausalChain {
    /// Statements from cause end to effect end.
    pub statements: Vec<String>,
    /// Product of link confidences along the chain.
    pub confidence: f64,
}

#[derive(Default)]
struct Inner {
    /// Arena: statement text by dense id.
    statements: Vec<String>,
    index: HashMap<String, usize>,
    /// Outgoing adjacency: `cause → [(effect, link_idx)]`.
    forward: HashMap<usize, Vec<(usize, usize)>>,
    /// Incoming adjacency: `effect → [(cause, link_idx)]`.
    reverse: HashMap<usize, Vec<(usize, usize)>>,
    links: Vec<CausalLink>,
}

impl Inner {
    fn intern(&mut self, statement: &str) -> usize {
        if let Some(&id) = self.index.get(statement) {
            return id;
        }
        let id = self.statements.len();
        self.statements.push(statement.to_string());
        self.index.insert(statement.to_string(), id);
        id
    }

    /// Would `cause → effect` close a cycle? True iff `cause` is already
    /// reachable from `effect` through forward edges.
    fn reachable(&self, from: usize, target: usize) -> bool {
        let mut stack = vec![from];
        let mut visited = vec![false; self.statements.len()];
        while let Some(node) = stack.pop() {
            if node == target {
                return true;
            }
            if visited[node] {
                continue;
            }
            visited[node] = true;
            if let Some(out) = self.forward.get(&node) {
                for &(next, _) in out {
                    if !visited[next] {
                        stack.push(next);
                    }
                }
            }
        }
        false
    }
}

pub struct CausalMemory {
    clock: Arc<dyn Clock>,
    data_dir: Option<PathBuf>,
    inner: Mutex<Inner>,
}

impl CausalMemory {
    #[must_use]
    pub fn new() -> Self {
        Self::with_parts(Arc::new(SystemClock), None)
    }

    #[must_use]
    pub fn with_parts(clock: Arc<dyn Clock>, data_dir: Option<PathBuf>) -> Self {
        Self {
            clock,
            data_dir,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn open(clock: Arc<dyn Clock>, dir: &Path) -> Result<Self> {
        engram_fs::create_dir_all(dir)?;
        let memory = Self::with_parts(clock, Some(dir.to_path_buf()));
        memory.replay(dir)?;
        Ok(memory)
    }

    fn replay(&self, dir: &Path) -> Result<()> {
        let path = dir.join(CAUSAL_DB);
        if !engram_fs::is_file(&path) {
            return Ok(());
        }
        let contents = engram_fs::read_to_string(&path)?;
        for (line_no, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CausalLink>(line) {
                Ok(link) => {
                    // Replays go through the same cycle guard; a corrupt
                    // log cannot smuggle a cycle in.
                    if let Err(err) = self.insert(link) {
                        warn!(
                            target: "engram.reason::causal",
                            line = line_no + 1,
                            error = %err,
                            "dropping causal row on replay"
                        );
                    }
                }
                Err(err) => warn!(
                    target: "engram.reason::causal",
                    line = line_no + 1,
                    error = %err,
                    "skipping unreadable causal row"
                ),
            }
        }
        Ok(())
    }

    fn insert(&self, link: CausalLink) -> Result<()> {
        let mut inner = self.inner.lock();
        let cause = inner.intern(&link.cause);
        let effect = inner.intern(&link.effect);
        if cause == effect {
            return Err(EngramError::ProvenanceValidation(
                "self-causation is a cycle".to_string(),
            ));
        }
        if inner.reachable(effect, cause) {
            return Err(EngramError::ProvenanceValidation(format!(
                "link `{}` → `{}` would create a cycle",
                link.cause, link.effect
            )));
        }
        let link_idx = inner.links.len();
        inner.forward.entry(cause).or_default().push((effect, link_idx));
        inner.reverse.entry(effect).or_default().push((cause, link_idx));
        inner.links.push(link);
        Ok(())
    }

    /// Add a causal link; rejects cycles and out-of-range confidence.
    pub fn add_link(
        &self,
        cause: &str,
        effect: &str,
        evidence_ids: Vec<String>,
        confidence: f64,
    ) -> Result<()> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(EngramError::InvalidWeight { value: confidence });
        }
        let link = CausalLink {
            cause: cause.to_string(),
            effect: effect.to_string(),
            confidence,
            evidence_ids,
            created_at: self.clock.now_ms(),
        };
        self.insert(link.clone())?;
        if let Some(dir) = &self.data_dir {
            let line = serde_json::to_string(&link)
                .map_err(|err| EngramError::Internal(format!("causal serialize: {err}")))?;
            engram_fs::append_line(&dir.join(CAUSAL_DB), &line)?;
        }
        Ok(())
    }

    /// Chains ending at `effect`, deepest causes first in each chain.
    pub fn find_causes(&self, effect: &str, max_depth: usize) -> Result<Vec<CausalChain>> {
        self.chains(effect, max_depth, Direction::Upstream)
    }

    /// Chains starting at `cause`.
    pub fn find_effects(&self, cause: &str, max_depth: usize) -> Result<Vec<CausalChain>> {
        self.chains(cause, max_depth, Direction::Downstream)
    }

    fn chains(&self, start: &str, max_depth: usize, direction: Direction) -> Result<Vec<CausalChain>> {
        let inner = self.inner.lock();
        let Some(&start_id) = inner.index.get(start) else {
            return Err(EngramError::NotFound(start.to_string()));
        };
        let mut chains = Vec::new();
        let mut stack: Vec<(usize, Vec<usize>, f64)> = vec![(start_id, vec![start_id], 1.0)];
        while let Some((node, path, confidence)) = stack.pop() {
            if chains.len() >= MAX_CHAINS {
                break;
            }
            let adjacency = match direction {
                Direction::Upstream => inner.reverse.get(&node),
                Direction::Downstream => inner.forward.get(&node),
            };
            let frontier: Vec<(usize, usize)> = adjacency.cloned().unwrap_or_default();
            let at_depth_limit = path.len() > max_depth;
            if frontier.is_empty() || at_depth_limit {
                if path.len() > 1 {
                    let mut ids = path.clone();
                    if direction == Direction::Upstream {
                        ids.reverse();
                    }
                    chains.push(CausalChain {
                        statements: ids.iter().map(|&id| inner.statements[id].clone()).collect(),
                        confidence,
                    });
                }
                continue;
            }
            for (next, link_idx) in frontier {
                if path.contains(&next) {
                    continue;
                }
                let mut extended = path.clone();
                extended.push(next);
                stack.push((next, extended, confidence * inner.links[link_idx].confidence));
            }
        }
        chains.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(chains)
    }

    #[must_use]
    pub fn link_count(&self) -> usize {
        self.inner.lock().links.len()
    }

    #[must_use]
    pub fn statement_count(&self) -> usize {
        self.inner.lock().statements.len()
    }
}

impl Default for CausalMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Upstream,
    Downstream,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> CausalMemory {
        CausalMemory::new()
    }

    #[test]
    fn direct_cycle_is_rejected() {
        let m = memory();
        m.add_link("rain", "wet-roads", vec![], 0.9).unwrap();
        let err = m.add_link("wet-roads", "rain", vec![], 0.9).unwrap_err();
        assert!(matches!(err, EngramError::ProvenanceValidation(_)));
        assert_eq!(m.link_count(), 1);
    }

    #[test]
    fn transitive_cycle_is_rejected() {
        let m = memory();
        m.add_link("a", "b", vec![], 0.9).unwrap();
        m.add_link("b", "c", vec![], 0.9).unwrap();
        assert!(m.add_link("c", "a", vec![], 0.9).is_err());
        // The non-cyclic direction still works.
        m.add_link("a", "c", vec![], 0.9).unwrap();
    }

    #[test]
    fn self_causation_is_rejected() {
        let m = memory();
        assert!(m.add_link("x", "x", vec![], 0.5).is_err());
    }

    #[test]
    fn chain_confidence_is_the_product_of_links() {
        let m = memory();
        m.add_link("spark", "fire", vec![], 0.9).unwrap();
        m.add_link("fire", "smoke", vec![], 0.8).unwrap();
        let chains = m.find_effects("spark", 5).unwrap();
        let full = chains
            .iter()
            .find(|c| c.statements.len() == 3)
            .expect("full chain");
        assert_eq!(full.statements, vec!["spark", "fire", "smoke"]);
        assert!((full.confidence - 0.72).abs() < 1e-9);
    }

    #[test]
    fn find_causes_walks_upstream_in_causal_order() {
        let m = memory();
        m.add_link("spark", "fire", vec![], 0.9).unwrap();
        m.add_link("fire", "smoke", vec![], 0.8).unwrap();
        let chains = m.find_causes("smoke", 5).unwrap();
        let deepest = chains
            .iter()
            .find(|c| c.statements.len() == 3)
            .expect("deep chain");
        assert_eq!(deepest.statements, vec!["spark", "fire", "smoke"]);
    }

    #[test]
    fn max_depth_bounds_the_walk() {
        let m = memory();
        m.add_link("a", "b", vec![], 1.0).unwrap();
        m.add_link("b", "c", vec![], 1.0).unwrap();
        m.add_link("c", "d", vec![], 1.0).unwrap();
        let shallow = m.find_effects("a", 1).unwrap();
        assert!(shallow.iter().all(|c| c.statements.len() <= 2));
    }

    #[test]
    fn unknown_statement_is_not_found() {
        let m = memory();
        assert!(matches!(
            m.find_causes("ghost", 3).unwrap_err(),
            EngramError::NotFound(_)
        ));
    }

    #[test]
    fn out_of_range_confidence_is_rejected() {
        let m = memory();
        assert!(matches!(
            m.add_link("a", "b", vec![], 1.5).unwrap_err(),
            EngramError::InvalidWeight { .. }
        ));
    }

    #[test]
    fn links_replay_on_open_without_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        {
            let m = CausalMemory::open(clock.clone(), dir.path()).unwrap();
            m.add_link("deploy", "latency-spike", vec!["evt-1".to_string()], 0.7)
                .unwrap();
            m.add_link("latency-spike", "rollback", vec![], 0.6).unwrap();
        }
        let reopened = CausalMemory::open(clock, dir.path()).unwrap();
        assert_eq!(reopened.link_count(), 2);
        let chains = reopened.find_effects("deploy", 4).unwrap();
        assert!(!chains.is_empty());
        assert!((chains[0].confidence - 0.42).abs() < 1e-9);
    }
}
