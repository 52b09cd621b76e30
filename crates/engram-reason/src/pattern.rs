//! Pattern memory with calibrated confidence.
//!
//! Patterns are indexed by `(task_type, signature)`; the signature is an
//! embedding and two signatures belong to the same pattern when their
//! cosine similarity clears the match threshold. Confidence is the
//! Beta(α₀+s, β₀+f) posterior mean. Rows persist append-only; replay keeps
//! the last row per id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use engram_error::{EngramError, Result};
use engram_types::{Clock, DistanceMetric, PatternId, SystemClock};
use engram_vector::similarity;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

const PATTERNS_DB: &str = "patterns.db";

/// Beta prior (α₀, β₀).
const PRIOR_ALPHA: f64 = 1.0;
const PRIOR_BETA: f64 = 1.0;

/// Same-pattern cosine threshold.
const MATCH_THRESHOLD: f32 = 0.95;

/// Query-time minimum signature similarity.
const QUERY_THRESHOLD: f32 = 0.5;

/// Recency half-life for the ranker, 7 days.
const RECENCY_HALF_LIFE_MS: u64 = 7 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: PatternId,
    pub task_type: String,
    pub signature: Vec<f32>,
    pub success_count: u64,
    pub failure_count: u64,
    /// Beta posterior mean, recomputed on every update.
    pub confidence: f64,
    pub last_used: u64,
    pub created_at: u64,
}

fn calibrated(successes: u64, failures: u64) -> f64 {
    (PRIOR_ALPHA + successes as f64) / (PRIOR_ALPHA + PRIOR_BETA + (successes + failures) as f64)
}

pub struct PatternStore {
    dim: usize,
    tolerance: f32,
    clock: Arc<dyn Clock>,
    data_dir: Option<PathBuf>,
    patterns: Mutex<HashMap<PatternId, Pattern>>,
}

impl PatternStore {
    #[must_use]
    pub fn new(dim: usize, tolerance: f32) -> Self {
        Self::with_parts(dim, tolerance, Arc::new(SystemClock), None)
    }

    #[must_use]
    pub fn with_parts(
        dim: usize,
        tolerance: f32,
        clock: Arc<dyn Clock>,
        data_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            dim,
            tolerance,
            clock,
            data_dir,
            patterns: Mutex::new(HashMap::new()),
        }
    }

    pub fn open(dim: usize, tolerance: f32, clock: Arc<dyn Clock>, dir: &Path) -> Result<Self> {
        engram_fs::create_dir_all(dir)?;
        let store = Self::with_parts(dim, tolerance, clock, Some(dir.to_path_buf()));
        store.replay(dir)?;
        Ok(store)
    }

    fn replay(&self, dir: &Path) -> Result<()> {
        let path = dir.join(PATTERNS_DB);
        if !engram_fs::is_file(&path) {
            return Ok(());
        }
        let contents = engram_fs::read_to_string(&path)?;
        let mut patterns = self.patterns.lock();
        for (line_no, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Pattern>(line) {
                // Last row per id wins.
                Ok(pattern) => {
                    let _ = patterns.insert(pattern.id.clone(), pattern);
                }
                Err(err) => warn!(
                    target: "engram.reason::pattern",
                    line = line_no + 1,
                    error = %err,
                    "skipping unreadable pattern row"
                ),
            }
        }
        Ok(())
    }

    fn persist(&self, pattern: &Pattern) -> Result<()> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let line = serde_json::to_string(pattern)
            .map_err(|err| EngramError::Internal(format!("pattern serialize: {err}")))?;
        engram_fs::append_line(&dir.join(PATTERNS_DB), &line)
    }

    /// Find or create the pattern for `(task_type, signature)`.
    pub fn observe(&self, task_type: &str, signature: &[f32]) -> Result<PatternId> {
        let vid = engram_types::VectorId::from(task_type);
        engram_vector::ensure_query(&vid, signature, self.dim, self.tolerance)?;
        let now = self.clock.now_ms();
        let mut patterns = self.patterns.lock();
        let existing = patterns
            .values()
            .filter(|p| p.task_type == task_type)
            .map(|p| {
                (
                    p.id.clone(),
                    similarity(DistanceMetric::Cosine, signature, &p.signature),
                )
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        if let Some((id, sim)) = existing {
            if sim >= MATCH_THRESHOLD {
                return Ok(id);
            }
        }
        let pattern = Pattern {
            id: PatternId::mint(now),
            task_type: task_type.to_string(),
            signature: signature.to_vec(),
            success_count: 0,
            failure_count: 0,
            confidence: calibrated(0, 0),
            last_used: now,
            created_at: now,
        };
        let id = pattern.id.clone();
        self.persist(&pattern)?;
        patterns.insert(id.clone(), pattern);
        Ok(id)
    }

    /// Record an observed outcome and recompute the posterior.
    pub fn update(&self, id: &PatternId, success: bool) -> Result<f64> {
        let now = self.clock.now_ms();
        let updated = {
            let mut patterns = self.patterns.lock();
            let pattern = patterns
                .get_mut(id)
                .ok_or_else(|| EngramError::NotFound(id.to_string()))?;
            if success {
                pattern.success_count += 1;
            } else {
                pattern.failure_count += 1;
            }
            pattern.confidence = calibrated(pattern.success_count, pattern.failure_count);
            pattern.last_used = now;
            pattern.clone()
        };
        self.persist(&updated)?;
        Ok(updated.confidence)
    }

    /// Highest-ranked patterns for a task: `confidence × recency`.
    pub fn query(&self, task_type: &str, signature: &[f32], top_k: usize) -> Result<Vec<Pattern>> {
        let vid = engram_types::VectorId::from(task_type);
        engram_vector::ensure_query(&vid, signature, self.dim, self.tolerance)?;
        let now = self.clock.now_ms();
        let patterns = self.patterns.lock();
        let mut ranked: Vec<(f64, Pattern)> = patterns
            .values()
            .filter(|p| p.task_type == task_type)
            .filter(|p| {
                similarity(DistanceMetric::Cosine, signature, &p.signature) >= QUERY_THRESHOLD
            })
            .map(|p| {
                let age = now.saturating_sub(p.last_used) as f64;
                let recency = 0.5f64.powf(age / RECENCY_HALF_LIFE_MS as f64);
                (p.confidence * recency, p.clone())
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.id.cmp(&b.1.id))
        });
        Ok(ranked.into_iter().take(top_k).map(|(_, p)| p).collect())
    }

    pub fn pattern(&self, id: &PatternId) -> Result<Pattern> {
        self.patterns
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| EngramError::NotFound(id.to_string()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_types::{ManualClock, NORMALIZATION_TOLERANCE};

    fn unit(dim: usize, at: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[at] = 1.0;
        v
    }

    fn store() -> (PatternStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        (
            PatternStore::with_parts(8, NORMALIZATION_TOLERANCE, clock.clone(), None),
            clock,
        )
    }

    #[test]
    fn fresh_pattern_has_uninformed_prior() {
        let (s, _) = store();
        let id = s.observe("summarize", &unit(8, 0)).unwrap();
        assert_eq!(s.pattern(&id).unwrap().confidence, 0.5);
    }

    #[test]
    fn repeat_observation_reuses_the_pattern() {
        let (s, _) = store();
        let a = s.observe("summarize", &unit(8, 0)).unwrap();
        let b = s.observe("summarize", &unit(8, 0)).unwrap();
        assert_eq!(a, b);
        assert_eq!(s.len(), 1);
        // Same signature under a different task type is a new pattern.
        let c = s.observe("classify", &unit(8, 0)).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn confidence_follows_the_beta_posterior() {
        let (s, _) = store();
        let id = s.observe("t", &unit(8, 1)).unwrap();
        for _ in 0..8 {
            s.update(&id, true).unwrap();
        }
        for _ in 0..2 {
            s.update(&id, false).unwrap();
        }
        // Beta(1+8, 1+2) mean = 9/12.
        let confidence = s.pattern(&id).unwrap().confidence;
        assert!((confidence - 0.75).abs() < 1e-9);
    }

    #[test]
    fn query_ranks_by_confidence_and_recency() {
        let (s, clock) = store();
        let strong = s.observe("t", &unit(8, 0)).unwrap();
        for _ in 0..9 {
            s.update(&strong, true).unwrap();
        }
        let weak = s.observe("t", &unit(8, 1)).unwrap();
        s.update(&weak, false).unwrap();

        clock.advance(1000);
        let query = engram_vector::l2_normalize(&{
            let mut v = unit(8, 0);
            v[1] = 1.0;
            v
        })
        .unwrap();
        let ranked = s.query("t", &query, 10).unwrap();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].id, strong);
        assert_eq!(ranked[1].id, weak);
    }

    #[test]
    fn stale_patterns_rank_below_fresh_ones() {
        let (s, clock) = store();
        let stale = s.observe("t", &unit(8, 0)).unwrap();
        s.update(&stale, true).unwrap();
        // Three weeks idle.
        clock.advance(21 * 24 * 60 * 60 * 1000);
        let fresh = s.observe("t", &unit(8, 1)).unwrap();
        s.update(&fresh, true).unwrap();

        let query = engram_vector::l2_normalize(&{
            let mut v = unit(8, 0);
            v[1] = 1.0;
            v
        })
        .unwrap();
        let ranked = s.query("t", &query, 10).unwrap();
        assert_eq!(ranked[0].id, fresh, "recency factor must demote stale patterns");
    }

    #[test]
    fn query_respects_top_k_and_task_isolation() {
        let (s, _) = store();
        for at in 0..4 {
            let id = s.observe("a", &unit(8, at)).unwrap();
            s.update(&id, true).unwrap();
        }
        let _ = s.observe("b", &unit(8, 0)).unwrap();
        let hits = s.query("a", &unit(8, 0), 2).unwrap();
        assert!(hits.len() <= 2);
        assert!(hits.iter().all(|p| p.task_type == "a"));
    }

    #[test]
    fn rows_replay_keeping_latest_counts() {
        let dir = tempfile::tempdir().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let id = {
            let s = PatternStore::open(8, NORMALIZATION_TOLERANCE, clock.clone(), dir.path())
                .unwrap();
            let id = s.observe("t", &unit(8, 0)).unwrap();
            s.update(&id, true).unwrap();
            s.update(&id, true).unwrap();
            id
        };
        let reopened =
            PatternStore::open(8, NORMALIZATION_TOLERANCE, clock, dir.path()).unwrap();
        let pattern = reopened.pattern(&id).unwrap();
        assert_eq!(pattern.success_count, 2);
        assert!((pattern.confidence - 0.75).abs() < 1e-9);
    }
}
