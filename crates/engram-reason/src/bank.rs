//! Sona reasoning bank.
//!
//! A trajectory ledger plus a per-route weight table learned from
//! feedback. Every update runs the full protocol: reward mapping,
//! Fisher-regularized step, clamping, drift guard against the last
//! checkpoint, Fisher decay, and throttled checkpointing. Checkpoints live
//! in a CRC-stamped ring buffer; repeated early restores trip the
//! rollback-loop detector, and consecutive failed updates auto-roll the
//! bank back and flag the route as cooling.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use engram_error::{EngramError, Result};
use engram_types::{Clock, Metadata, MetadataValue, SonaConfig, SystemClock, TrajectoryId, mint_tagged};
use engram_observability::{EventBus, EventStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const WEIGHTS_FILE: &str = "weights.json";
const COMPONENT: &str = "reasoning_bank";

/// Rollback-loop trigger: the same checkpoint restored early this many
/// times.
const ROLLBACK_LOOP_LIMIT: u32 = 3;

/// Canonicalize a route: lowercase, split on `/`, drop empty segments.
#[must_use]
pub fn canonical_route(route: &str) -> String {
    route
        .to_lowercase()
        .split('/')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub id: TrajectoryId,
    pub route: String,
    pub labels: BTreeSet<String>,
    /// Ordered parent list for hyperedge construction downstream.
    pub context_ids: Vec<String>,
    pub outcome_quality: Option<f64>,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteWeight {
    pub weight: f64,
    pub fisher: f64,
    pub updated_at: u64,
    pub update_count: u64,
    /// Set after an auto-rollback until the next accepted update.
    pub cooling: bool,
}

/// A weights snapshot in the rollback ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub reason: String,
    pub weights: BTreeMap<String, f64>,
    pub fisher: BTreeMap<String, f64>,
    pub created_at: u64,
    pub crc32: u32,
    /// Update-step counter at creation, for rollback-loop detection.
    pub created_step: u64,
}

fn checkpoint_crc(weights: &BTreeMap<String, f64>, fisher: &BTreeMap<String, f64>) -> u32 {
    let mut bytes = Vec::new();
    for (route, value) in weights {
        bytes.extend_from_slice(route.as_bytes());
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    for (route, value) in fisher {
        bytes.extend_from_slice(route.as_bytes());
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    crc32c::crc32c(&bytes)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedWeights {
    routes: BTreeMap<String, RouteWeight>,
}

#[derive(Default)]
struct Inner {
    trajectories: HashMap<TrajectoryId, Trajectory>,
    routes: HashMap<String, RouteWeight>,
    checkpoints: VecDeque<Checkpoint>,
    step: u64,
    last_checkpoint_ms: u64,
    consecutive_failures: u32,
    /// checkpoint id → early-restore count.
    restore_counts: HashMap<String, u32>,
}

pub struct ReasoningBank {
    config: SonaConfig,
    clock: Arc<dyn Clock>,
    data_dir: Option<PathBuf>,
    bus: Option<EventBus>,
    inner: Mutex<Inner>,
}

impl ReasoningBank {
    #[must_use]
    pub fn new(config: SonaConfig) -> Self {
        Self::with_parts(config, Arc::new(SystemClock), None, None)
    }

    #[must_use]
    pub fn with_parts(
        config: SonaConfig,
        clock: Arc<dyn Clock>,
        data_dir: Option<PathBuf>,
        bus: Option<EventBus>,
    ) -> Self {
        Self {
            config,
            clock,
            data_dir,
            bus,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Open with persistence under `dir`, loading any existing weights.
    pub fn open(
        config: SonaConfig,
        clock: Arc<dyn Clock>,
        dir: &Path,
        bus: Option<EventBus>,
    ) -> Result<Self> {
        engram_fs::create_dir_all(dir)?;
        let bank = Self::with_parts(config, clock, Some(dir.to_path_buf()), bus);
        let path = dir.join(WEIGHTS_FILE);
        if engram_fs::is_file(&path) {
            let contents = engram_fs::read_to_string(&path)?;
            match serde_json::from_str::<PersistedWeights>(&contents) {
                Ok(persisted) => {
                    bank.inner.lock().routes = persisted.routes.into_iter().collect();
                }
                Err(err) => warn!(
                    target: "engram.reason::bank",
                    error = %err,
                    "weights.json unreadable, starting from priors"
                ),
            }
        }
        Ok(bank)
    }

    fn persist_locked(&self, inner: &Inner) -> Result<()> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let persisted = PersistedWeights {
            routes: inner
                .routes
                .iter()
                .map(|(route, weight)| (route.clone(), weight.clone()))
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&persisted)
            .map_err(|err| EngramError::WeightPersistence(err.to_string()))?;
        engram_fs::write_atomic(&dir.join(WEIGHTS_FILE), &json)?;
        Ok(())
    }

    /// Record a new trajectory. Creation is never gated by quality.
    pub fn create_trajectory(
        &self,
        route: &str,
        labels: impl IntoIterator<Item = String>,
        context_ids: Vec<String>,
    ) -> Result<TrajectoryId> {
        let canonical = canonical_route(route);
        if canonical.is_empty() {
            return Err(EngramError::TrajectoryValidation(
                "route must contain at least one segment".to_string(),
            ));
        }
        let now = self.clock.now_ms();
        let trajectory = Trajectory {
            id: TrajectoryId::mint(now),
            route: canonical,
            labels: labels.into_iter().collect(),
            context_ids,
            outcome_quality: None,
            created_at: now,
        };
        let id = trajectory.id.clone();
        self.inner.lock().trajectories.insert(id.clone(), trajectory);
        Ok(id)
    }

    /// Newest-first trajectories on a route, for the trajectory adapter.
    #[must_use]
    pub fn recent_trajectories(&self, route: &str, limit: usize) -> Vec<Trajectory> {
        let canonical = canonical_route(route);
        let inner = self.inner.lock();
        let mut matching: Vec<Trajectory> = inner
            .trajectories
            .values()
            .filter(|t| t.route == canonical)
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        matching.truncate(limit);
        matching
    }

    pub fn trajectory(&self, id: &TrajectoryId) -> Result<Trajectory> {
        self.inner
            .lock()
            .trajectories
            .get(id)
            .cloned()
            .ok_or_else(|| EngramError::NotFound(id.to_string()))
    }

    /// Current weight for a route (the prior when unseen).
    #[must_use]
    pub fn weight_of(&self, route: &str) -> f64 {
        let canonical = canonical_route(route);
        self.inner
            .lock()
            .routes
            .get(&canonical)
            .map_or(self.config.w_init, |entry| entry.weight)
    }

    /// Full weight-table snapshot for the fusion layer.
    #[must_use]
    pub fn route_weights(&self) -> BTreeMap<String, RouteWeight> {
        self.inner
            .lock()
            .routes
            .iter()
            .map(|(route, weight)| (route.clone(), weight.clone()))
            .collect()
    }

    fn checkpoint_weight_for(inner: &Inner, route: &str, fallback: f64) -> f64 {
        inner
            .checkpoints
            .back()
            .and_then(|ckpt| ckpt.weights.get(route).copied())
            .unwrap_or(fallback)
    }

    /// The weight-update protocol.
    ///
    /// Returns the committed weight. `DriftExceeded` leaves the previous
    /// weight in place; two consecutive failures auto-roll the bank back
    /// to the last safe checkpoint and mark the route as cooling.
    pub fn provide_feedback(&self, trajectory_id: &TrajectoryId, quality: f64) -> Result<f64> {
        if !(0.0..=1.0).contains(&quality) {
            return Err(EngramError::FeedbackValidation(format!(
                "quality {quality} outside [0, 1]"
            )));
        }
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        let route = {
            let trajectory = inner
                .trajectories
                .get_mut(trajectory_id)
                .ok_or_else(|| EngramError::NotFound(trajectory_id.to_string()))?;
            trajectory.outcome_quality = Some(quality);
            trajectory.route.clone()
        };

        let current = inner
            .routes
            .get(&route)
            .map_or(self.config.w_init, |entry| entry.weight);

        // Below the auto-quality floor: the outcome is recorded, the
        // weight update is skipped.
        if quality < self.config.min_feedback_quality {
            return Ok(current);
        }

        let reward = 2.0 * quality - 1.0;
        let delta = self.config.learning_rate * reward
            - self.config.fisher_lambda * (current - self.config.w_init);
        let candidate = (current + delta).clamp(self.config.w_min, self.config.w_max);
        let anchor = Self::checkpoint_weight_for(&inner, &route, self.config.w_init);
        let drift = (candidate - anchor).abs();

        if drift >= self.config.reject_threshold {
            inner.consecutive_failures += 1;
            self.emit(
                now,
                "weight_update_rejected",
                EventStatus::Degraded,
                &route,
                drift,
            );
            if inner.consecutive_failures >= self.config.failure_rollback_after {
                self.auto_rollback(&mut inner, &route, now);
            }
            return Err(EngramError::DriftExceeded {
                route,
                drift,
                threshold: self.config.reject_threshold,
            });
        }
        if drift >= self.config.alert_threshold {
            warn!(
                target: "engram.reason::bank",
                route = %route,
                drift,
                "weight drift past alert threshold"
            );
            self.emit(now, "weight_drift_alert", EventStatus::Degraded, &route, drift);
        }

        let entry = inner.routes.entry(route.clone()).or_insert(RouteWeight {
            weight: self.config.w_init,
            fisher: 0.0,
            updated_at: now,
            update_count: 0,
            cooling: false,
        });
        entry.weight = candidate;
        entry.fisher =
            self.config.fisher_decay * entry.fisher + (1.0 - self.config.fisher_decay) * reward * reward;
        entry.updated_at = now;
        entry.update_count += 1;
        entry.cooling = false;
        inner.step += 1;
        inner.consecutive_failures = 0;

        // Throttled checkpoint.
        if now.saturating_sub(inner.last_checkpoint_ms) >= self.config.auto_save_interval_ms {
            self.checkpoint_locked(&mut inner, "auto", now);
            self.persist_locked(&inner)?;
        }
        Ok(candidate)
    }

    fn auto_rollback(&self, inner: &mut Inner, route: &str, now: u64) {
        let checkpoint = inner.checkpoints.back().cloned();
        match &checkpoint {
            Some(checkpoint) => Self::restore_snapshot(inner, checkpoint),
            // Nothing to roll back to: the whole table reverts to priors.
            None => inner.routes.clear(),
        }
        let created_at = checkpoint.as_ref().map_or(now, |c| c.created_at);
        inner
            .routes
            .entry(route.to_string())
            .and_modify(|entry| entry.cooling = true)
            .or_insert(RouteWeight {
                weight: self.config.w_init,
                fisher: 0.0,
                updated_at: created_at,
                update_count: 0,
                cooling: true,
            });
        inner.consecutive_failures = 0;
        info!(
            target: "engram.reason::bank",
            route = %route,
            checkpoint = checkpoint.as_ref().map_or("<none>", |c| c.id.as_str()),
            "auto-rollback after consecutive failed updates, route cooling"
        );
        self.emit(now, "auto_rollback", EventStatus::Degraded, route, 0.0);
    }

    /// Replace the whole weight table with the snapshot; routes unknown to
    /// the checkpoint revert to their priors (absence).
    fn restore_snapshot(inner: &mut Inner, checkpoint: &Checkpoint) {
        inner.routes = checkpoint
            .weights
            .iter()
            .map(|(route, &weight)| {
                (
                    route.clone(),
                    RouteWeight {
                        weight,
                        fisher: checkpoint.fisher.get(route).copied().unwrap_or(0.0),
                        updated_at: checkpoint.created_at,
                        update_count: 0,
                        cooling: false,
                    },
                )
            })
            .collect();
    }

    fn checkpoint_locked(&self, inner: &mut Inner, reason: &str, now: u64) -> String {
        let weights: BTreeMap<String, f64> = inner
            .routes
            .iter()
            .map(|(route, entry)| (route.clone(), entry.weight))
            .collect();
        let fisher: BTreeMap<String, f64> = inner
            .routes
            .iter()
            .map(|(route, entry)| (route.clone(), entry.fisher))
            .collect();
        let crc32 = checkpoint_crc(&weights, &fisher);
        let checkpoint = Checkpoint {
            id: mint_tagged("ckpt", now),
            reason: reason.to_string(),
            weights,
            fisher,
            created_at: now,
            crc32,
            created_step: inner.step,
        };
        let id = checkpoint.id.clone();
        inner.checkpoints.push_back(checkpoint);
        while inner.checkpoints.len() > self.config.max_checkpoints {
            let _ = inner.checkpoints.pop_front();
        }
        inner.last_checkpoint_ms = now;
        id
    }

    /// Take an explicit checkpoint.
    pub fn checkpoint(&self, reason: &str) -> Result<String> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        let id = self.checkpoint_locked(&mut inner, reason, now);
        self.persist_locked(&inner)?;
        Ok(id)
    }

    /// Restore the most recent (or a named) checkpoint.
    ///
    /// A checkpoint restored within the rollback-loop window of its
    /// creation for the third time trips `RollbackLoop`.
    pub fn rollback(&self, checkpoint_id: Option<&str>) -> Result<String> {
        let mut inner = self.inner.lock();
        let checkpoint = match checkpoint_id {
            Some(id) => inner
                .checkpoints
                .iter()
                .find(|c| c.id == id)
                .cloned()
                .ok_or_else(|| EngramError::CheckpointError(format!("unknown checkpoint {id}")))?,
            None => inner
                .checkpoints
                .back()
                .cloned()
                .ok_or_else(|| EngramError::CheckpointError("no checkpoints".to_string()))?,
        };
        let computed = checkpoint_crc(&checkpoint.weights, &checkpoint.fisher);
        if computed != checkpoint.crc32 {
            return Err(EngramError::CheckpointError(format!(
                "checkpoint {} failed its CRC", checkpoint.id
            )));
        }
        if inner.step.saturating_sub(checkpoint.created_step) <= self.config.rollback_loop_window {
            let count = inner
                .restore_counts
                .entry(checkpoint.id.clone())
                .and_modify(|c| *c += 1)
                .or_insert(1);
            if *count >= ROLLBACK_LOOP_LIMIT {
                return Err(EngramError::RollbackLoop(checkpoint.id.clone()));
            }
        }
        Self::restore_snapshot(&mut inner, &checkpoint);
        self.persist_locked(&inner)?;
        Ok(checkpoint.id)
    }

    #[must_use]
    pub fn checkpoint_count(&self) -> usize {
        self.inner.lock().checkpoints.len()
    }

    /// Persist the weight table immediately.
    pub fn save(&self) -> Result<()> {
        let inner = self.inner.lock();
        self.persist_locked(&inner)
    }

    fn emit(&self, now: u64, operation: &str, status: EventStatus, route: &str, drift: f64) {
        let Some(bus) = &self.bus else {
            return;
        };
        let mut metadata = Metadata::new();
        metadata.insert("route".into(), MetadataValue::Text(route.to_string()));
        metadata.insert("drift".into(), MetadataValue::Float(drift));
        bus.emit_now(now, COMPONENT, operation, status, metadata);
    }
}
