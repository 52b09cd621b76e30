//! Compression manager.
//!
//! Owns the tier lifecycle for every stored vector: strictly-forward
//! transitions, on-demand codebook training, sampled reconstruction-error
//! checks, and the heat-driven scheduler. A failed transition leaves the
//! vector in its previous tier; the swap itself is atomic in the store.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use engram_error::{EngramError, Result};
use engram_observability::{EventBus, EventStatus};
use engram_types::{
    Clock, CompressionConfig, CompressionTier, Metadata, MetadataValue, VectorId,
};
use engram_vector::{PayloadCodec, VectorRecord, VectorStore};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::codec::TierCodecs;
use crate::heat::HeatTracker;
use crate::pq::{CENTROIDS_PQ4, CENTROIDS_PQ8, PqCodebook};

const COMPONENT: &str = "compression";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// Codec not trainable yet; the vector stays at its current tier.
    Skipped,
}

/// One scheduler pass, summarized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub examined: usize,
    pub transitioned: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct CompressionManager {
    store: Arc<VectorStore>,
    codecs: Arc<TierCodecs>,
    heat: Arc<HeatTracker>,
    config: CompressionConfig,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    codebook_dir: Option<PathBuf>,
    transitions: AtomicU64,
    pq_seed: u64,
}

impl CompressionManager {
    #[must_use]
    pub fn new(
        store: Arc<VectorStore>,
        codecs: Arc<TierCodecs>,
        heat: Arc<HeatTracker>,
        config: CompressionConfig,
        clock: Arc<dyn Clock>,
        bus: EventBus,
        codebook_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            store,
            codecs,
            heat,
            config,
            clock,
            bus,
            codebook_dir,
            transitions: AtomicU64::new(0),
            pq_seed: 0x00C0_DEB0,
        }
    }

    /// Read one record, decompressed to float32.
    pub fn get(&self, id: &VectorId) -> Result<VectorRecord> {
        self.store.get(id)
    }

    /// Migrate `id` to `target_tier`.
    ///
    /// Backward moves fail; an untrained codec skips (logged) rather than
    /// failing so the scheduler can retry after more data arrives.
    pub fn transition(&self, id: &VectorId, target_tier: CompressionTier) -> Result<TransitionOutcome> {
        let (_, current) = self.store.encoded_payload(id)?;
        if !current.is_forward_to(target_tier) {
            return Err(EngramError::TierTransitionBackward {
                from: current,
                to: target_tier,
            });
        }

        let vector = self.store.decode_silently(id)?;

        if !self.codecs.is_ready(target_tier) && !self.try_train(target_tier)? {
            debug!(
                target: "engram.compress::manager",
                id = %id,
                tier = ?target_tier,
                "codec not trainable yet, staying at current tier"
            );
            return Ok(TransitionOutcome::Skipped);
        }

        let payload = self.codecs.encode_for_tier(target_tier, &vector)?;

        // Sampled quality gate: every n-th transition re-decodes and
        // compares against the retained original before committing.
        let ordinal = self.transitions.fetch_add(1, Ordering::Relaxed);
        if self.config.error_sample_rate > 0
            && ordinal % u64::from(self.config.error_sample_rate) == 0
        {
            let decoded = self.codecs.decode(&payload, vector.len())?;
            let mean_err: f32 = vector
                .iter()
                .zip(decoded.iter())
                .map(|(a, b)| (a - b).abs())
                .sum::<f32>()
                / vector.len().max(1) as f32;
            let bound = target_tier.max_reconstruction_error();
            if mean_err > bound {
                return Err(EngramError::ReconstructionQuality {
                    id: id.clone(),
                    error: mean_err,
                    bound,
                });
            }
        }

        self.store.swap_payload(id, target_tier, payload)?;
        self.heat.set_tier(id, target_tier);
        self.emit_transition(id, current, target_tier);
        Ok(TransitionOutcome::Applied)
    }

    /// One scheduler pass: walk vectors coldest-first and migrate every
    /// vector whose heat fell below its tier's floor a single tier colder.
    pub fn tick(&self) -> TickSummary {
        let worklist = self.heat.coldest_first();
        let mut summary = TickSummary {
            examined: worklist.len(),
            ..TickSummary::default()
        };
        for (id, heat, tier) in worklist {
            if heat >= tier.min_heat_score() {
                continue;
            }
            let Some(next) = tier.next_colder() else {
                continue;
            };
            match self.transition(&id, next) {
                Ok(TransitionOutcome::Applied) => summary.transitioned += 1,
                Ok(TransitionOutcome::Skipped) => summary.skipped += 1,
                Err(EngramError::NotFound(_)) => {
                    // Deleted between snapshot and transition.
                    summary.skipped += 1;
                }
                Err(err) => {
                    summary.failed += 1;
                    warn!(
                        target: "engram.compress::manager",
                        id = %id,
                        error = %err,
                        "tier transition failed"
                    );
                }
            }
        }

        let mut metadata = Metadata::new();
        metadata.insert("examined".into(), MetadataValue::Int(summary.examined as i64));
        metadata.insert(
            "transitioned".into(),
            MetadataValue::Int(summary.transitioned as i64),
        );
        metadata.insert("skipped".into(), MetadataValue::Int(summary.skipped as i64));
        metadata.insert("failed".into(), MetadataValue::Int(summary.failed as i64));
        self.bus.emit_now(
            self.clock.now_ms(),
            COMPONENT,
            "vectordb_scheduler_tick",
            if summary.failed == 0 {
                EventStatus::Ok
            } else {
                EventStatus::Degraded
            },
            metadata,
        );
        summary
    }

    /// Try to train the codebook backing `target_tier` from stored data.
    /// Returns false when there is not enough data yet.
    fn try_train(&self, target_tier: CompressionTier) -> Result<bool> {
        let centroids = match target_tier {
            CompressionTier::Cool => CENTROIDS_PQ8,
            CompressionTier::Cold => CENTROIDS_PQ4,
            _ => return Ok(true),
        };
        let sample = self.training_sample();
        if sample.len() < self.config.min_training_size {
            return Ok(false);
        }
        let dim = self.store.dim();
        let codebook = PqCodebook::train(
            &sample,
            dim,
            pq_subvectors(dim),
            centroids,
            self.config.kmeans_iterations,
            self.pq_seed,
        )?;
        let index = self.codecs.install_codebook(codebook.clone())?;
        if let Some(dir) = &self.codebook_dir {
            codebook.save(dir, index as usize)?;
        }
        info!(
            target: "engram.compress::manager",
            tier = ?target_tier,
            index,
            sample = sample.len(),
            "trained codebook"
        );
        Ok(true)
    }

    fn training_sample(&self) -> Vec<Vec<f32>> {
        let cap = self.config.min_training_size * 4;
        self.store
            .iterate()
            .take(cap)
            .filter_map(|id| self.store.decode_silently(&id).ok())
            .collect()
    }

    fn emit_transition(&self, id: &VectorId, from: CompressionTier, to: CompressionTier) {
        let mut metadata = Metadata::new();
        metadata.insert("id".into(), MetadataValue::Text(id.to_string()));
        metadata.insert("from".into(), MetadataValue::Text(format!("{from:?}")));
        metadata.insert("to".into(), MetadataValue::Text(format!("{to:?}")));
        self.bus.emit_now(
            self.clock.now_ms(),
            COMPONENT,
            "vectordb_tier_transition",
            EventStatus::Ok,
            metadata,
        );
    }

    #[must_use]
    pub fn transition_count(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }
}

/// Largest subvector count ≤ the canonical 96 that divides `dim` evenly.
fn pq_subvectors(dim: usize) -> usize {
    (1..=engram_types::tier::PQ_SUBVECTORS.min(dim))
        .rev()
        .find(|n| dim % n == 0)
        .unwrap_or(1)
}

/// Background scheduler thread; dropping the guard stops it.
pub struct SchedulerGuard {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl SchedulerGuard {
    /// Run `manager.tick()` every `interval`; the first tick happens after
    /// one full interval.
    #[must_use]
    pub fn start(manager: Arc<CompressionManager>, interval: Duration) -> Self {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("engram-compression-scheduler".to_string())
            .spawn(move || {
                let (lock, condvar) = &*thread_stop;
                loop {
                    let mut stopped = lock.lock();
                    if *stopped {
                        return;
                    }
                    let timed_out = condvar.wait_for(&mut stopped, interval).timed_out();
                    if *stopped {
                        return;
                    }
                    drop(stopped);
                    if timed_out {
                        let _ = manager.tick();
                    }
                }
            })
            .expect("spawn scheduler thread");
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Signal the thread and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        let (lock, condvar) = &*self.stop;
        *lock.lock() = true;
        condvar.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SchedulerGuard {
    fn drop(&mut self) {
        self.stop_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_types::{HeatConfig, ManualClock, NORMALIZATION_TOLERANCE};
    use engram_vector::{AccessSink, SearchOptions};

    struct Rig {
        store: Arc<VectorStore>,
        manager: CompressionManager,
        clock: Arc<ManualClock>,
        bus: EventBus,
    }

    fn rig(dim: usize) -> Rig {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let heat = Arc::new(HeatTracker::new(HeatConfig::default(), clock.clone()));
        let codecs = Arc::new(TierCodecs::new(dim, CompressionConfig::default()));
        let store = Arc::new(VectorStore::with_parts(
            dim,
            NORMALIZATION_TOLERANCE,
            codecs.clone(),
            None,
            heat.clone(),
            clock.clone(),
        ));
        let bus = EventBus::new(64);
        let manager = CompressionManager::new(
            store.clone(),
            codecs,
            heat,
            CompressionConfig::default(),
            clock.clone(),
            bus.clone(),
            None,
        );
        Rig {
            store,
            manager,
            clock,
            bus,
        }
    }

    fn seeded_vector(dim: usize, seed: usize) -> Vec<f32> {
        let raw: Vec<f32> = (0..dim)
            .map(|j| (((seed * 37 + j * 11) % 89) as f32 / 89.0) - 0.5)
            .collect();
        engram_vector::l2_normalize(&raw).unwrap()
    }

    #[test]
    fn hot_to_warm_preserves_vector_within_bound() {
        let r = rig(32);
        let id = VectorId::from("v");
        let original = seeded_vector(32, 1);
        r.store
            .insert(id.clone(), original.clone(), Metadata::new())
            .unwrap();

        let outcome = r.manager.transition(&id, CompressionTier::Warm).unwrap();
        assert_eq!(outcome, TransitionOutcome::Applied);
        assert_eq!(r.store.tier_of(&id).unwrap(), CompressionTier::Warm);

        let record = r.manager.get(&id).unwrap();
        let mean_err: f32 = original
            .iter()
            .zip(record.vector.iter())
            .map(|(a, b)| (a - b).abs())
            .sum::<f32>()
            / 32.0;
        assert!(mean_err <= CompressionTier::Warm.max_reconstruction_error());
    }

    #[test]
    fn backward_transition_is_rejected() {
        let r = rig(32);
        let id = VectorId::from("v");
        r.store
            .insert(id.clone(), seeded_vector(32, 2), Metadata::new())
            .unwrap();
        r.manager.transition(&id, CompressionTier::Warm).unwrap();
        let err = r.manager.transition(&id, CompressionTier::Hot).unwrap_err();
        assert!(matches!(err, EngramError::TierTransitionBackward { .. }));
        assert_eq!(r.store.tier_of(&id).unwrap(), CompressionTier::Warm);
    }

    #[test]
    fn pq_transition_skips_until_enough_training_data() {
        let r = rig(32);
        let id = VectorId::from("v");
        r.store
            .insert(id.clone(), seeded_vector(32, 3), Metadata::new())
            .unwrap();
        r.manager.transition(&id, CompressionTier::Warm).unwrap();

        // One stored vector is far below min_training_size.
        let outcome = r.manager.transition(&id, CompressionTier::Cool).unwrap();
        assert_eq!(outcome, TransitionOutcome::Skipped);
        assert_eq!(r.store.tier_of(&id).unwrap(), CompressionTier::Warm);
    }

    #[test]
    fn pq_transition_trains_once_data_arrives() {
        let r = rig(32);
        for i in 0..300 {
            r.store
                .insert(
                    VectorId::from(format!("v{i}")),
                    seeded_vector(32, i),
                    Metadata::new(),
                )
                .unwrap();
        }
        let id = VectorId::from("v0");
        r.manager.transition(&id, CompressionTier::Warm).unwrap();
        let outcome = r.manager.transition(&id, CompressionTier::Cool).unwrap();
        assert_eq!(outcome, TransitionOutcome::Applied);
        assert_eq!(r.store.tier_of(&id).unwrap(), CompressionTier::Cool);

        // Reads keep working through the PQ decode path.
        let record = r.manager.get(&id).unwrap();
        assert_eq!(record.vector.len(), 32);
    }

    #[test]
    fn scheduler_tick_migrates_idle_vectors_only() {
        let r = rig(32);
        for i in 0..10 {
            r.store
                .insert(
                    VectorId::from(format!("v{i}")),
                    seeded_vector(32, i),
                    Metadata::new(),
                )
                .unwrap();
        }
        // Simulate one hour of continuous access to v0..v4.
        let hour_ms = 60 * 60 * 1000;
        let step = hour_ms / 60;
        for _minute in 0..60 {
            r.clock.advance(step);
            for i in 0..5 {
                let _ = r.store.get(&VectorId::from(format!("v{i}"))).unwrap();
            }
        }

        let summary = r.manager.tick();
        assert_eq!(summary.examined, 10);
        assert_eq!(summary.transitioned, 5, "idle half migrates");
        for i in 0..5 {
            assert_eq!(
                r.store.tier_of(&VectorId::from(format!("v{i}"))).unwrap(),
                CompressionTier::Hot,
                "busy vector v{i} must stay Hot"
            );
        }
        for i in 5..10 {
            assert_eq!(
                r.store.tier_of(&VectorId::from(format!("v{i}"))).unwrap(),
                CompressionTier::Warm,
                "idle vector v{i} must cool to Warm"
            );
        }
        let expected_bytes = 5 * 32 * 4 + 5 * 32 * 2;
        assert_eq!(r.store.stats().payload_bytes, expected_bytes);
    }

    #[test]
    fn transition_emits_bus_event() {
        let r = rig(32);
        let id = VectorId::from("v");
        r.store
            .insert(id.clone(), seeded_vector(32, 5), Metadata::new())
            .unwrap();
        let _ = r.bus.drain(64);
        r.manager.transition(&id, CompressionTier::Warm).unwrap();
        let events = r.bus.drain(64);
        assert!(
            events
                .iter()
                .any(|e| e.operation == "vectordb_tier_transition"),
            "expected a tier-transition event"
        );
    }

    #[test]
    fn search_still_works_after_cooling() {
        let r = rig(32);
        for i in 0..10 {
            r.store
                .insert(
                    VectorId::from(format!("v{i}")),
                    seeded_vector(32, i),
                    Metadata::new(),
                )
                .unwrap();
        }
        r.manager
            .transition(&VectorId::from("v3"), CompressionTier::Warm)
            .unwrap();
        let query = seeded_vector(32, 3);
        let hits = r.store.search(&query, 1, &SearchOptions::default()).unwrap();
        assert_eq!(hits[0].id, VectorId::from("v3"));
    }

    #[test]
    fn heat_tracker_mirrors_store_tier() {
        let r = rig(32);
        let id = VectorId::from("v");
        r.store
            .insert(id.clone(), seeded_vector(32, 8), Metadata::new())
            .unwrap();
        r.manager.transition(&id, CompressionTier::Warm).unwrap();
        // The tracker's record must agree with the store.
        let heat = Arc::new(HeatTracker::new(
            HeatConfig::default(),
            r.clock.clone() as Arc<dyn Clock>,
        ));
        heat.on_insert(&id, r.store.tier_of(&id).unwrap(), r.clock.now_ms());
        assert_eq!(heat.record_of(&id).unwrap().tier, CompressionTier::Warm);
    }
}
