//! Access-heat tracking.
//!
//! One [`AccessRecord`] per stored vector: a 24-hour ring of access
//! timestamps plus a lazily recomputed heat score in [0, 1],
//! `heat = α·recency + (1−α)·frequency`. Recency decays exponentially on
//! the configured half-life; frequency saturates at a configured access
//! count inside the window. The tracker is the store's access sink.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use engram_error::{EngramError, Result};
use engram_types::{Clock, CompressionTier, HeatConfig, VectorId};
use engram_vector::AccessSink;
use parking_lot::Mutex;

/// Heat bookkeeping for one vector.
#[derive(Debug, Clone)]
pub struct AccessRecord {
    pub vector_id: VectorId,
    /// Mirrors the store's current tier for this id.
    pub tier: CompressionTier,
    /// Access timestamps inside the sliding window, oldest first.
    pub access_timestamps: VecDeque<u64>,
    pub total_accesses: u64,
    pub heat_score: f32,
    pub last_access: u64,
    pub created_at: u64,
}

impl AccessRecord {
    fn new(vector_id: VectorId, tier: CompressionTier, now_ms: u64) -> Self {
        Self {
            vector_id,
            tier,
            access_timestamps: VecDeque::new(),
            total_accesses: 0,
            heat_score: 1.0,
            last_access: now_ms,
            created_at: now_ms,
        }
    }

    fn trim_window(&mut self, now_ms: u64, window_ms: u64) {
        let horizon = now_ms.saturating_sub(window_ms);
        while self
            .access_timestamps
            .front()
            .is_some_and(|&ts| ts < horizon)
        {
            let _ = self.access_timestamps.pop_front();
        }
    }

    fn recompute(&mut self, now_ms: u64, config: &HeatConfig) {
        self.trim_window(now_ms, config.window_ms);
        let age = now_ms.saturating_sub(self.last_access) as f64;
        let recency = 0.5f64.powf(age / config.half_life_ms.max(1) as f64) as f32;
        let frequency = (self.access_timestamps.len() as f32
            / config.frequency_saturation.max(1) as f32)
            .min(1.0);
        self.heat_score = (config.alpha * recency + (1.0 - config.alpha) * frequency).clamp(0.0, 1.0);
    }
}

/// Tracks heat for every stored vector; internally synchronized.
pub struct HeatTracker {
    config: HeatConfig,
    clock: Arc<dyn Clock>,
    records: Mutex<HashMap<VectorId, AccessRecord>>,
}

impl HeatTracker {
    #[must_use]
    pub fn new(config: HeatConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Lazily recomputed heat for one id.
    pub fn heat_of(&self, id: &VectorId) -> Result<f32> {
        let now = self.clock.now_ms();
        let mut records = self.records.lock();
        let record = records
            .get_mut(id)
            .ok_or_else(|| EngramError::NotFound(id.to_string()))?;
        record.recompute(now, &self.config);
        Ok(record.heat_score)
    }

    /// Snapshot of one record.
    pub fn record_of(&self, id: &VectorId) -> Result<AccessRecord> {
        let now = self.clock.now_ms();
        let mut records = self.records.lock();
        let record = records
            .get_mut(id)
            .ok_or_else(|| EngramError::NotFound(id.to_string()))?;
        record.recompute(now, &self.config);
        Ok(record.clone())
    }

    /// Mirror a committed tier transition.
    pub fn set_tier(&self, id: &VectorId, tier: CompressionTier) {
        if let Some(record) = self.records.lock().get_mut(id) {
            record.tier = tier;
        }
    }

    /// All records with freshly recomputed heat, coldest first — the
    /// scheduler's worklist.
    #[must_use]
    pub fn coldest_first(&self) -> Vec<(VectorId, f32, CompressionTier)> {
        let now = self.clock.now_ms();
        let mut records = self.records.lock();
        let mut out: Vec<(VectorId, f32, CompressionTier)> = records
            .values_mut()
            .map(|record| {
                record.recompute(now, &self.config);
                (record.vector_id.clone(), record.heat_score, record.tier)
            })
            .collect();
        out.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        out
    }

    #[must_use]
    pub fn tracked(&self) -> usize {
        self.records.lock().len()
    }
}

impl AccessSink for HeatTracker {
    fn on_insert(&self, id: &VectorId, tier: CompressionTier, now_ms: u64) {
        let mut records = self.records.lock();
        let record = records
            .entry(id.clone())
            .or_insert_with(|| AccessRecord::new(id.clone(), tier, now_ms));
        record.tier = tier;
    }

    fn record_access(&self, id: &VectorId, tier: CompressionTier, now_ms: u64) {
        let mut records = self.records.lock();
        let record = records
            .entry(id.clone())
            .or_insert_with(|| AccessRecord::new(id.clone(), tier, now_ms));
        record.tier = tier;
        record.access_timestamps.push_back(now_ms);
        record.total_accesses += 1;
        record.last_access = now_ms;
        record.recompute(now_ms, &self.config);
    }

    fn on_delete(&self, id: &VectorId) {
        let _ = self.records.lock().remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_types::ManualClock;

    fn tracker(start_ms: u64) -> (HeatTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start_ms));
        let tracker = HeatTracker::new(HeatConfig::default(), clock.clone());
        (tracker, clock)
    }

    #[test]
    fn fresh_access_is_hot() {
        let (tracker, _clock) = tracker(1_000_000);
        let id = VectorId::from("v");
        tracker.record_access(&id, CompressionTier::Hot, 1_000_000);
        let heat = tracker.heat_of(&id).unwrap();
        assert!(heat >= 0.6, "fresh access should carry full recency, got {heat}");
    }

    #[test]
    fn heat_decays_on_the_half_life() {
        let (tracker, clock) = tracker(0);
        let id = VectorId::from("v");
        tracker.record_access(&id, CompressionTier::Hot, 0);
        let hot = tracker.heat_of(&id).unwrap();

        // One half-life later the recency term halves.
        clock.advance(HeatConfig::default().half_life_ms);
        let cooler = tracker.heat_of(&id).unwrap();
        assert!(cooler < hot);

        // Far outside the window, both terms are ~0.
        clock.advance(HeatConfig::default().window_ms * 4);
        let cold = tracker.heat_of(&id).unwrap();
        assert!(cold < CompressionTier::Hot.min_heat_score());
        assert!(cold < 0.05, "idle vector should be frozen-cold, got {cold}");
    }

    #[test]
    fn window_trims_old_timestamps() {
        let (tracker, clock) = tracker(0);
        let id = VectorId::from("v");
        for i in 0..10 {
            tracker.record_access(&id, CompressionTier::Hot, i * 1000);
        }
        clock.set(HeatConfig::default().window_ms + 20_000);
        let _ = tracker.heat_of(&id).unwrap();
        let record = tracker.record_of(&id).unwrap();
        assert!(record.access_timestamps.is_empty());
        assert_eq!(record.total_accesses, 10, "lifetime counter is not windowed");
    }

    #[test]
    fn coldest_first_sorts_ascending() {
        let (tracker, clock) = tracker(0);
        tracker.record_access(&VectorId::from("idle"), CompressionTier::Hot, 0);
        clock.set(HeatConfig::default().half_life_ms * 3);
        tracker.record_access(
            &VectorId::from("busy"),
            CompressionTier::Hot,
            clock.now_ms(),
        );
        let order = tracker.coldest_first();
        assert_eq!(order[0].0, VectorId::from("idle"));
        assert_eq!(order[1].0, VectorId::from("busy"));
        assert!(order[0].1 <= order[1].1);
    }

    #[test]
    fn delete_drops_the_record() {
        let (tracker, _clock) = tracker(0);
        let id = VectorId::from("v");
        tracker.record_access(&id, CompressionTier::Hot, 0);
        tracker.on_delete(&id);
        assert!(matches!(
            tracker.heat_of(&id).unwrap_err(),
            EngramError::NotFound(_)
        ));
    }
}
