//! The vector store (record table + kNN).
//!
//! Multi-reader single-writer internally; the record table owns all vector
//! bytes. An optional [`VectorIndex`] accelerates search but holds ids only
//! and resolves vectors back through the store. Tier swaps are atomic: a
//! reader observes either the old record or the new one, never a torn
//! payload.

use std::collections::HashMap;
use std::sync::Arc;

use engram_error::{EngramError, Result};
use engram_types::{
    Clock, CompressionTier, DistanceMetric, Metadata, SystemClock, VectorCodec, VectorId,
};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::distance;
use crate::validate;

/// Norm drift beyond which a decoded payload is flagged (non-fatal).
const NORM_RECHECK_TOLERANCE: f32 = 0.2;

/// Oversampling factor when an index search is post-filtered.
const FILTER_OVERSAMPLE: usize = 4;

/// Encoded vector bytes plus the codec that produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPayload {
    pub codec: VectorCodec,
    pub bytes: Vec<u8>,
    /// Codebook index for PQ codecs.
    pub codebook: Option<u32>,
}

impl StoredPayload {
    /// Encode a float32 vector verbatim (the Hot tier representation).
    #[must_use]
    pub fn from_f32(vector: &[f32]) -> Self {
        let mut bytes = Vec::with_capacity(vector.len() * 4);
        for x in vector {
            bytes.extend_from_slice(&x.to_le_bytes());
        }
        Self {
            codec: VectorCodec::F32,
            bytes,
            codebook: None,
        }
    }

    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }
}

/// Decodes stored payloads back to float32.
pub trait PayloadCodec: Send + Sync {
    fn decode(&self, payload: &StoredPayload, dim: usize) -> Result<Vec<f32>>;
}

/// Codec that understands only the float32 representation. The compression
/// crate supplies the full tier-aware codec.
pub struct PlainCodec;

impl PayloadCodec for PlainCodec {
    fn decode(&self, payload: &StoredPayload, dim: usize) -> Result<Vec<f32>> {
        if payload.codec != VectorCodec::F32 {
            return Err(EngramError::CodecNotTrained {
                tier: CompressionTier::Hot,
                have: 0,
                need: 0,
            });
        }
        decode_f32(&payload.bytes, dim)
    }
}

/// Little-endian f32 payload decode shared by codecs.
pub fn decode_f32(bytes: &[u8], dim: usize) -> Result<Vec<f32>> {
    if bytes.len() != dim * 4 {
        return Err(EngramError::DimensionMismatch {
            expected: dim * 4,
            actual: bytes.len(),
        });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Receives access notifications for the heat model.
pub trait AccessSink: Send + Sync {
    fn on_insert(&self, id: &VectorId, tier: CompressionTier, now_ms: u64);
    fn record_access(&self, id: &VectorId, tier: CompressionTier, now_ms: u64);
    fn on_delete(&self, id: &VectorId);
}

pub struct NoOpAccessSink;

impl AccessSink for NoOpAccessSink {
    #[inline(always)]
    fn on_insert(&self, _id: &VectorId, _tier: CompressionTier, _now_ms: u64) {}
    #[inline(always)]
    fn record_access(&self, _id: &VectorId, _tier: CompressionTier, _now_ms: u64) {}
    #[inline(always)]
    fn on_delete(&self, _id: &VectorId) {}
}

/// Resolves an id to its decoded float32 vector.
pub trait VectorResolver: Sync {
    fn resolve(&self, id: &VectorId) -> Option<Vec<f32>>;
}

/// Sub-linear search backend. Implementations hold ids, never vector bytes.
pub trait VectorIndex: Send + Sync {
    fn metric(&self) -> DistanceMetric;
    fn insert(&self, id: &VectorId, vector: &[f32], resolver: &dyn VectorResolver) -> Result<()>;
    fn remove(&self, id: &VectorId);
    /// Returns `(id, similarity)` pairs, best first.
    fn search(
        &self,
        query: &[f32],
        k: usize,
        resolver: &dyn VectorResolver,
    ) -> Result<Vec<(VectorId, f32)>>;
}

/// A decoded record as returned by `get`.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub id: VectorId,
    pub vector: Vec<f32>,
    pub metadata: Metadata,
    pub tier: CompressionTier,
    pub created_at: u64,
    pub updated_at: u64,
}

/// One search result.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: VectorId,
    pub score: f32,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Search knobs; `filter` post-filters by metadata.
#[derive(Default)]
pub struct SearchOptions<'a> {
    pub metric: DistanceMetric,
    pub filter: Option<&'a (dyn Fn(&Metadata) -> bool + Sync)>,
}

pub(crate) struct Slot {
    pub(crate) payload: StoredPayload,
    pub(crate) metadata: Metadata,
    pub(crate) tier: CompressionTier,
    pub(crate) created_at: u64,
    pub(crate) updated_at: u64,
}

/// Per-tier record counts and byte totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    pub count: usize,
    pub payload_bytes: usize,
    pub per_tier: Vec<(CompressionTier, usize)>,
}

pub struct VectorStore {
    dim: usize,
    tolerance: f32,
    records: RwLock<HashMap<VectorId, Slot>>,
    codec: Arc<dyn PayloadCodec>,
    index: Option<Arc<dyn VectorIndex>>,
    access: Arc<dyn AccessSink>,
    clock: Arc<dyn Clock>,
}

struct ResolverView<'a> {
    store: &'a VectorStore,
}

impl VectorResolver for ResolverView<'_> {
    fn resolve(&self, id: &VectorId) -> Option<Vec<f32>> {
        let records = self.store.records.read();
        let slot = records.get(id)?;
        self.store.codec.decode(&slot.payload, self.store.dim).ok()
    }
}

impl VectorStore {
    /// Flat-scan store with the plain float32 codec.
    #[must_use]
    pub fn new(dim: usize, tolerance: f32) -> Self {
        Self::with_parts(
            dim,
            tolerance,
            Arc::new(PlainCodec),
            None,
            Arc::new(NoOpAccessSink),
            Arc::new(SystemClock),
        )
    }

    /// Fully wired constructor; backend selection happens here.
    #[must_use]
    pub fn with_parts(
        dim: usize,
        tolerance: f32,
        codec: Arc<dyn PayloadCodec>,
        index: Option<Arc<dyn VectorIndex>>,
        access: Arc<dyn AccessSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            dim,
            tolerance,
            records: RwLock::new(HashMap::new()),
            codec,
            index,
            access,
            clock,
        }
    }

    #[inline]
    #[must_use]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Insert a new record. Fails on duplicates.
    pub fn insert(&self, id: VectorId, vector: Vec<f32>, metadata: Metadata) -> Result<()> {
        validate::ensure_query(&id, &vector, self.dim, self.tolerance)?;
        let now = self.clock.now_ms();
        {
            let mut records = self.records.write();
            if records.contains_key(&id) {
                return Err(EngramError::DuplicateId(id.to_string()));
            }
            records.insert(
                id.clone(),
                Slot {
                    payload: StoredPayload::from_f32(&vector),
                    metadata,
                    tier: CompressionTier::Hot,
                    created_at: now,
                    updated_at: now,
                },
            );
        }
        if let Some(index) = &self.index {
            let resolver = ResolverView { store: self };
            if let Err(err) = index.insert(&id, &vector, &resolver) {
                // Keep the table and the index consistent on failure.
                let _ = self.records.write().remove(&id);
                return Err(err);
            }
        }
        self.access.on_insert(&id, CompressionTier::Hot, now);
        Ok(())
    }

    /// Insert or replace; replacement resets the tier to Hot.
    pub fn upsert(&self, id: VectorId, vector: Vec<f32>, metadata: Metadata) -> Result<UpsertOutcome> {
        validate::ensure_query(&id, &vector, self.dim, self.tolerance)?;
        let now = self.clock.now_ms();
        let outcome = {
            let mut records = self.records.write();
            match records.get_mut(&id) {
                Some(slot) => {
                    slot.payload = StoredPayload::from_f32(&vector);
                    slot.metadata = metadata;
                    slot.tier = CompressionTier::Hot;
                    slot.updated_at = now;
                    UpsertOutcome::Updated
                }
                None => {
                    records.insert(
                        id.clone(),
                        Slot {
                            payload: StoredPayload::from_f32(&vector),
                            metadata,
                            tier: CompressionTier::Hot,
                            created_at: now,
                            updated_at: now,
                        },
                    );
                    UpsertOutcome::Inserted
                }
            }
        };
        if let Some(index) = &self.index {
            let resolver = ResolverView { store: self };
            if outcome == UpsertOutcome::Updated {
                index.remove(&id);
            }
            index.insert(&id, &vector, &resolver)?;
        }
        match outcome {
            UpsertOutcome::Inserted => self.access.on_insert(&id, CompressionTier::Hot, now),
            UpsertOutcome::Updated => self.access.record_access(&id, CompressionTier::Hot, now),
        }
        Ok(outcome)
    }

    /// Batched insert: validates everything first, then takes the writer
    /// slot once for the whole batch.
    pub fn insert_batch(&self, entries: Vec<(VectorId, Vec<f32>, Metadata)>) -> Result<usize> {
        for (id, vector, _) in &entries {
            validate::ensure_query(id, vector, self.dim, self.tolerance)?;
        }
        let now = self.clock.now_ms();
        {
            let records = self.records.read();
            if let Some((id, _, _)) = entries.iter().find(|(id, _, _)| records.contains_key(id)) {
                return Err(EngramError::DuplicateId(id.to_string()));
            }
        }
        let inserted = entries.len();
        {
            let mut records = self.records.write();
            for (id, vector, metadata) in &entries {
                records.insert(
                    id.clone(),
                    Slot {
                        payload: StoredPayload::from_f32(vector),
                        metadata: metadata.clone(),
                        tier: CompressionTier::Hot,
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
        }
        if let Some(index) = &self.index {
            let resolver = ResolverView { store: self };
            for (id, vector, _) in &entries {
                index.insert(id, vector, &resolver)?;
            }
        }
        for (id, _, _) in &entries {
            self.access.on_insert(id, CompressionTier::Hot, now);
        }
        Ok(inserted)
    }

    /// Fetch and decode one record; notifies the access sink.
    pub fn get(&self, id: &VectorId) -> Result<VectorRecord> {
        let (record, tier) = {
            let records = self.records.read();
            let slot = records
                .get(id)
                .ok_or_else(|| EngramError::NotFound(id.to_string()))?;
            let vector = self.codec.decode(&slot.payload, self.dim)?;
            (
                VectorRecord {
                    id: id.clone(),
                    vector,
                    metadata: slot.metadata.clone(),
                    tier: slot.tier,
                    created_at: slot.created_at,
                    updated_at: slot.updated_at,
                },
                slot.tier,
            )
        };
        if record.tier != CompressionTier::Hot {
            let norm = validate::l2_norm(&record.vector);
            if (norm - 1.0).abs() > NORM_RECHECK_TOLERANCE {
                // Reconstruction drift is logged, not raised: the caller
                // still gets the best available decode.
                warn!(
                    target: "engram.vector::store",
                    id = %record.id,
                    tier = ?record.tier,
                    norm,
                    "reconstruction quality outside re-check tolerance"
                );
            }
        }
        self.access.record_access(id, tier, self.clock.now_ms());
        Ok(record)
    }

    /// Remove a record. Returns whether it existed.
    pub fn delete(&self, id: &VectorId) -> bool {
        let existed = self.records.write().remove(id).is_some();
        if existed {
            if let Some(index) = &self.index {
                index.remove(id);
            }
            self.access.on_delete(id);
        }
        existed
    }

    /// kNN search. Empty store yields an empty list; a malformed query
    /// fails fast and is never silently normalized.
    pub fn search(&self, query: &[f32], k: usize, options: &SearchOptions<'_>) -> Result<Vec<SearchHit>> {
        let query_id = VectorId::from("query");
        validate::ensure_query(&query_id, query, self.dim, self.tolerance)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        if let Some(index) = &self.index {
            if index.metric() == options.metric {
                return self.search_via_index(index.as_ref(), query, k, options);
            }
            debug!(
                target: "engram.vector::store",
                index_metric = index.metric().as_str(),
                requested = options.metric.as_str(),
                "metric mismatch, falling back to flat scan"
            );
        }
        Ok(self.search_flat(query, k, options))
    }

    fn search_via_index(
        &self,
        index: &dyn VectorIndex,
        query: &[f32],
        k: usize,
        options: &SearchOptions<'_>,
    ) -> Result<Vec<SearchHit>> {
        let fetch = if options.filter.is_some() {
            k.saturating_mul(FILTER_OVERSAMPLE)
        } else {
            k
        };
        let resolver = ResolverView { store: self };
        let ranked = index.search(query, fetch, &resolver)?;
        let records = self.records.read();
        let mut hits = Vec::with_capacity(k);
        for (id, score) in ranked {
            let Some(slot) = records.get(&id) else {
                continue;
            };
            if options.filter.is_some_and(|keep| !keep(&slot.metadata)) {
                continue;
            }
            hits.push(SearchHit {
                id,
                score,
                metadata: slot.metadata.clone(),
            });
            if hits.len() == k {
                break;
            }
        }
        Ok(hits)
    }

    fn search_flat(&self, query: &[f32], k: usize, options: &SearchOptions<'_>) -> Vec<SearchHit> {
        let records = self.records.read();
        let mut scored: Vec<SearchHit> = records
            .iter()
            .filter(|(_, slot)| options.filter.is_none_or(|keep| keep(&slot.metadata)))
            .filter_map(|(id, slot)| {
                let vector = self.codec.decode(&slot.payload, self.dim).ok()?;
                Some(SearchHit {
                    id: id.clone(),
                    score: distance::similarity(options.metric, query, &vector),
                    metadata: slot.metadata.clone(),
                })
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(k);
        scored
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.records.read().len()
    }

    /// Snapshot of all ids, in unspecified order.
    pub fn iterate(&self) -> impl Iterator<Item = VectorId> + use<> {
        let ids: Vec<VectorId> = self.records.read().keys().cloned().collect();
        ids.into_iter()
    }

    /// Current tier of a record.
    pub fn tier_of(&self, id: &VectorId) -> Result<CompressionTier> {
        self.records
            .read()
            .get(id)
            .map(|slot| slot.tier)
            .ok_or_else(|| EngramError::NotFound(id.to_string()))
    }

    /// Clone of the raw stored payload, for the compression manager.
    pub fn encoded_payload(&self, id: &VectorId) -> Result<(StoredPayload, CompressionTier)> {
        self.records
            .read()
            .get(id)
            .map(|slot| (slot.payload.clone(), slot.tier))
            .ok_or_else(|| EngramError::NotFound(id.to_string()))
    }

    /// Atomically replace a record's payload and tier.
    ///
    /// Only strictly-forward tier moves are accepted; on failure the record
    /// is untouched.
    pub fn swap_payload(
        &self,
        id: &VectorId,
        target_tier: CompressionTier,
        payload: StoredPayload,
    ) -> Result<()> {
        let mut records = self.records.write();
        let slot = records
            .get_mut(id)
            .ok_or_else(|| EngramError::NotFound(id.to_string()))?;
        if !slot.tier.is_forward_to(target_tier) {
            return Err(EngramError::TierTransitionBackward {
                from: slot.tier,
                to: target_tier,
            });
        }
        slot.payload = payload;
        slot.tier = target_tier;
        Ok(())
    }

    /// Decode a record without touching access bookkeeping (manager read).
    pub fn decode_silently(&self, id: &VectorId) -> Result<Vec<f32>> {
        let records = self.records.read();
        let slot = records
            .get(id)
            .ok_or_else(|| EngramError::NotFound(id.to_string()))?;
        self.codec.decode(&slot.payload, self.dim)
    }

    /// Metadata clone without decoding the payload.
    pub fn metadata_of(&self, id: &VectorId) -> Result<Metadata> {
        self.records
            .read()
            .get(id)
            .map(|slot| slot.metadata.clone())
            .ok_or_else(|| EngramError::NotFound(id.to_string()))
    }

    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let records = self.records.read();
        let mut per_tier: Vec<(CompressionTier, usize)> = CompressionTier::ALL
            .iter()
            .map(|&tier| (tier, 0usize))
            .collect();
        let mut payload_bytes = 0usize;
        for slot in records.values() {
            payload_bytes += slot.payload.byte_len();
            per_tier[slot.tier.index()].1 += 1;
        }
        StoreStats {
            count: records.len(),
            payload_bytes,
            per_tier,
        }
    }

    pub(crate) fn raw_slots(&self) -> &RwLock<HashMap<VectorId, Slot>> {
        &self.records
    }

    pub(crate) fn restore_slot(&self, id: VectorId, slot: Slot) {
        self.records.write().insert(id, slot);
    }
}
