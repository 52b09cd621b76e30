//! HNSW index over vector-store ids.
//!
//! Layered navigable small-world graph: node levels are sampled from a
//! geometric distribution with parameter `1/ln(M)`, inserts greedy-descend
//! from the entry point and link bidirectionally at every layer, and
//! neighbor lists are pruned with a diversity-aware heuristic. Deletions
//! are tombstones; a periodic [`HnswIndex::rebuild`] is maintenance, not a
//! correctness requirement. The index never stores vector bytes — every
//! distance resolves through the store.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use engram_error::{EngramError, Result};
use engram_types::{DistanceMetric, HnswConfig, VectorId};
use engram_vector::distance;
use engram_vector::{VectorIndex, VectorResolver};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

const DEFAULT_SEED: u64 = 0x484E_5357;

/// Max-heap entry ordered farthest-first.
#[derive(PartialEq)]
struct Far {
    id: VectorId,
    dist: f32,
}

impl Eq for Far {}

impl Ord for Far {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist.partial_cmp(&other.dist).unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Far {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap entry ordered nearest-first (inverted comparison).
#[derive(PartialEq)]
struct Near {
    id: VectorId,
    dist: f32,
}

impl Eq for Near {}

impl Ord for Near {
    fn cmp(&self, other: &Self) -> Ordering {
        other.dist.partial_cmp(&self.dist).unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Near {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Node {
    /// One neighbor list per layer, index 0 is the bottom layer.
    neighbors: Vec<Vec<VectorId>>,
    tombstone: bool,
}

impl Node {
    fn level(&self) -> usize {
        self.neighbors.len() - 1
    }
}

struct Inner {
    nodes: HashMap<VectorId, Node>,
    entry_point: Option<VectorId>,
    max_level: usize,
    rng: StdRng,
    tombstones: usize,
}

/// Cache of resolved vectors for the duration of one operation.
struct Resolved<'a> {
    resolver: &'a dyn VectorResolver,
    cache: HashMap<VectorId, Option<Vec<f32>>>,
}

impl<'a> Resolved<'a> {
    fn new(resolver: &'a dyn VectorResolver) -> Self {
        Self {
            resolver,
            cache: HashMap::new(),
        }
    }

    fn get(&mut self, id: &VectorId) -> Option<&[f32]> {
        if !self.cache.contains_key(id) {
            let fetched = self.resolver.resolve(id);
            self.cache.insert(id.clone(), fetched);
        }
        self.cache.get(id).and_then(|v| v.as_deref())
    }
}

pub struct HnswIndex {
    metric: DistanceMetric,
    m: usize,
    m_max0: usize,
    ef_construction: usize,
    ef_search: usize,
    level_mult: f64,
    inner: RwLock<Inner>,
}

impl HnswIndex {
    #[must_use]
    pub fn new(metric: DistanceMetric, config: &HnswConfig) -> Self {
        Self::with_seed(metric, config, DEFAULT_SEED)
    }

    /// Deterministic construction for reproducible builds and tests.
    #[must_use]
    pub fn with_seed(metric: DistanceMetric, config: &HnswConfig, seed: u64) -> Self {
        assert!(config.m >= 2, "M must be at least 2");
        Self {
            metric,
            m: config.m,
            m_max0: config.m * 2,
            ef_construction: config.ef_construction.max(config.m),
            ef_search: config.ef_search.max(1),
            level_mult: 1.0 / (config.m as f64).ln(),
            inner: RwLock::new(Inner {
                nodes: HashMap::new(),
                entry_point: None,
                max_level: 0,
                rng: StdRng::seed_from_u64(seed),
                tombstones: 0,
            }),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.inner.read();
        inner.nodes.len() - inner.tombstones
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn tombstone_count(&self) -> usize {
        self.inner.read().tombstones
    }

    fn dist(&self, a: &[f32], b: &[f32]) -> f32 {
        distance::distance(self.metric, a, b)
    }

    fn sample_level(rng: &mut StdRng, level_mult: f64) -> usize {
        let r: f64 = rng.r#gen::<f64>().max(f64::MIN_POSITIVE);
        (-r.ln() * level_mult).floor() as usize
    }

    /// Greedy descent toward `query` along `layer`, starting at `start`.
    fn greedy_step(
        &self,
        inner: &Inner,
        resolved: &mut Resolved<'_>,
        query: &[f32],
        start: (VectorId, f32),
        layer: usize,
    ) -> (VectorId, f32) {
        let (mut current, mut current_dist) = start;
        loop {
            let mut improved = false;
            let neighbors: Vec<VectorId> = inner
                .nodes
                .get(&current)
                .and_then(|node| node.neighbors.get(layer))
                .cloned()
                .unwrap_or_default();
            for neighbor in neighbors {
                let Some(vec) = resolved.get(&neighbor) else {
                    continue;
                };
                let d = self.dist(query, vec);
                if d < current_dist {
                    current = neighbor;
                    current_dist = d;
                    improved = true;
                }
            }
            if !improved {
                return (current, current_dist);
            }
        }
    }

    /// Beam search on one layer with candidate pool `ef`.
    fn search_layer(
        &self,
        inner: &Inner,
        resolved: &mut Resolved<'_>,
        query: &[f32],
        entry: (VectorId, f32),
        ef: usize,
        layer: usize,
    ) -> Vec<(VectorId, f32)> {
        let mut visited: HashSet<VectorId> = HashSet::new();
        let mut candidates: BinaryHeap<Near> = BinaryHeap::new();
        let mut found: BinaryHeap<Far> = BinaryHeap::new();

        visited.insert(entry.0.clone());
        candidates.push(Near {
            id: entry.0.clone(),
            dist: entry.1,
        });
        found.push(Far {
            id: entry.0,
            dist: entry.1,
        });

        while let Some(nearest) = candidates.pop() {
            let worst = found.peek().map_or(f32::INFINITY, |far| far.dist);
            if nearest.dist > worst && found.len() >= ef {
                break;
            }
            let neighbors: Vec<VectorId> = inner
                .nodes
                .get(&nearest.id)
                .and_then(|node| node.neighbors.get(layer))
                .cloned()
                .unwrap_or_default();
            for neighbor in neighbors {
                if !visited.insert(neighbor.clone()) {
                    continue;
                }
                let Some(vec) = resolved.get(&neighbor) else {
                    continue;
                };
                let d = self.dist(query, vec);
                let worst = found.peek().map_or(f32::INFINITY, |far| far.dist);
                if found.len() < ef || d < worst {
                    candidates.push(Near {
                        id: neighbor.clone(),
                        dist: d,
                    });
                    found.push(Far { id: neighbor, dist: d });
                    if found.len() > ef {
                        let _ = found.pop();
                    }
                }
            }
        }

        let mut out: Vec<(VectorId, f32)> = found
            .into_sorted_vec()
            .into_iter()
            .map(|far| (far.id, far.dist))
            .collect();
        out.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        out
    }

    /// Diversity-aware pruning: keep a candidate only if it is closer to
    /// the base than to any already-selected neighbor.
    fn select_neighbors(
        &self,
        resolved: &mut Resolved<'_>,
        candidates: &[(VectorId, f32)],
        limit: usize,
    ) -> Vec<VectorId> {
        let mut selected: Vec<(VectorId, f32)> = Vec::with_capacity(limit);
        for (candidate, dist_to_base) in candidates {
            if selected.len() >= limit {
                break;
            }
            let Some(candidate_vec) = resolved.get(candidate).map(<[f32]>::to_vec) else {
                continue;
            };
            let diverse = selected.iter().all(|(kept, _)| {
                resolved
                    .get(kept)
                    .is_none_or(|kept_vec| self.dist(&candidate_vec, kept_vec) > *dist_to_base)
            });
            if diverse {
                selected.push((candidate.clone(), *dist_to_base));
            }
        }
        // Backfill with nearest skipped candidates if diversity starved us.
        if selected.len() < limit {
            for (candidate, dist) in candidates {
                if selected.len() >= limit {
                    break;
                }
                if !selected.iter().any(|(kept, _)| kept == candidate) {
                    selected.push((candidate.clone(), *dist));
                }
            }
        }
        selected.into_iter().map(|(id, _)| id).collect()
    }

    fn link(&self, inner: &mut Inner, a: &VectorId, b: &VectorId, layer: usize) {
        if let Some(node) = inner.nodes.get_mut(a) {
            if let Some(list) = node.neighbors.get_mut(layer) {
                if !list.contains(b) {
                    list.push(b.clone());
                }
            }
        }
    }

    fn prune_layer(
        &self,
        inner: &mut Inner,
        resolved: &mut Resolved<'_>,
        id: &VectorId,
        layer: usize,
    ) {
        let limit = if layer == 0 { self.m_max0 } else { self.m };
        let list = match inner.nodes.get(id).and_then(|n| n.neighbors.get(layer)) {
            Some(list) if list.len() > limit => list.clone(),
            _ => return,
        };
        let Some(base) = resolved.get(id).map(<[f32]>::to_vec) else {
            return;
        };
        let mut scored: Vec<(VectorId, f32)> = list
            .into_iter()
            .filter_map(|n| {
                let vec = resolved.get(&n)?;
                Some((n.clone(), self.dist(&base, vec)))
            })
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        let kept = self.select_neighbors(resolved, &scored, limit);
        if let Some(node) = inner.nodes.get_mut(id) {
            if let Some(slot) = node.neighbors.get_mut(layer) {
                *slot = kept;
            }
        }
    }

    /// Drop tombstones and re-insert every live id from scratch.
    pub fn rebuild(&self, resolver: &dyn VectorResolver) -> Result<usize> {
        let live: Vec<VectorId> = {
            let inner = self.inner.read();
            inner
                .nodes
                .iter()
                .filter(|(_, node)| !node.tombstone)
                .map(|(id, _)| id.clone())
                .collect()
        };
        {
            let mut inner = self.inner.write();
            inner.nodes.clear();
            inner.entry_point = None;
            inner.max_level = 0;
            inner.tombstones = 0;
        }
        for id in &live {
            if let Some(vector) = resolver.resolve(id) {
                self.insert(id, &vector, resolver)?;
            }
        }
        debug!(
            target: "engram.index::hnsw",
            rebuilt = live.len(),
            "index rebuild complete"
        );
        Ok(live.len())
    }
}

impl VectorIndex for HnswIndex {
    fn metric(&self) -> DistanceMetric {
        self.metric
    }

    fn insert(&self, id: &VectorId, vector: &[f32], resolver: &dyn VectorResolver) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.nodes.get(id) {
            if !existing.tombstone {
                return Err(EngramError::DuplicateId(id.to_string()));
            }
            // Reviving a tombstoned id: fall through and rebuild its links.
            inner.tombstones -= 1;
            let _ = inner.nodes.remove(id);
        }

        let level = Self::sample_level(&mut inner.rng, self.level_mult);
        let mut resolved = Resolved::new(resolver);
        resolved.cache.insert(id.clone(), Some(vector.to_vec()));

        let Some(entry_id) = inner.entry_point.clone() else {
            inner.nodes.insert(
                id.clone(),
                Node {
                    neighbors: vec![Vec::new(); level + 1],
                    tombstone: false,
                },
            );
            inner.entry_point = Some(id.clone());
            inner.max_level = level;
            return Ok(());
        };

        let entry_dist = resolved
            .get(&entry_id)
            .map_or(f32::INFINITY, |entry_vec| self.dist(vector, entry_vec));
        let mut current = (entry_id, entry_dist);
        let top = inner.max_level;

        // Descend through layers above the new node's level.
        for layer in ((level + 1)..=top).rev() {
            current = self.greedy_step(&inner, &mut resolved, vector, current, layer);
        }

        inner.nodes.insert(
            id.clone(),
            Node {
                neighbors: vec![Vec::new(); level + 1],
                tombstone: false,
            },
        );

        for layer in (0..=level.min(top)).rev() {
            let pool = self.search_layer(
                &inner,
                &mut resolved,
                vector,
                current.clone(),
                self.ef_construction,
                layer,
            );
            let limit = if layer == 0 { self.m_max0 } else { self.m };
            let chosen = self.select_neighbors(&mut resolved, &pool, limit.min(self.m));
            for neighbor in &chosen {
                self.link(&mut inner, id, neighbor, layer);
                self.link(&mut inner, neighbor, id, layer);
                self.prune_layer(&mut inner, &mut resolved, neighbor, layer);
            }
            if let Some((best, best_dist)) = pool.first() {
                current = (best.clone(), *best_dist);
            }
        }

        if level > inner.max_level {
            inner.max_level = level;
            inner.entry_point = Some(id.clone());
        }
        Ok(())
    }

    fn remove(&self, id: &VectorId) {
        let mut inner = self.inner.write();
        if let Some(node) = inner.nodes.get_mut(id) {
            if !node.tombstone {
                node.tombstone = true;
                inner.tombstones += 1;
            }
        }
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        resolver: &dyn VectorResolver,
    ) -> Result<Vec<(VectorId, f32)>> {
        let inner = self.inner.read();
        let Some(entry_id) = inner.entry_point.clone() else {
            return Ok(Vec::new());
        };
        let mut resolved = Resolved::new(resolver);
        let entry_dist = resolved
            .get(&entry_id)
            .map_or(f32::INFINITY, |entry_vec| self.dist(query, entry_vec));
        let mut current = (entry_id, entry_dist);
        for layer in (1..=inner.max_level).rev() {
            current = self.greedy_step(&inner, &mut resolved, query, current, layer);
        }
        let pool = self.search_layer(
            &inner,
            &mut resolved,
            query,
            current,
            self.ef_search.max(k),
            0,
        );
        // Tombstoned ids are masked from results but still traversable.
        let hits = pool
            .into_iter()
            .filter(|(id, _)| inner.nodes.get(id).is_some_and(|node| !node.tombstone))
            .take(k)
            .filter_map(|(id, _)| {
                let vec = resolved.get(&id)?;
                Some((id.clone(), distance::similarity(self.metric, query, vec)))
            })
            .collect();
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_types::NORMALIZATION_TOLERANCE;
    use engram_vector::{SearchOptions, VectorStore};
    use std::collections::HashMap as StdHashMap;
    use std::sync::Arc;

    struct MapResolver {
        vectors: StdHashMap<VectorId, Vec<f32>>,
    }

    impl VectorResolver for MapResolver {
        fn resolve(&self, id: &VectorId) -> Option<Vec<f32>> {
            self.vectors.get(id).cloned()
        }
    }

    fn unit(dim: usize, at: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[at] = 1.0;
        v
    }

    fn build(n: usize, dim: usize) -> (HnswIndex, MapResolver) {
        let config = HnswConfig {
            enabled: true,
            m: 8,
            ef_construction: 64,
            ef_search: 32,
        };
        let index = HnswIndex::with_seed(DistanceMetric::Cosine, &config, 7);
        let mut vectors = StdHashMap::new();
        for i in 0..n {
            let id = VectorId::from(format!("v{i}"));
            let v = engram_vector::l2_normalize(&ramp(dim, i)).unwrap();
            vectors.insert(id, v);
        }
        let resolver = MapResolver { vectors };
        for (id, v) in resolver.vectors.clone() {
            index.insert(&id, &v, &resolver).unwrap();
        }
        (index, resolver)
    }

    fn ramp(dim: usize, seed: usize) -> Vec<f32> {
        (0..dim)
            .map(|j| ((seed * 31 + j * 7) % 97) as f32 / 97.0 + 0.01)
            .collect()
    }

    #[test]
    fn empty_index_returns_empty() {
        let config = HnswConfig::default();
        let index = HnswIndex::new(DistanceMetric::Cosine, &config);
        let resolver = MapResolver {
            vectors: StdHashMap::new(),
        };
        assert!(index.search(&unit(4, 0), 3, &resolver).unwrap().is_empty());
    }

    #[test]
    fn finds_exact_match_first() {
        let (index, resolver) = build(64, 16);
        let target = resolver.vectors[&VectorId::from("v17")].clone();
        let hits = index.search(&target, 4, &resolver).unwrap();
        assert_eq!(hits[0].0, VectorId::from("v17"));
        assert!((hits[0].1 - 1.0).abs() < 1e-5);
    }

    #[test]
    fn recall_matches_flat_scan_on_small_corpus() {
        let (index, resolver) = build(128, 16);
        let query = engram_vector::l2_normalize(&ramp(16, 40)).unwrap();

        let mut flat: Vec<(VectorId, f32)> = resolver
            .vectors
            .iter()
            .map(|(id, v)| {
                (
                    id.clone(),
                    distance::similarity(DistanceMetric::Cosine, &query, v),
                )
            })
            .collect();
        flat.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        let expected: Vec<&VectorId> = flat.iter().take(5).map(|(id, _)| id).collect();

        let hits = index.search(&query, 5, &resolver).unwrap();
        let got: Vec<&VectorId> = hits.iter().map(|(id, _)| id).collect();
        let overlap = expected.iter().filter(|id| got.contains(id)).count();
        assert!(overlap >= 4, "recall too low: {overlap}/5");
    }

    #[test]
    fn tombstoned_ids_are_masked() {
        let (index, resolver) = build(32, 8);
        let victim = VectorId::from("v3");
        let target = resolver.vectors[&victim].clone();
        index.remove(&victim);
        let hits = index.search(&target, 5, &resolver).unwrap();
        assert!(hits.iter().all(|(id, _)| *id != victim));
        assert_eq!(index.tombstone_count(), 1);
    }

    #[test]
    fn rebuild_drops_tombstones() {
        let (index, resolver) = build(32, 8);
        index.remove(&VectorId::from("v0"));
        index.remove(&VectorId::from("v1"));
        let mut live_resolver = MapResolver {
            vectors: resolver.vectors.clone(),
        };
        live_resolver.vectors.remove(&VectorId::from("v0"));
        live_resolver.vectors.remove(&VectorId::from("v1"));
        let rebuilt = index.rebuild(&live_resolver).unwrap();
        assert_eq!(rebuilt, 30);
        assert_eq!(index.tombstone_count(), 0);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let (index, resolver) = build(4, 8);
        let v = resolver.vectors[&VectorId::from("v0")].clone();
        let err = index.insert(&VectorId::from("v0"), &v, &resolver).unwrap_err();
        assert!(matches!(err, EngramError::DuplicateId(_)));
    }

    #[test]
    fn wired_as_store_backend() {
        let config = HnswConfig {
            enabled: true,
            m: 8,
            ef_construction: 64,
            ef_search: 32,
        };
        let index = Arc::new(HnswIndex::with_seed(DistanceMetric::Cosine, &config, 3));
        let store = VectorStore::with_parts(
            8,
            NORMALIZATION_TOLERANCE,
            Arc::new(engram_vector::PlainCodec),
            Some(index),
            Arc::new(engram_vector::NoOpAccessSink),
            Arc::new(engram_types::SystemClock),
        );
        for i in 0..8 {
            store
                .insert(
                    VectorId::from(format!("v{i}")),
                    unit(8, i),
                    engram_types::Metadata::new(),
                )
                .unwrap();
        }
        let hits = store.search(&unit(8, 5), 2, &SearchOptions::default()).unwrap();
        assert_eq!(hits[0].id, VectorId::from("v5"));
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }
}
