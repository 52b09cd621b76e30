//! Enhancement cache.
//!
//! LRU keyed by `xxh3(first N embedding coords) ⊕ xxh3(sorted hyperedge
//! ids)`; N is [`engram_types::GnnConfig::cache_key_prefix_coords`]
//! (default 16). Entries carry the enhanced vector, access bookkeeping and
//! a TTL; invalidation removes entries mentioning any of a set of node ids.

use std::sync::Arc;

use engram_cache::{CacheMetrics, LruCache};
use engram_types::{Clock, EdgeId, NodeId};
use xxhash_rust::xxh3::xxh3_64;

#[derive(Debug, Clone)]
struct CachedEnhancement {
    vector: Vec<f32>,
    node_ids: Vec<NodeId>,
    created_at: u64,
    last_access: u64,
    access_count: u64,
}

pub struct EnhancementCache {
    cache: LruCache<u64, CachedEnhancement>,
    ttl_ms: u64,
    prefix_coords: usize,
    clock: Arc<dyn Clock>,
}

impl EnhancementCache {
    #[must_use]
    pub fn new(
        capacity: usize,
        max_bytes: usize,
        ttl_ms: u64,
        prefix_coords: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cache: LruCache::with_byte_budget(capacity, max_bytes),
            ttl_ms,
            prefix_coords,
            clock,
        }
    }

    /// Compose the cache key from the embedding prefix and edge identity.
    #[must_use]
    pub fn key(&self, embedding: &[f32], hyperedge_ids: &[EdgeId]) -> u64 {
        let take = self.prefix_coords.min(embedding.len());
        let mut prefix_bytes = Vec::with_capacity(take * 4);
        for &x in &embedding[..take] {
            prefix_bytes.extend_from_slice(&x.to_le_bytes());
        }
        let mut sorted: Vec<&EdgeId> = hyperedge_ids.iter().collect();
        sorted.sort();
        let mut edge_bytes = Vec::new();
        for id in sorted {
            edge_bytes.extend_from_slice(id.as_str().as_bytes());
            edge_bytes.push(0);
        }
        xxh3_64(&prefix_bytes) ^ xxh3_64(&edge_bytes)
    }

    /// TTL-checked lookup.
    pub fn get(&self, key: u64) -> Option<Vec<f32>> {
        let now = self.clock.now_ms();
        // Expire before the counting lookup so a stale entry is a miss.
        if let Some(entry) = self.cache.peek(&key) {
            if now.saturating_sub(entry.created_at) > self.ttl_ms {
                let _ = self.cache.delete(&key);
            }
        }
        let entry = self.cache.get(&key)?;
        // Access bookkeeping rides along on a re-put (same byte size).
        let bytes = entry_bytes(&entry);
        let mut refreshed = entry.clone();
        refreshed.last_access = now;
        refreshed.access_count += 1;
        self.cache.put(key, refreshed, bytes);
        Some(entry.vector)
    }

    pub fn put(&self, key: u64, vector: Vec<f32>, node_ids: Vec<NodeId>) {
        let now = self.clock.now_ms();
        let entry = CachedEnhancement {
            vector,
            node_ids,
            created_at: now,
            last_access: now,
            access_count: 0,
        };
        let bytes = entry_bytes(&entry);
        self.cache.put(key, entry, bytes);
    }

    /// Drop every entry whose key mentions any of `ids`.
    pub fn invalidate_nodes(&self, ids: &[NodeId]) -> usize {
        self.cache
            .retain(|_, entry| !entry.node_ids.iter().any(|node| ids.contains(node)))
            .len()
    }

    pub fn invalidate_all(&self) {
        self.cache.clear();
    }

    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        self.cache.metrics()
    }
}

fn entry_bytes(entry: &CachedEnhancement) -> usize {
    entry.vector.len() * 4
        + entry
            .node_ids
            .iter()
            .map(|id| id.as_str().len())
            .sum::<usize>()
        + 32
}
