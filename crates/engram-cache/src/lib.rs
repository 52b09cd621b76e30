//! Bounded LRU cache.
//!
//! Entry-count and optional byte budgets, strict access ordering with O(1)
//! `get`/`put` via an index-linked list, `peek` without promotion, and
//! eviction events through a non-blocking observer. Eviction is a pure
//! memory operation and never performs I/O. The public handle is internally
//! synchronized; callers need no locking.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

const NIL: usize = usize::MAX;

/// Emitted for every entry removed to satisfy a budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionEvent<K> {
    pub key: K,
    pub bytes: usize,
    /// Entry count after the eviction.
    pub remaining_entries: usize,
    /// Byte total after the eviction.
    pub remaining_bytes: usize,
}

/// Receives eviction events. Implementations must not block; failures are
/// the observer's problem and are never surfaced to cache callers.
pub trait CacheObserver<K>: Send + Sync {
    fn on_evict(&self, event: &EvictionEvent<K>);
}

/// Observer that compiles to nothing.
pub struct NoOpCacheObserver;

impl<K> CacheObserver<K> for NoOpCacheObserver {
    #[inline(always)]
    fn on_evict(&self, _event: &EvictionEvent<K>) {}
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheMetrics {
    pub entries: usize,
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Entries rejected because they alone exceed the byte budget.
    pub oversize_rejections: u64,
}

impl CacheMetrics {
    /// Hit rate over all counted lookups, 0.0 when none.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Entry<K, V> {
    key: K,
    value: V,
    bytes: usize,
    prev: usize,
    next: usize,
}

struct Core<K, V> {
    map: HashMap<K, usize>,
    slots: Vec<Option<Entry<K, V>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    max_entries: usize,
    max_bytes: Option<usize>,
    total_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    oversize_rejections: u64,
}

impl<K: Eq + Hash + Clone, V> Core<K, V> {
    fn new(max_entries: usize, max_bytes: Option<usize>) -> Self {
        assert!(max_entries > 0, "max_entries must be > 0");
        Self {
            map: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            max_entries,
            max_bytes,
            total_bytes: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            oversize_rejections: 0,
        }
    }

    fn entry(&self, idx: usize) -> &Entry<K, V> {
        self.slots[idx].as_ref().expect("linked slot is occupied")
    }

    fn entry_mut(&mut self, idx: usize) -> &mut Entry<K, V> {
        self.slots[idx].as_mut().expect("linked slot is occupied")
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let entry = self.entry(idx);
            (entry.prev, entry.next)
        };
        if prev == NIL {
            self.head = next;
        } else {
            self.entry_mut(prev).next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.entry_mut(next).prev = prev;
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let entry = self.entry_mut(idx);
            entry.prev = NIL;
            entry.next = old_head;
        }
        if old_head != NIL {
            self.entry_mut(old_head).prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn touch(&mut self, idx: usize) {
        if self.head != idx {
            self.unlink(idx);
            self.push_front(idx);
        }
    }

    fn remove_slot(&mut self, idx: usize) -> Entry<K, V> {
        self.unlink(idx);
        let entry = self.slots[idx].take().expect("linked slot is occupied");
        self.free.push(idx);
        self.total_bytes -= entry.bytes;
        let _ = self.map.remove(&entry.key);
        entry
    }

    fn evict_lru(&mut self) -> Option<EvictionEvent<K>> {
        if self.tail == NIL {
            return None;
        }
        let entry = self.remove_slot(self.tail);
        self.evictions += 1;
        Some(EvictionEvent {
            key: entry.key,
            bytes: entry.bytes,
            remaining_entries: self.map.len(),
            remaining_bytes: self.total_bytes,
        })
    }

    fn evict_to_fit(&mut self, incoming_bytes: usize, events: &mut Vec<EvictionEvent<K>>) {
        while self.map.len() >= self.max_entries
            || self
                .max_bytes
                .is_some_and(|cap| self.total_bytes + incoming_bytes > cap)
        {
            match self.evict_lru() {
                Some(event) => events.push(event),
                None => break,
            }
        }
    }

    fn insert(&mut self, key: K, value: V, bytes: usize, events: &mut Vec<EvictionEvent<K>>) {
        if self.max_bytes.is_some_and(|cap| bytes > cap) {
            self.oversize_rejections += 1;
            return;
        }
        if let Some(&idx) = self.map.get(&key) {
            let old_bytes = self.entry(idx).bytes;
            self.total_bytes = self.total_bytes - old_bytes + bytes;
            {
                let entry = self.entry_mut(idx);
                entry.value = value;
                entry.bytes = bytes;
            }
            self.touch(idx);
            // Replacement may have grown the entry past the byte budget.
            self.shrink_over_budget(idx, events);
            return;
        }

        self.evict_to_fit(bytes, events);

        let idx = self.free.pop().unwrap_or_else(|| {
            self.slots.push(None);
            self.slots.len() - 1
        });
        self.slots[idx] = Some(Entry {
            key: key.clone(),
            value,
            bytes,
            prev: NIL,
            next: NIL,
        });
        self.push_front(idx);
        self.map.insert(key, idx);
        self.total_bytes += bytes;
    }

    fn shrink_over_budget(&mut self, keep: usize, events: &mut Vec<EvictionEvent<K>>) {
        while self.max_bytes.is_some_and(|cap| self.total_bytes > cap) {
            if self.tail == keep {
                // The protected entry is last; nothing colder to evict.
                if self.map.len() == 1 {
                    break;
                }
                let second = self.entry(self.tail).prev;
                if second == NIL {
                    break;
                }
                let entry = self.remove_slot(second);
                self.evictions += 1;
                events.push(EvictionEvent {
                    key: entry.key,
                    bytes: entry.bytes,
                    remaining_entries: self.map.len(),
                    remaining_bytes: self.total_bytes,
                });
                continue;
            }
            match self.evict_lru() {
                Some(event) => events.push(event),
                None => break,
            }
        }
    }
}

/// Internally synchronized LRU cache handle.
pub struct LruCache<K, V> {
    core: Mutex<Core<K, V>>,
    observer: Arc<dyn CacheObserver<K>>,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    /// Cache bounded by entry count only.
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self::with_observer(max_entries, None, Arc::new(NoOpCacheObserver))
    }

    /// Cache bounded by entry count and bytes.
    #[must_use]
    pub fn with_byte_budget(max_entries: usize, max_bytes: usize) -> Self {
        Self::with_observer(max_entries, Some(max_bytes), Arc::new(NoOpCacheObserver))
    }

    /// Full constructor with an eviction observer.
    #[must_use]
    pub fn with_observer(
        max_entries: usize,
        max_bytes: Option<usize>,
        observer: Arc<dyn CacheObserver<K>>,
    ) -> Self {
        Self {
            core: Mutex::new(Core::new(max_entries, max_bytes)),
            observer,
        }
    }

    /// Look up and promote to most-recently-used.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut core = self.core.lock();
        if let Some(&idx) = core.map.get(key) {
            core.touch(idx);
            core.hits += 1;
            Some(core.entry(idx).value.clone())
        } else {
            core.misses += 1;
            None
        }
    }

    /// Look up without touching access order or hit/miss counters.
    pub fn peek(&self, key: &K) -> Option<V> {
        let core = self.core.lock();
        core.map.get(key).map(|&idx| core.entry(idx).value.clone())
    }

    /// Insert or replace; evicts as needed to restore both budgets.
    pub fn put(&self, key: K, value: V, bytes: usize) {
        let mut events = Vec::new();
        {
            let mut core = self.core.lock();
            core.insert(key, value, bytes, &mut events);
        }
        // Observer runs outside the lock; emit failures stay with it.
        for event in &events {
            self.observer.on_evict(event);
        }
    }

    /// Remove one key. Returns whether it was present.
    pub fn delete(&self, key: &K) -> bool {
        let mut core = self.core.lock();
        if let Some(&idx) = core.map.get(key) {
            let _ = core.remove_slot(idx);
            true
        } else {
            false
        }
    }

    /// Remove every entry matching the predicate; returns removed keys.
    pub fn retain_keys(&self, mut keep: impl FnMut(&K) -> bool) -> Vec<K> {
        self.retain(|key, _| keep(key))
    }

    /// Value-aware retain; returns removed keys.
    pub fn retain(&self, mut keep: impl FnMut(&K, &V) -> bool) -> Vec<K> {
        let mut core = self.core.lock();
        let doomed: Vec<usize> = core
            .map
            .values()
            .copied()
            .filter(|&idx| {
                let entry = core.entry(idx);
                !keep(&entry.key, &entry.value)
            })
            .collect();
        doomed
            .into_iter()
            .map(|idx| core.remove_slot(idx).key)
            .collect()
    }

    /// Drop everything, keeping the counters.
    pub fn clear(&self) {
        let mut core = self.core.lock();
        core.map.clear();
        core.slots.clear();
        core.free.clear();
        core.head = NIL;
        core.tail = NIL;
        core.total_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.core.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> CacheMetrics {
        let core = self.core.lock();
        CacheMetrics {
            entries: core.map.len(),
            bytes: core.total_bytes,
            hits: core.hits,
            misses: core.misses,
            evictions: core.evictions,
            oversize_rejections: core.oversize_rejections,
        }
    }
}
