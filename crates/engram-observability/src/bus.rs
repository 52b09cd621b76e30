//! Bounded, lock-free event bus.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;
use engram_types::{Metadata, mint_tagged};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Outcome label carried by every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Ok,
    Degraded,
    Error,
}

/// One observability event, NDJSON-serializable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// `evt_{epoch_ms}_{rand}`.
    pub id: String,
    pub timestamp_ms: u64,
    pub component: String,
    pub operation: String,
    pub status: EventStatus,
    pub metadata: Metadata,
}

impl Event {
    #[must_use]
    pub fn new(
        now_ms: u64,
        component: &str,
        operation: &str,
        status: EventStatus,
        metadata: Metadata,
    ) -> Self {
        Self {
            id: mint_tagged("evt", now_ms),
            timestamp_ms: now_ms,
            component: component.to_string(),
            operation: operation.to_string(),
            status,
            metadata,
        }
    }
}

/// Bounded MPMC event queue. Cloning the handle shares the queue.
#[derive(Clone)]
pub struct EventBus {
    queue: Arc<ArrayQueue<Event>>,
    emitted: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "bus capacity must be > 0");
        Self {
            queue: Arc::new(ArrayQueue::new(capacity)),
            emitted: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enqueue an event. Never blocks; when full the oldest event is
    /// displaced and counted as dropped.
    pub fn emit(&self, event: Event) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
        if let Some(displaced) = self.queue.force_push(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(
                target: "engram.observability::bus",
                id = %displaced.id,
                component = %displaced.component,
                "bus full, dropped oldest event"
            );
        }
    }

    /// Convenience wrapper building the event in place.
    pub fn emit_now(
        &self,
        now_ms: u64,
        component: &str,
        operation: &str,
        status: EventStatus,
        metadata: Metadata,
    ) {
        self.emit(Event::new(now_ms, component, operation, status, metadata));
    }

    /// Pop up to `max` events in FIFO order.
    #[must_use]
    pub fn drain(&self, max: usize) -> Vec<Event> {
        let mut out = Vec::new();
        while out.len() < max {
            match self.queue.pop() {
                Some(event) => out.push(event),
                None => break,
            }
        }
        out
    }

    /// Drain into NDJSON lines. Serialization failures are swallowed.
    #[must_use]
    pub fn drain_ndjson(&self, max: usize) -> Vec<String> {
        self.drain(max)
            .iter()
            .filter_map(|event| serde_json::to_string(event).ok())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[must_use]
    pub fn emitted_total(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Build a one-entry metadata map; insert into it for more keys.
#[must_use]
pub fn meta(key: &str, value: impl Into<engram_types::MetadataValue>) -> Metadata {
    let mut map = BTreeMap::new();
    map.insert(key.to_string(), value.into());
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_then_drain_is_fifo() {
        let bus = EventBus::new(8);
        for i in 0..3u64 {
            bus.emit_now(i, "vector_store", "insert", EventStatus::Ok, Metadata::new());
        }
        let events = bus.drain(10);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].timestamp_ms, 0);
        assert_eq!(events[2].timestamp_ms, 2);
    }

    #[test]
    fn backpressure_drops_oldest_first() {
        let bus = EventBus::new(2);
        for i in 0..5u64 {
            bus.emit_now(i, "c", "op", EventStatus::Ok, Metadata::new());
        }
        assert_eq!(bus.dropped_total(), 3);
        assert_eq!(bus.emitted_total(), 5);
        let events = bus.drain(10);
        let stamps: Vec<u64> = events.iter().map(|e| e.timestamp_ms).collect();
        assert_eq!(stamps, vec![3, 4], "oldest events are displaced");
    }

    #[test]
    fn events_serialize_to_ndjson() {
        let bus = EventBus::new(4);
        bus.emit_now(
            1_700_000_000_000,
            "compression",
            "vectordb_tier_transition",
            EventStatus::Ok,
            meta("from", "hot"),
        );
        let lines = bus.drain_ndjson(4);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("\"vectordb_tier_transition\""));
        assert!(lines[0].contains("\"evt_"));
        let value: serde_json::Value = serde_json::from_str(&lines[0]).expect("valid JSON");
        assert_eq!(value["component"], "compression");
    }

    #[test]
    fn ids_are_minted_with_evt_prefix() {
        let event = Event::new(42, "c", "op", EventStatus::Error, Metadata::new());
        assert!(event.id.starts_with("evt_42_"));
    }
}
