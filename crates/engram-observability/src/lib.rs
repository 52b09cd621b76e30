//! Observability bus and metrics.
//!
//! [`EventBus::emit`] is non-blocking and infallible from the caller's view:
//! the queue is a bounded lock-free ring and backpressure drops the oldest
//! event first. Metrics follow the Prometheus model (counters, gauges,
//! histograms, summaries) with relaxed atomic counters and a text
//! exposition renderer.

pub mod bus;
pub mod metrics;

pub use bus::{Event, EventBus, EventStatus};
pub use metrics::{Counter, Gauge, Histogram, MetricsRegistry, Summary};
