//! Prometheus-style metrics registry.
//!
//! Counters and gauges are relaxed atomics; histograms use fixed bucket
//! bounds; summaries keep a bounded observation window and compute
//! quantiles at render time. [`MetricsRegistry::render`] produces the text
//! exposition format.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn inc(&self) {
        let _ = self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        let _ = self.value.fetch_add(delta, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Signed gauge.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn add(&self, delta: i64) {
        let _ = self.value.fetch_add(delta, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Histogram with fixed bucket upper bounds.
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<f64>,
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    /// Sum in micro-units to stay atomic without a float CAS loop.
    sum_micros: AtomicU64,
}

impl Histogram {
    #[must_use]
    pub fn new(bounds: Vec<f64>) -> Self {
        let buckets = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            buckets,
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
        }
    }

    /// Latency-shaped default bounds in milliseconds.
    #[must_use]
    pub fn latency_ms() -> Self {
        Self::new(vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0])
    }

    pub fn observe(&self, value: f64) {
        let idx = self
            .bounds
            .iter()
            .position(|&bound| value <= bound)
            .unwrap_or(self.bounds.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        let micros = (value * 1e6).max(0.0) as u64;
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn sum(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1e6
    }

    fn cumulative(&self) -> Vec<(String, u64)> {
        let mut total = 0u64;
        let mut out = Vec::with_capacity(self.buckets.len());
        for (idx, bucket) in self.buckets.iter().enumerate() {
            total += bucket.load(Ordering::Relaxed);
            let label = self
                .bounds
                .get(idx)
                .map_or_else(|| "+Inf".to_string(), |b| format!("{b}"));
            out.push((label, total));
        }
        out
    }
}

const SUMMARY_WINDOW: usize = 512;

/// Summary over a bounded sliding window of observations.
#[derive(Debug)]
pub struct Summary {
    window: Mutex<Vec<f64>>,
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl Default for Summary {
    fn default() -> Self {
        Self::new()
    }
}

impl Summary {
    #[must_use]
    pub fn new() -> Self {
        Self {
            window: Mutex::new(Vec::with_capacity(SUMMARY_WINDOW)),
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let micros = (value * 1e6).max(0.0) as u64;
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
        let mut window = self.window.lock();
        if window.len() == SUMMARY_WINDOW {
            let _ = window.remove(0);
        }
        window.push(value);
    }

    /// Quantile over the current window; `None` when empty.
    #[must_use]
    pub fn quantile(&self, q: f64) -> Option<f64> {
        let window = self.window.lock();
        if window.is_empty() {
            return None;
        }
        let mut sorted = window.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((sorted.len() - 1) as f64 * q.clamp(0.0, 1.0)).round() as usize;
        Some(sorted[idx])
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn sum(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1e6
    }
}

enum Metric {
    Counter(Arc<Counter>),
    Gauge(Arc<Gauge>),
    Histogram(Arc<Histogram>),
    Summary(Arc<Summary>),
}

/// Named metric registry. Names follow `component_operation_unit`.
#[derive(Default)]
pub struct MetricsRegistry {
    metrics: RwLock<BTreeMap<String, Metric>>,
}

impl MetricsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or register a counter.
    pub fn counter(&self, name: &str) -> Arc<Counter> {
        if let Some(Metric::Counter(c)) = self.metrics.read().get(name) {
            return Arc::clone(c);
        }
        let mut metrics = self.metrics.write();
        match metrics
            .entry(name.to_string())
            .or_insert_with(|| Metric::Counter(Arc::new(Counter::default())))
        {
            Metric::Counter(c) => Arc::clone(c),
            _ => panic!("metric `{name}` already registered with another type"),
        }
    }

    /// Get or register a gauge.
    pub fn gauge(&self, name: &str) -> Arc<Gauge> {
        if let Some(Metric::Gauge(g)) = self.metrics.read().get(name) {
            return Arc::clone(g);
        }
        let mut metrics = self.metrics.write();
        match metrics
            .entry(name.to_string())
            .or_insert_with(|| Metric::Gauge(Arc::new(Gauge::default())))
        {
            Metric::Gauge(g) => Arc::clone(g),
            _ => panic!("metric `{name}` already registered with another type"),
        }
    }

    /// Get or register a histogram with latency-shaped buckets.
    pub fn histogram(&self, name: &str) -> Arc<Histogram> {
        if let Some(Metric::Histogram(h)) = self.metrics.read().get(name) {
            return Arc::clone(h);
        }
        let mut metrics = self.metrics.write();
        match metrics
            .entry(name.to_string())
            .or_insert_with(|| Metric::Histogram(Arc::new(Histogram::latency_ms())))
        {
            Metric::Histogram(h) => Arc::clone(h),
            _ => panic!("metric `{name}` already registered with another type"),
        }
    }

    /// Get or register a summary.
    pub fn summary(&self, name: &str) -> Arc<Summary> {
        if let Some(Metric::Summary(s)) = self.metrics.read().get(name) {
            return Arc::clone(s);
        }
        let mut metrics = self.metrics.write();
        match metrics
            .entry(name.to_string())
            .or_insert_with(|| Metric::Summary(Arc::new(Summary::new())))
        {
            Metric::Summary(s) => Arc::clone(s),
            _ => panic!("metric `{name}` already registered with another type"),
        }
    }

    /// Render the Prometheus text exposition format.
    #[must_use]
    pub fn render(&self) -> String {
        let metrics = self.metrics.read();
        let mut out = String::new();
        for (name, metric) in metrics.iter() {
            match metric {
                Metric::Counter(c) => {
                    let _ = writeln!(out, "# TYPE {name} counter");
                    let _ = writeln!(out, "{name} {}", c.get());
                }
                Metric::Gauge(g) => {
                    let _ = writeln!(out, "# TYPE {name} gauge");
                    let _ = writeln!(out, "{name} {}", g.get());
                }
                Metric::Histogram(h) => {
                    let _ = writeln!(out, "# TYPE {name} histogram");
                    for (bound, cumulative) in h.cumulative() {
                        let _ = writeln!(out, "{name}_bucket{{le=\"{bound}\"}} {cumulative}");
                    }
                    let _ = writeln!(out, "{name}_sum {}", h.sum());
                    let _ = writeln!(out, "{name}_count {}", h.count());
                }
                Metric::Summary(s) => {
                    let _ = writeln!(out, "# TYPE {name} summary");
                    for q in [0.5, 0.9, 0.99] {
                        if let Some(value) = s.quantile(q) {
                            let _ = writeln!(out, "{name}{{quantile=\"{q}\"}} {value}");
                        }
                    }
                    let _ = writeln!(out, "{name}_sum {}", s.sum());
                    let _ = writeln!(out, "{name}_count {}", s.count());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_and_gauge_round_trip() {
        let registry = MetricsRegistry::new();
        registry.counter("search_requests_total").inc();
        registry.counter("search_requests_total").add(2);
        registry.gauge("cache_bytes").set(1024);
        registry.gauge("cache_bytes").add(-24);
        assert_eq!(registry.counter("search_requests_total").get(), 3);
        assert_eq!(registry.gauge("cache_bytes").get(), 1000);
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let h = Histogram::new(vec![1.0, 10.0]);
        h.observe(0.5);
        h.observe(5.0);
        h.observe(50.0);
        let cumulative = h.cumulative();
        assert_eq!(cumulative[0], ("1".to_string(), 1));
        assert_eq!(cumulative[1], ("10".to_string(), 2));
        assert_eq!(cumulative[2], ("+Inf".to_string(), 3));
        assert_eq!(h.count(), 3);
        assert!((h.sum() - 55.5).abs() < 1e-6);
    }

    #[test]
    fn summary_quantiles_track_window() {
        let s = Summary::new();
        for i in 1..=100 {
            s.observe(f64::from(i));
        }
        let q50 = s.quantile(0.5).expect("non-empty");
        assert!((49.0..=52.0).contains(&q50), "q50 = {q50}");
        assert_eq!(s.quantile(1.0), Some(100.0));
    }

    #[test]
    fn render_emits_text_exposition() {
        let registry = MetricsRegistry::new();
        registry.counter("tier_transitions_total").inc();
        registry.histogram("search_latency_ms").observe(3.0);
        let text = registry.render();
        assert!(text.contains("# TYPE tier_transitions_total counter"));
        assert!(text.contains("tier_transitions_total 1"));
        assert!(text.contains("search_latency_ms_bucket{le=\"5\"} 1"));
        assert!(text.contains("search_latency_ms_count 1"));
    }
}
