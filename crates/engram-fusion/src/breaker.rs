//! Three-state circuit breaker.
//!
//! Closed → Open after exactly `threshold` consecutive failures; Open →
//! Half-Open once `reset_timeout` elapses; two Half-Open successes close
//! the circuit, any Half-Open failure reopens it.

use std::sync::Arc;

use engram_types::Clock;
use parking_lot::Mutex;
use tracing::debug;

const HALF_OPEN_SUCCESSES_TO_CLOSE: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Inner {
    Closed { consecutive_failures: u32 },
    Open { since_ms: u64 },
    HalfOpen { successes: u32 },
}

pub struct CircuitBreaker {
    name: &'static str,
    threshold: u32,
    reset_timeout_ms: u64,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(
        name: &'static str,
        threshold: u32,
        reset_timeout_ms: u64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        assert!(threshold > 0, "threshold must be > 0");
        Self {
            name,
            threshold,
            reset_timeout_ms,
            clock,
            inner: Mutex::new(Inner::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Whether a call may proceed; flips Open → Half-Open after the reset
    /// timeout.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match *inner {
            Inner::Closed { .. } | Inner::HalfOpen { .. } => true,
            Inner::Open { since_ms } => {
                if self.clock.now_ms().saturating_sub(since_ms) >= self.reset_timeout_ms {
                    debug!(target: "engram.fusion::breaker", name = self.name, "probing half-open");
                    *inner = Inner::HalfOpen { successes: 0 };
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match *inner {
            Inner::Closed { .. } => {
                *inner = Inner::Closed {
                    consecutive_failures: 0,
                };
            }
            Inner::HalfOpen { successes } => {
                let successes = successes + 1;
                if successes >= HALF_OPEN_SUCCESSES_TO_CLOSE {
                    debug!(target: "engram.fusion::breaker", name = self.name, "closed");
                    *inner = Inner::Closed {
                        consecutive_failures: 0,
                    };
                } else {
                    *inner = Inner::HalfOpen { successes };
                }
            }
            Inner::Open { .. } => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match *inner {
            Inner::Closed {
                consecutive_failures,
            } => {
                let consecutive_failures = consecutive_failures + 1;
                if consecutive_failures >= self.threshold {
                    debug!(target: "engram.fusion::breaker", name = self.name, "opened");
                    *inner = Inner::Open {
                        since_ms: self.clock.now_ms(),
                    };
                } else {
                    *inner = Inner::Closed {
                        consecutive_failures,
                    };
                }
            }
            Inner::HalfOpen { .. } => {
                *inner = Inner::Open {
                    since_ms: self.clock.now_ms(),
                };
            }
            Inner::Open { .. } => {}
        }
    }

    #[must_use]
    pub fn state(&self) -> BreakerState {
        match *self.inner.lock() {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_types::ManualClock;

    fn breaker(threshold: u32) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        (
            CircuitBreaker::new("test", threshold, 30_000, clock.clone()),
            clock,
        )
    }

    #[test]
    fn opens_at_exactly_threshold_not_before() {
        let (b, _) = breaker(3);
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed, "threshold − 1 stays closed");
        assert!(b.allow());
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow());
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let (b, _) = breaker(3);
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_after_reset_then_two_successes_close() {
        let (b, clock) = breaker(1);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        clock.advance(30_000);
        assert!(b.allow());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        b.record_success();
        assert_eq!(b.state(), BreakerState::HalfOpen, "one success is not enough");
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let (b, clock) = breaker(1);
        b.record_failure();
        clock.advance(30_000);
        assert!(b.allow());
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow());
    }
}
