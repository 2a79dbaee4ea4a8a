//! Failure-rate circuit breaker for the investigation subsystem.
//!
//! Separates "one bad run" from "the subsystem is broken": individual
//! failures are recorded without raising anything, and only a run of
//! consecutive failures reaching the threshold opens the breaker and owes
//! the operator exactly one degraded alert. The next success after an alert
//! owes exactly one recovery notification.
//!
//! All state lives behind a single mutex; concurrent incident pipelines may
//! record outcomes without lost updates or torn reads.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::BreakerConfig;

/// Breaker state: Closed is normal operation, Open means the consecutive
/// failure threshold has been reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
}

#[derive(Debug)]
struct BreakerInner {
    failure_count: u64,
    first_failure_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    recent_reasons: VecDeque<String>,
    state: BreakerState,
    /// Whether an alert has been issued for the current Open period.
    alerted: bool,
}

impl BreakerInner {
    fn reset(&mut self) {
        self.failure_count = 0;
        self.first_failure_at = None;
        self.last_failure_at = None;
        self.recent_reasons.clear();
        self.state = BreakerState::Closed;
        self.alerted = false;
    }
}

/// Read-only snapshot for building alert payloads. Buffers are copied so the
/// caller cannot mutate breaker internals.
#[derive(Debug, Clone)]
pub struct BreakerStats {
    pub failure_count: u64,
    pub first_failure_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Wall-clock span between first and last recorded failure.
    pub window: Duration,
    pub recent_reasons: Vec<String>,
    pub state: BreakerState,
}

/// Thread-safe failure aggregator.
pub struct CircuitBreaker {
    threshold: u64,
    capacity: usize,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: &BreakerConfig) -> Self {
        // The config layer already normalizes <= 0; guard against a raw
        // zero slipping through a hand-built config.
        let threshold = BreakerConfig::normalized_threshold(config.failure_threshold as i64);
        Self {
            threshold: u64::from(threshold),
            capacity: config.recent_reasons.max(1),
            inner: Mutex::new(BreakerInner {
                failure_count: 0,
                first_failure_at: None,
                last_failure_at: None,
                recent_reasons: VecDeque::new(),
                state: BreakerState::Closed,
                alerted: false,
            }),
        }
    }

    /// Record one investigation failure. Opens the breaker the instant the
    /// consecutive failure count reaches the threshold.
    pub fn record_failure(&self, reason: impl Into<String>) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        let now = Utc::now();

        inner.failure_count += 1;
        if inner.first_failure_at.is_none() {
            inner.first_failure_at = Some(now);
        }
        inner.last_failure_at = Some(now);

        inner.recent_reasons.push_back(reason.into());
        while inner.recent_reasons.len() > self.capacity {
            inner.recent_reasons.pop_front();
        }

        if inner.state == BreakerState::Closed && inner.failure_count >= self.threshold {
            inner.state = BreakerState::Open;
            tracing::warn!(
                failures = inner.failure_count,
                threshold = self.threshold,
                "Circuit breaker opened"
            );
        }
    }

    /// True exactly once per Open period. Marks the period as alerted.
    pub fn should_alert(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state == BreakerState::Open && !inner.alerted {
            inner.alerted = true;
            true
        } else {
            false
        }
    }

    /// Record a successful investigation.
    ///
    /// Returns true iff the breaker was Open and an alert had been issued
    /// for that period, meaning a recovery notification is owed. All state
    /// resets to initial values regardless of the return value.
    pub fn record_success(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        let recovery_owed = inner.state == BreakerState::Open && inner.alerted;
        inner.reset();
        if recovery_owed {
            tracing::info!("Circuit breaker closed after recovery");
        }
        recovery_owed
    }

    /// Snapshot for alert payloads.
    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        let window = match (inner.first_failure_at, inner.last_failure_at) {
            (Some(first), Some(last)) => (last - first).to_std().unwrap_or(Duration::ZERO),
            _ => Duration::ZERO,
        };
        BreakerStats {
            failure_count: inner.failure_count,
            first_failure_at: inner.first_failure_at,
            last_failure_at: inner.last_failure_at,
            window,
            recent_reasons: inner.recent_reasons.iter().cloned().collect(),
            state: inner.state,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    pub fn failure_count(&self) -> u64 {
        self.inner
            .lock()
            .expect("breaker lock poisoned")
            .failure_count
    }
}
