//! Operational counters.
//!
//! Every counter is a relaxed atomic, so recording never contends with the
//! request path. `fail_open` and `events_dropped` are the degraded-mode
//! signals: a non-zero delta means quotas or profiling were not fully enforced
//! during that interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Shared handle to the counters.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    checks_allowed: AtomicU64,
    checks_rate_limited: AtomicU64,
    checks_restricted: AtomicU64,
    fail_open: AtomicU64,
    store_retries: AtomicU64,
    events_accepted: AtomicU64,
    events_dropped: AtomicU64,
    anomalies: AtomicU64,
    enforcement_actions: AtomicU64,
}

impl Metrics {
    /// Create a zeroed set of counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_allowed(&self) {
        self.inner.checks_allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rate_limited(&self) {
        self.inner.checks_rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_restricted(&self) {
        self.inner.checks_restricted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fail_open(&self) {
        self.inner.fail_open.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_store_retry(&self) {
        self.inner.store_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_event_accepted(&self) {
        self.inner.events_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_event_dropped(&self) {
        self.inner.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_anomaly(&self) {
        self.inner.anomalies.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_enforcement(&self) {
        self.inner.enforcement_actions.fetch_add(1, Ordering::Relaxed);
    }

    /// Checks that failed open because the counter store was unreachable.
    pub fn fail_open(&self) -> u64 {
        self.inner.fail_open.load(Ordering::Relaxed)
    }

    /// Events discarded because the profiling queue was full.
    pub fn events_dropped(&self) -> u64 {
        self.inner.events_dropped.load(Ordering::Relaxed)
    }

    /// Get a point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            checks_allowed: load(&self.inner.checks_allowed),
            checks_rate_limited: load(&self.inner.checks_rate_limited),
            checks_restricted: load(&self.inner.checks_restricted),
            fail_open: load(&self.inner.fail_open),
            store_retries: load(&self.inner.store_retries),
            events_accepted: load(&self.inner.events_accepted),
            events_dropped: load(&self.inner.events_dropped),
            anomalies: load(&self.inner.anomalies),
            enforcement_actions: load(&self.inner.enforcement_actions),
        }
    }
}

/// A point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub checks_allowed: u64,
    pub checks_rate_limited: u64,
    pub checks_restricted: u64,
    pub fail_open: u64,
    pub store_retries: u64,
    pub events_accepted: u64,
    pub events_dropped: u64,
    pub anomalies: u64,
    pub enforcement_actions: u64,
}

impl MetricsSnapshot {
    /// Whether any degraded-mode behavior was observed.
    pub fn is_degraded(&self) -> bool {
        self.fail_open > 0 || self.events_dropped > 0
    }
}
