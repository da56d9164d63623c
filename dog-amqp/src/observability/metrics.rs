use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters for one job's consume loop
#[derive(Debug, Default)]
pub struct JobMetrics {
    deliveries: AtomicU64,
    handler_invocations: AtomicU64,
    handler_failures: AtomicU64,
    acks: AtomicU64,
    nacks: AtomicU64,
    dropped: AtomicU64,
    ignored_empty: AtomicU64,
    consumer_registrations: AtomicU64,
}

impl JobMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_delivery(&self) {
        self.deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invocation(&self) {
        self.handler_invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ack(&self) {
        self.acks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_nack(&self) {
        self.nacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ignored_empty(&self) {
        self.ignored_empty.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_registration(&self) {
        self.consumer_registrations.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> JobMetricsSnapshot {
        JobMetricsSnapshot {
            deliveries: self.deliveries.load(Ordering::Relaxed),
            handler_invocations: self.handler_invocations.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            acks: self.acks.load(Ordering::Relaxed),
            nacks: self.nacks.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            ignored_empty: self.ignored_empty.load(Ordering::Relaxed),
            consumer_registrations: self.consumer_registrations.load(Ordering::Relaxed),
        }
    }
}

/// Copy of a job's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetricsSnapshot {
    /// Non-empty deliveries taken off the stream
    pub deliveries: u64,
    pub handler_invocations: u64,
    pub handler_failures: u64,
    pub acks: u64,
    pub nacks: u64,
    /// Messages acknowledged after every attempt failed
    pub dropped: u64,
    /// Empty deliveries skipped while running
    pub ignored_empty: u64,
    pub consumer_registrations: u64,
}

impl JobMetricsSnapshot {
    /// Fraction of handler invocations that succeeded
    pub fn success_rate(&self) -> f64 {
        if self.handler_invocations == 0 {
            return 1.0;
        }
        let succeeded = self.handler_invocations - self.handler_failures;
        succeeded as f64 / self.handler_invocations as f64
    }
}
