//! Router metrics: in-process counters for the status endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Routing counters. Shared between handlers, so every field is atomic.
#[derive(Debug)]
pub struct RouterMetrics {
    requests_routed: AtomicU64,
    served_from_mapping: AtomicU64,
    loads_triggered: AtomicU64,
    lock_waits: AtomicU64,
    forwarding_failures: AtomicU64,
    extraction_misses: AtomicU64,
    start_time: Instant,
}

impl Default for RouterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterMetrics {
    pub fn new() -> Self {
        Self {
            requests_routed: AtomicU64::new(0),
            served_from_mapping: AtomicU64::new(0),
            loads_triggered: AtomicU64::new(0),
            lock_waits: AtomicU64::new(0),
            forwarding_failures: AtomicU64::new(0),
            extraction_misses: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a request forwarded to a backend.
    pub fn record_routed(&self) {
        self.requests_routed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request served by an instance already holding the model.
    pub fn record_served_from_mapping(&self) {
        self.served_from_mapping.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request that made its instance load the model.
    pub fn record_load_triggered(&self) {
        self.loads_triggered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request sent to an instance that is still loading the model.
    pub fn record_lock_wait(&self) {
        self.lock_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forwarding_failure(&self) {
        self.forwarding_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request whose model could not be determined.
    pub fn record_extraction_miss(&self) {
        self.extraction_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_routed: self.requests_routed.load(Ordering::Relaxed),
            served_from_mapping: self.served_from_mapping.load(Ordering::Relaxed),
            loads_triggered: self.loads_triggered.load(Ordering::Relaxed),
            lock_waits: self.lock_waits.load(Ordering::Relaxed),
            forwarding_failures: self.forwarding_failures.load(Ordering::Relaxed),
            extraction_misses: self.extraction_misses.load(Ordering::Relaxed),
            uptime_secs: self.uptime_secs(),
        }
    }
}

/// Immutable snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub requests_routed: u64,
    pub served_from_mapping: u64,
    pub loads_triggered: u64,
    pub lock_waits: u64,
    pub forwarding_failures: u64,
    pub extraction_misses: u64,
    pub uptime_secs: u64,
}
