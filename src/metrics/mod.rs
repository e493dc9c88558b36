//! In-process gateway counters
//!
//! Lightweight atomics surfaced through `get_stats()` and the `/stats`
//! route; the observability sink scrapes these. No histograms, no exporter
//! protocol: counters and a serializable snapshot are all the core needs.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter set shared across gateway components
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    rate_limited: AtomicU64,
    auth_failures: AtomicU64,
    delivery_failures: AtomicU64,
    bus_published: AtomicU64,
    bus_publish_failures: AtomicU64,
    bus_relayed: AtomicU64,
    bus_duplicates_skipped: AtomicU64,
}

/// Point-in-time view of the counters
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub messages_in: u64,
    pub messages_out: u64,
    pub rate_limited: u64,
    pub auth_failures: u64,
    pub delivery_failures: u64,
    pub bus_published: u64,
    pub bus_publish_failures: u64,
    pub bus_relayed: u64,
    pub bus_duplicates_skipped: u64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_message_in(&self) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_messages_out(&self, count: u64) {
        self.messages_out.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery_failures(&self, count: u64) {
        if count > 0 {
            self.delivery_failures.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn record_bus_published(&self) {
        self.bus_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bus_publish_failure(&self) {
        self.bus_publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bus_relayed(&self) {
        self.bus_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bus_duplicate_skipped(&self) {
        self.bus_duplicates_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            bus_published: self.bus_published.load(Ordering::Relaxed),
            bus_publish_failures: self.bus_publish_failures.load(Ordering::Relaxed),
            bus_relayed: self.bus_relayed.load(Ordering::Relaxed),
            bus_duplicates_skipped: self.bus_duplicates_skipped.load(Ordering::Relaxed),
        }
    }
}
