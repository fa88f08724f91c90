//! Process-lifetime request counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counters shared by all handlers.
///
/// Only `/execute` traffic is counted: every request that passes admission
/// control bumps `total_requests`, and every one that ends in a non-2xx
/// response bumps `total_errors` as well.
#[derive(Debug, Default)]
pub struct Metrics {
    total_requests: AtomicU64,
    total_errors: AtomicU64,
}

/// Point-in-time view served by `/metrics`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub total_errors: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
        }
    }
}
