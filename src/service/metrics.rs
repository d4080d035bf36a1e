//! Dispatch counters, shared across a service's workers.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters for one service. Relaxed ordering throughout; the
/// numbers are observability, not synchronization.
#[derive(Debug, Default)]
pub struct ServiceMetrics {
    received: AtomicU64,
    handled_ok: AtomicU64,
    handled_error: AtomicU64,
    rejected: AtomicU64,
}

impl ServiceMetrics {
    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handled_ok(&self) {
        self.handled_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handled_error(&self) {
        self.handled_error.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Deliveries pulled off the queue, foreign traffic included.
    #[must_use]
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Requests handled to a successful reply.
    #[must_use]
    pub fn handled_ok(&self) -> u64 {
        self.handled_ok.load(Ordering::Relaxed)
    }

    /// Requests handled to an error reply (handler failure or a
    /// flag/content mismatch).
    #[must_use]
    pub fn handled_error(&self) -> u64 {
        self.handled_error.load(Ordering::Relaxed)
    }

    /// Deliveries rejected as foreign traffic.
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}
