//! Global atomic counters for pool and session activity.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. on pool shutdown).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Process-wide counters, updated with relaxed atomics.
pub struct Metrics {
    sandboxes_created: AtomicU64,
    on_demand_allocations: AtomicU64,
    replacement_failures: AtomicU64,
    sessions_completed: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            sandboxes_created: AtomicU64::new(0),
            on_demand_allocations: AtomicU64::new(0),
            replacement_failures: AtomicU64::new(0),
            sessions_completed: AtomicU64::new(0),
        }
    }

    pub fn inc_sandboxes_created(&self) {
        self.sandboxes_created.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "sandboxes_created", "counter incremented");
    }

    /// An allocation found the ready queue empty.
    pub fn inc_on_demand_allocations(&self) {
        self.on_demand_allocations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "on_demand_allocations", "counter incremented");
    }

    pub fn inc_replacement_failures(&self) {
        self.replacement_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "replacement_failures", "counter incremented");
    }

    pub fn inc_sessions_completed(&self) {
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "sessions_completed", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            sandboxes_created = self.sandboxes_created(),
            on_demand_allocations = self.on_demand_allocations(),
            replacement_failures = self.replacement_failures(),
            sessions_completed = self.sessions_completed(),
        );
    }

    pub fn sandboxes_created(&self) -> u64 {
        self.sandboxes_created.load(Ordering::Relaxed)
    }

    pub fn on_demand_allocations(&self) -> u64 {
        self.on_demand_allocations.load(Ordering::Relaxed)
    }

    pub fn replacement_failures(&self) -> u64 {
        self.replacement_failures.load(Ordering::Relaxed)
    }

    pub fn sessions_completed(&self) -> u64 {
        self.sessions_completed.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.sandboxes_created.store(0, Ordering::Relaxed);
        self.on_demand_allocations.store(0, Ordering::Relaxed);
        self.replacement_failures.store(0, Ordering::Relaxed);
        self.sessions_completed.store(0, Ordering::Relaxed);
    }
}
