//! Global atomic counters for the validation engine.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (the scheduler does this when a batch seals).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocation and no locking.
pub struct Metrics {
    environments_started: AtomicU64,
    environment_start_failures: AtomicU64,
    teardowns: AtomicU64,
    teardown_failures: AtomicU64,
    outcomes_recorded: AtomicU64,
    timeouts: AtomicU64,
    peak_in_use: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            environments_started: AtomicU64::new(0),
            environment_start_failures: AtomicU64::new(0),
            teardowns: AtomicU64::new(0),
            teardown_failures: AtomicU64::new(0),
            outcomes_recorded: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            peak_in_use: AtomicU64::new(0),
        }
    }

    pub fn inc_environments_started(&self) {
        self.environments_started.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "environments_started", "counter incremented");
    }

    pub fn inc_environment_start_failures(&self) {
        self.environment_start_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "environment_start_failures", "counter incremented");
    }

    pub fn inc_teardowns(&self) {
        self.teardowns.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "teardowns", "counter incremented");
    }

    pub fn inc_teardown_failures(&self) {
        self.teardown_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "teardown_failures", "counter incremented");
    }

    pub fn inc_outcomes_recorded(&self) {
        self.outcomes_recorded.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "outcomes_recorded", "counter incremented");
    }

    pub fn inc_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "timeouts", "counter incremented");
    }

    /// Raise the peak gauge to `observed` if it is higher.
    pub fn observe_in_use(&self, observed: u64) {
        self.peak_in_use.fetch_max(observed, Ordering::Relaxed);
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            environments_started = self.environments_started(),
            environment_start_failures = self.environment_start_failures(),
            teardowns = self.teardowns(),
            teardown_failures = self.teardown_failures(),
            outcomes_recorded = self.outcomes_recorded(),
            timeouts = self.timeouts(),
            peak_in_use = self.peak_in_use(),
        );
    }

    pub fn environments_started(&self) -> u64 {
        self.environments_started.load(Ordering::Relaxed)
    }

    pub fn environment_start_failures(&self) -> u64 {
        self.environment_start_failures.load(Ordering::Relaxed)
    }

    pub fn teardowns(&self) -> u64 {
        self.teardowns.load(Ordering::Relaxed)
    }

    pub fn teardown_failures(&self) -> u64 {
        self.teardown_failures.load(Ordering::Relaxed)
    }

    pub fn outcomes_recorded(&self) -> u64 {
        self.outcomes_recorded.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn peak_in_use(&self) -> u64 {
        self.peak_in_use.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.environments_started,
            &self.environment_start_failures,
            &self.teardowns,
            &self.teardown_failures,
            &self.outcomes_recorded,
            &self.timeouts,
            &self.peak_in_use,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
