use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

/// Global runtime metrics for the monitor.
///
/// Purpose:
/// - Track live workers and their churn
/// - Track poll / write throughput and failures
/// - Track config reload health
///
/// Design:
/// - Lock-free (Atomics)
/// - Observability only, nothing reads these to make decisions
#[derive(Default)]
pub struct RuntimeMetrics {
    // Workers
    pub workers_active: AtomicUsize,
    pub workers_started: AtomicUsize,
    pub workers_stopped: AtomicUsize,
    pub workers_abandoned: AtomicUsize,
    pub resolve_failures: AtomicUsize,

    // Throughput
    pub polls_ok: AtomicUsize,
    pub poll_errors: AtomicUsize,
    pub observations_written: AtomicUsize,
    pub write_errors: AtomicUsize,

    // Config
    pub config_reloads: AtomicUsize,
    pub config_errors: AtomicUsize,
}

impl RuntimeMetrics {
    pub fn incr(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturating decrement, the active gauge never wraps.
    pub fn decr(counter: &AtomicUsize) {
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// One-line summary for the periodic reporter.
    pub fn summary(&self) -> String {
        format!(
            "workers={} started={} stopped={} abandoned={} resolve_err={} polls={} poll_err={} written={} write_err={} reloads={} config_err={}",
            self.workers_active.load(Ordering::Relaxed),
            self.workers_started.load(Ordering::Relaxed),
            self.workers_stopped.load(Ordering::Relaxed),
            self.workers_abandoned.load(Ordering::Relaxed),
            self.resolve_failures.load(Ordering::Relaxed),
            self.polls_ok.load(Ordering::Relaxed),
            self.poll_errors.load(Ordering::Relaxed),
            self.observations_written.load(Ordering::Relaxed),
            self.write_errors.load(Ordering::Relaxed),
            self.config_reloads.load(Ordering::Relaxed),
            self.config_errors.load(Ordering::Relaxed),
        )
    }
}

/// Global metrics registry (singleton)
pub static METRICS: Lazy<Arc<RuntimeMetrics>> =
    Lazy::new(|| Arc::new(RuntimeMetrics::default()));
