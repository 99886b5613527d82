// Runtime metrics module
//
// Provides lightweight counters for monitoring the executor and its workers

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::future::{FutureError, FutureState};

/// Global runtime metrics
///
/// Uses atomic operations for thread-safe metric tracking without locks.
/// Metrics are collected throughout the process lifecycle and can be
/// logged periodically or on shutdown.
#[derive(Debug)]
pub struct Metrics {
    /// Work items accepted by an executor
    pub futures_submitted: AtomicU64,

    /// Futures that finished with a value
    pub futures_completed: AtomicU64,

    /// Futures that finished with an error
    pub futures_failed: AtomicU64,

    /// Futures cancelled before they ran
    pub futures_cancelled: AtomicU64,

    /// Done callbacks or state observers that panicked
    pub callback_failures: AtomicU64,

    /// Tasks handed from the depot to a worker
    pub task_transfers: AtomicU64,

    /// Bookkeeping errors on worker threads (illegal transitions, lost tasks)
    pub worker_errors: AtomicU64,

    /// Total time spent running work bodies, in microseconds
    pub total_run_time_us: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            futures_submitted: AtomicU64::new(0),
            futures_completed: AtomicU64::new(0),
            futures_failed: AtomicU64::new(0),
            futures_cancelled: AtomicU64::new(0),
            callback_failures: AtomicU64::new(0),
            task_transfers: AtomicU64::new(0),
            worker_errors: AtomicU64::new(0),
            total_run_time_us: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// The process-wide instance
    pub fn global() -> &'static Metrics {
        static GLOBAL: OnceLock<Metrics> = OnceLock::new();
        GLOBAL.get_or_init(Metrics::new)
    }

    pub fn record_submitted(&self) {
        self.futures_submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how a future ended
    pub fn record_outcome(&self, state: FutureState, error: Option<&FutureError>) {
        let counter = match (state, error) {
            (FutureState::Cancelled, _) | (_, Some(FutureError::Cancelled)) => {
                &self.futures_cancelled
            }
            (FutureState::Finished, None) => &self.futures_completed,
            (FutureState::Finished, Some(_)) => &self.futures_failed,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_callback_failure(&self) {
        self.callback_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_transfer(&self) {
        self.task_transfers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_error(&self) {
        self.worker_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how long a work body ran
    pub fn record_run_time(&self, duration: Duration) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.total_run_time_us.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Futures that reached a terminal state
    pub fn futures_done(&self) -> u64 {
        self.futures_completed.load(Ordering::Relaxed)
            + self.futures_failed.load(Ordering::Relaxed)
            + self.futures_cancelled.load(Ordering::Relaxed)
    }

    /// Average run time per executed work body in milliseconds
    pub fn avg_run_time_ms(&self) -> f64 {
        let total = self.total_run_time_us.load(Ordering::Relaxed);
        let count = self.futures_completed.load(Ordering::Relaxed)
            + self.futures_failed.load(Ordering::Relaxed);
        if count > 0 {
            total as f64 / count as f64 / 1000.0
        } else {
            0.0
        }
    }

    /// Log metrics summary
    pub fn log_summary(&self) {
        tracing::info!("=== Runtime Metrics Summary ===");
        tracing::info!("Uptime: {:.2}s", self.uptime().as_secs_f64());
        tracing::info!(
            "Futures: {} submitted, {} completed, {} failed, {} cancelled",
            self.futures_submitted.load(Ordering::Relaxed),
            self.futures_completed.load(Ordering::Relaxed),
            self.futures_failed.load(Ordering::Relaxed),
            self.futures_cancelled.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Total run time: {:.2}s (avg: {:.2}ms per item)",
            self.total_run_time_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            self.avg_run_time_ms()
        );
        tracing::info!(
            "Task transfers: {}, callback failures: {}, worker errors: {}",
            self.task_transfers.load(Ordering::Relaxed),
            self.callback_failures.load(Ordering::Relaxed),
            self.worker_errors.load(Ordering::Relaxed)
        );
    }

    /// Log periodic metrics (for long-running operations)
    pub fn log_periodic(&self) {
        tracing::info!(
            "Metrics: {} of {} futures done, {} task transfers, uptime {:.0}s",
            self.futures_done(),
            self.futures_submitted.load(Ordering::Relaxed),
            self.task_transfers.load(Ordering::Relaxed),
            self.uptime().as_secs_f64()
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
