//! Scheduler statistics.
//!
//! Counters are monotonic atomics updated from worker threads without
//! locking; a snapshot materializes the derived averages.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Lock-free counters owned by the scheduler.
#[derive(Default)]
pub(crate) struct SchedulerStats {
    total_submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    total_execution_time_ns: AtomicU64,
    total_queue_wait_ns: AtomicU64,
}

impl SchedulerStats {
    pub(crate) fn record_submitted(&self, count: u64) {
        self.total_submitted.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self, execution_time: Duration) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.total_execution_time_ns
            .fetch_add(execution_time.as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_queue_wait(&self, wait: Duration) {
        self.total_queue_wait_ns
            .fetch_add(wait.as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn reset(&self) {
        self.total_submitted.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.cancelled.store(0, Ordering::Relaxed);
        self.total_execution_time_ns.store(0, Ordering::Relaxed);
        self.total_queue_wait_ns.store(0, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, profiling: bool) -> StatsSnapshot {
        let completed = self.completed.load(Ordering::Relaxed);
        let total_execution_time =
            Duration::from_nanos(self.total_execution_time_ns.load(Ordering::Relaxed));
        let average_execution_time_ms = if completed == 0 {
            0.0
        } else {
            total_execution_time.as_secs_f64() * 1000.0 / completed as f64
        };
        let average_queue_wait_ms = profiling.then(|| {
            let started = completed + self.failed.load(Ordering::Relaxed);
            if started == 0 {
                0.0
            } else {
                Duration::from_nanos(self.total_queue_wait_ns.load(Ordering::Relaxed))
                    .as_secs_f64()
                    * 1000.0
                    / started as f64
            }
        });
        StatsSnapshot {
            total_submitted: self.total_submitted.load(Ordering::Relaxed),
            completed,
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            total_execution_time,
            average_execution_time_ms,
            average_queue_wait_ms,
        }
    }
}

/// Point-in-time view of the scheduler's counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Accumulated wall time of completed inferences.
    pub total_execution_time: Duration,
    pub average_execution_time_ms: f64,
    /// Mean time tasks spent in the ready queue; present only when
    /// profiling is enabled.
    pub average_queue_wait_ms: Option<f64>,
}
