//! Scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

fn default_num_threads() -> usize {
    num_cpus::get()
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_retention() -> Duration {
    Duration::from_secs(300)
}

/// Configuration for [`Scheduler`](crate::scheduler::Scheduler).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of worker threads (default: available parallelism).
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,

    /// Bound on the ready queue; submissions beyond it fail with `QueueFull`.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Default per-task deadline, overridable per submission. `None` means
    /// no deadline.
    #[serde(default)]
    pub task_timeout: Option<Duration>,

    /// How long terminal tasks are retained for late waiters before reaping.
    #[serde(default = "default_retention")]
    pub retention: Duration,

    /// Record per-section timings (queue wait) in the statistics.
    #[serde(default)]
    pub enable_profiling: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_threads: default_num_threads(),
            max_queue_size: default_max_queue_size(),
            task_timeout: None,
            retention: default_retention(),
            enable_profiling: false,
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    #[must_use]
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    #[must_use]
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    #[must_use]
    pub fn with_profiling(mut self, enable: bool) -> Self {
        self.enable_profiling = enable;
        self
    }

    /// Reject configurations the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.num_threads == 0 {
            return Err(Error::InvalidArgument(
                "num_threads must be at least 1".into(),
            ));
        }
        if self.max_queue_size == 0 {
            return Err(Error::InvalidArgument(
                "max_queue_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert!(config.num_threads > 0);
        assert_eq!(config.max_queue_size, 1000);
        assert_eq!(config.task_timeout, None);
        assert_eq!(config.retention, Duration::from_secs(300));
        assert!(!config.enable_profiling);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = SchedulerConfig::new()
            .with_num_threads(4)
            .with_max_queue_size(64)
            .with_task_timeout(Duration::from_millis(250))
            .with_profiling(true);
        assert_eq!(config.num_threads, 4);
        assert_eq!(config.max_queue_size, 64);
        assert_eq!(config.task_timeout, Some(Duration::from_millis(250)));
        assert!(config.enable_profiling);
    }

    #[test]
    fn test_validate_rejects_zero_threads() {
        let config = SchedulerConfig::new().with_num_threads(0);
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_queue() {
        let config = SchedulerConfig::new().with_max_queue_size(0);
        assert!(config.validate().is_err());
    }
}
