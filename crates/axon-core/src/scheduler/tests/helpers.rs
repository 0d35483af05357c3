//! Helpers shared by scheduler tests.

use std::time::{Duration, Instant};

use crate::config::SchedulerConfig;
use crate::tensor::{DataType, Device, Tensor};

/// Small deterministic configuration for tests.
pub fn test_config(num_threads: usize) -> SchedulerConfig {
    SchedulerConfig::new()
        .with_num_threads(num_threads)
        .with_max_queue_size(64)
}

/// A `[1, 4]` float tensor matching [`MockModel`](super::MockModel)'s
/// default metadata.
pub fn input() -> Tensor {
    Tensor::zeros(vec![1, 4], DataType::Float32, Device::Cpu).expect("static shape")
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !cond() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    true
}
