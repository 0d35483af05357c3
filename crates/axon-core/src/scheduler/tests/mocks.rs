//! Mock models for scheduler tests.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::model::{LoadOptions, Model, ModelMetadata, ModelRef};
use crate::tensor::{DataType, Tensor};

/// Shared record of inference invocations: label plus the start and end
/// instants of each call, in start order.
#[derive(Clone, Default)]
pub struct ExecutionLog {
    entries: Arc<Mutex<Vec<(String, Instant, Instant)>>>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, label: &str, start: Instant, end: Instant) {
        self.entries
            .lock()
            .push((label.to_string(), start, end));
    }

    pub fn labels(&self) -> Vec<String> {
        let mut entries = self.entries.lock().clone();
        entries.sort_by_key(|(_, start, _)| *start);
        entries.into_iter().map(|(label, _, _)| label).collect()
    }

    pub fn span(&self, label: &str) -> Option<(Instant, Instant)> {
        self.entries
            .lock()
            .iter()
            .find(|(l, _, _)| l == label)
            .map(|(_, start, end)| (*start, *end))
    }

}

/// A latch a mock inference can block on until the test opens it.
#[derive(Clone, Default)]
pub struct Gate {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        let (lock, cond) = &*self.inner;
        *lock.lock() = true;
        cond.notify_all();
    }

    pub fn wait_open(&self) {
        let (lock, cond) = &*self.inner;
        let mut open = lock.lock();
        while !*open {
            cond.wait(&mut open);
        }
    }
}

/// Configurable stand-in for a backend model.
///
/// Echoes its inputs back as outputs unless told to fail; optionally delays,
/// blocks on a [`Gate`], and records invocations in an [`ExecutionLog`].
pub struct MockModel {
    label: String,
    delay: Duration,
    fail_with: Option<Error>,
    panic_on_infer: bool,
    metadata: ModelMetadata,
    log: Option<ExecutionLog>,
    gate: Option<Gate>,
    initialized: AtomicBool,
    shut_down: AtomicBool,
    infer_calls: Arc<AtomicUsize>,
}

impl MockModel {
    pub fn new() -> Self {
        Self {
            label: "mock".into(),
            delay: Duration::ZERO,
            fail_with: None,
            panic_on_infer: false,
            metadata: ModelMetadata {
                name: "mock".into(),
                version: "1.0.0".into(),
                input_names: vec!["input".into()],
                output_names: vec!["output".into()],
                input_shapes: vec![vec![-1, 4]],
                output_shapes: vec![vec![-1, 4]],
                input_dtypes: vec![DataType::Float32],
                output_dtypes: vec![DataType::Float32],
                ..ModelMetadata::default()
            },
            log: None,
            gate: None,
            initialized: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            infer_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_failure(mut self, error: Error) -> Self {
        self.fail_with = Some(error);
        self
    }

    pub fn with_panic(mut self) -> Self {
        self.panic_on_infer = true;
        self
    }

    pub fn with_log(mut self, log: ExecutionLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn infer_call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.infer_calls)
    }

    pub fn into_ref(self) -> ModelRef {
        Arc::new(self)
    }
}

impl Default for MockModel {
    fn default() -> Self {
        Self::new()
    }
}

impl Model for MockModel {
    fn initialize(&mut self, _path: &Path, _options: &LoadOptions) -> Result<()> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn infer(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let start = Instant::now();
        self.infer_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.wait_open();
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.panic_on_infer {
            panic!("mock backend panic");
        }
        let outcome = match &self.fail_with {
            Some(error) => Err(error.clone()),
            None => Ok(inputs.to_vec()),
        };
        if let Some(log) = &self.log {
            log.record(&self.label, start, Instant::now());
        }
        outcome
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }

    fn metadata(&self) -> ModelMetadata {
        self.metadata.clone()
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn memory_usage(&self) -> usize {
        1024
    }
}
