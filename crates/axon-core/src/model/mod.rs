//! Model capability surface.
//!
//! A model is anything that can run `infer(inputs) -> outputs`. Backends
//! implement [`Model`], register a constructor with a [`ModelFactory`], and
//! the [`ModelRegistry`] owns loaded instances by name. The scheduler only
//! ever sees a shared [`ModelRef`].

mod factory;
mod registry;

pub use factory::ModelFactory;
pub use registry::{ModelEntry, ModelRegistry};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::tensor::{DataType, Device, Shape, Tensor};

/// Static description of a model's interface. `-1` in a shape marks a
/// dynamic dimension.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub name: String,
    pub version: String,
    pub description: String,
    pub input_names: Vec<String>,
    pub output_names: Vec<String>,
    pub input_shapes: Vec<Shape>,
    pub output_shapes: Vec<Shape>,
    pub input_dtypes: Vec<DataType>,
    pub output_dtypes: Vec<DataType>,
}

/// Options applied when a model is loaded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadOptions {
    /// Device the model should execute on.
    #[serde(default)]
    pub device: Device,

    /// Backend-level deadline hint for a single inference.
    #[serde(default)]
    pub timeout: Option<Duration>,

    /// Ask the backend to record per-layer timings.
    #[serde(default)]
    pub enable_profiling: bool,

    /// Preferred batch size for backends that pre-allocate.
    #[serde(default)]
    pub batch_size: Option<usize>,
}

impl LoadOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }
}

/// Inference capability implemented by external backends.
///
/// `initialize` runs once on the still-unshared instance; after the registry
/// wraps the model in an `Arc` only `&self` methods are called, so any
/// mutable execution state belongs behind the backend's own interior
/// mutability.
pub trait Model: Send + Sync {
    /// Bind the model to its weights and device. Called exactly once,
    /// before the instance is shared.
    fn initialize(&mut self, path: &Path, options: &LoadOptions) -> Result<()>;

    /// Run a single synchronous inference.
    fn infer(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>>;

    /// Release backend resources. Called by the registry during unload.
    fn shutdown(&self);

    fn metadata(&self) -> ModelMetadata;

    fn is_initialized(&self) -> bool;

    /// Resident memory attributed to this model, in bytes.
    fn memory_usage(&self) -> usize;

    /// Exercise the execution path once with dummy inputs built from the
    /// declared shapes (dynamic dimensions clamped to 1).
    fn warmup(&self) -> Result<()> {
        let inputs = dummy_inputs(&self.metadata())?;
        self.infer(&inputs).map(|_| ())
    }

    /// Check inputs against the declared metadata: arity, dtype, and strict
    /// equality on every dimension past the batch dimension (index 0),
    /// which is the only one allowed to vary. Backends with other dynamic
    /// axes override this.
    fn validate_inputs(&self, inputs: &[Tensor]) -> bool {
        let meta = self.metadata();
        if inputs.len() != meta.input_shapes.len() || inputs.len() != meta.input_dtypes.len() {
            return false;
        }
        for (i, input) in inputs.iter().enumerate() {
            if input.dtype() != meta.input_dtypes[i] {
                return false;
            }
            let shape = input.shape();
            let expected = &meta.input_shapes[i];
            if shape.len() != expected.len() {
                return false;
            }
            // Dimension 0 is the batch dimension and may vary freely; the
            // rest must match exactly.
            for j in 1..shape.len() {
                if shape[j] != expected[j] {
                    return false;
                }
            }
        }
        true
    }
}

/// Shared handle to a loaded model. The registry keeps one reference; every
/// in-flight task referencing the model keeps another, which is what lets
/// the registry refuse to unload a busy model.
pub type ModelRef = Arc<dyn Model>;

fn dummy_inputs(meta: &ModelMetadata) -> Result<Vec<Tensor>> {
    meta.input_shapes
        .iter()
        .zip(meta.input_dtypes.iter())
        .map(|(shape, &dtype)| {
            let concrete: Shape = shape.iter().map(|&d| if d < 0 { 1 } else { d }).collect();
            Tensor::zeros(concrete, dtype, Device::Cpu)
        })
        .collect()
}
