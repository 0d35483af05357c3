//! Scheduling core for multi-model inference serving.
//!
//! The crate accepts inference requests against named models, orders them by
//! priority and inter-task dependencies, dispatches them across a fixed
//! worker pool and delivers results back through wait handles and callbacks.
//! Backends plug in by implementing [`Model`] and registering a constructor
//! with a [`ModelFactory`]; loaded instances live in a [`ModelRegistry`]
//! and are shared with in-flight tasks.
//!
//! ```no_run
//! use std::sync::Arc;
//! use axon_core::{
//!     LoadOptions, ModelFactory, ModelRegistry, Priority, Scheduler, SchedulerConfig,
//! };
//!
//! # fn demo(factory: Arc<ModelFactory>, input: axon_core::Tensor) -> axon_core::Result<()> {
//! let registry = ModelRegistry::new(factory);
//! registry.load("detector", "yolov8", "/models/yolov8.engine", LoadOptions::new())?;
//!
//! let scheduler = Scheduler::new(SchedulerConfig::default())?;
//! scheduler.start()?;
//!
//! let model = registry.get("detector")?;
//! let id = scheduler.submit(model, vec![input], Priority::High, None)?;
//! let result = scheduler.wait(id, None)?;
//! assert!(result.is_ok());
//! scheduler.stop();
//! # Ok(())
//! # }
//! ```

#![warn(clippy::cast_lossless)]

pub mod config;
pub mod error;
pub mod model;
pub mod scheduler;
pub mod tensor;

pub use config::SchedulerConfig;
pub use error::{Error, Result};
pub use model::{LoadOptions, Model, ModelFactory, ModelMetadata, ModelRef, ModelRegistry};
pub use scheduler::{
    Priority, Scheduler, StatsSnapshot, TaskCallback, TaskId, TaskOptions, TaskResult, TaskStatus,
    WorkerPool,
};
pub use tensor::{DataType, Device, Shape, Tensor};
