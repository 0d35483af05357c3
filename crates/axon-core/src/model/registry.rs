//! Named-model lifecycle.
//!
//! The registry constructs models through its [`ModelFactory`], initializes
//! them, and hands out shared [`ModelRef`]s. A model stays loaded for at
//! least as long as any task references it: unload checks the reference
//! count and refuses while handles are outstanding.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{LoadOptions, ModelFactory, ModelRef};

/// A loaded model and the information needed to reload it.
pub struct ModelEntry {
    pub model: ModelRef,
    pub factory_key: String,
    pub source_path: PathBuf,
    pub load_options: LoadOptions,
    pub load_time: Instant,
}

/// Keyed store of loaded models.
pub struct ModelRegistry {
    factory: Arc<ModelFactory>,
    models: RwLock<HashMap<String, ModelEntry>>,
}

impl ModelRegistry {
    #[must_use]
    pub fn new(factory: Arc<ModelFactory>) -> Self {
        Self {
            factory,
            models: RwLock::new(HashMap::new()),
        }
    }

    /// The factory this registry constructs models through.
    #[must_use]
    pub fn factory(&self) -> &Arc<ModelFactory> {
        &self.factory
    }

    /// Construct, initialize and store a model under `model_id`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `model_id` is already loaded, `ModelNotFound` if
    /// `factory_key` is unknown; initialization errors propagate verbatim.
    pub fn load(
        &self,
        model_id: impl Into<String>,
        factory_key: impl Into<String>,
        source_path: impl Into<PathBuf>,
        options: LoadOptions,
    ) -> Result<()> {
        let model_id = model_id.into();
        let factory_key = factory_key.into();
        let source_path = source_path.into();

        if self.models.read().contains_key(&model_id) {
            return Err(Error::InvalidArgument(format!(
                "model already loaded: {model_id}"
            )));
        }

        let model = self.construct(&factory_key, &source_path, &options)?;

        let mut models = self.models.write();
        // A racing load may have won; the earlier entry stays.
        if models.contains_key(&model_id) {
            model.shutdown();
            return Err(Error::InvalidArgument(format!(
                "model already loaded: {model_id}"
            )));
        }
        info!(model_id = %model_id, factory_key = %factory_key, "model loaded");
        models.insert(
            model_id,
            ModelEntry {
                model,
                factory_key,
                source_path,
                load_options: options,
                load_time: Instant::now(),
            },
        );
        Ok(())
    }

    /// Shut a model down and remove it.
    ///
    /// # Errors
    ///
    /// `ModelNotFound` if absent; `BusyResource` while tasks still hold the
    /// model.
    pub fn unload(&self, model_id: &str) -> Result<()> {
        let mut models = self.models.write();
        let entry = models
            .get(model_id)
            .ok_or_else(|| Error::ModelNotFound(format!("model not found: {model_id}")))?;
        Self::ensure_exclusive(model_id, &entry.model)?;
        let entry = models.remove(model_id).expect("entry checked above");
        entry.model.shutdown();
        info!(model_id = %model_id, "model unloaded");
        Ok(())
    }

    /// Rebuild a loaded model from its recorded factory key, path and
    /// options. Same busy rule as [`unload`](Self::unload).
    pub fn reload(&self, model_id: &str) -> Result<()> {
        let mut models = self.models.write();
        let (factory_key, source_path, load_options) = {
            let entry = models
                .get(model_id)
                .ok_or_else(|| Error::ModelNotFound(format!("model not found: {model_id}")))?;
            Self::ensure_exclusive(model_id, &entry.model)?;
            (
                entry.factory_key.clone(),
                entry.source_path.clone(),
                entry.load_options.clone(),
            )
        };

        let fresh = self.construct(&factory_key, &source_path, &load_options)?;
        let entry = models.get_mut(model_id).expect("entry checked above");
        entry.model.shutdown();
        entry.model = fresh;
        entry.load_time = Instant::now();
        info!(model_id = %model_id, "model reloaded");
        Ok(())
    }

    /// Shared handle for `model_id`.
    pub fn get(&self, model_id: &str) -> Result<ModelRef> {
        self.models
            .read()
            .get(model_id)
            .map(|entry| Arc::clone(&entry.model))
            .ok_or_else(|| Error::ModelNotFound(format!("model not found: {model_id}")))
    }

    #[must_use]
    pub fn contains(&self, model_id: &str) -> bool {
        self.models.read().contains_key(model_id)
    }

    #[must_use]
    pub fn loaded_models(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.models.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.models.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.read().is_empty()
    }

    /// Unload every model that is not busy.
    ///
    /// # Errors
    ///
    /// `BusyResource` naming the models that were skipped; the rest are
    /// still unloaded.
    pub fn unload_all(&self) -> Result<()> {
        let mut models = self.models.write();
        let mut busy = Vec::new();
        models.retain(|id, entry| {
            if Arc::strong_count(&entry.model) > 1 {
                busy.push(id.clone());
                true
            } else {
                entry.model.shutdown();
                false
            }
        });
        if busy.is_empty() {
            Ok(())
        } else {
            busy.sort();
            warn!(busy = ?busy, "unload_all skipped busy models");
            Err(Error::BusyResource(busy.join(", ")))
        }
    }

    /// Warm every loaded model up with a dummy inference against its
    /// declared input shapes.
    pub fn warmup_all(&self) -> Result<()> {
        let models = self.models.read();
        for (id, entry) in models.iter() {
            debug!(model_id = %id, "warming up");
            entry.model.warmup()?;
        }
        Ok(())
    }

    /// Total resident memory reported by loaded models, in bytes.
    #[must_use]
    pub fn total_memory(&self) -> usize {
        self.models
            .read()
            .values()
            .map(|entry| entry.model.memory_usage())
            .sum()
    }

    fn construct(
        &self,
        factory_key: &str,
        source_path: impl AsRef<Path>,
        options: &LoadOptions,
    ) -> Result<ModelRef> {
        let mut model = self.factory.create(factory_key)?;
        model.initialize(source_path.as_ref(), options)?;
        Ok(Arc::from(model))
    }

    fn ensure_exclusive(model_id: &str, model: &ModelRef) -> Result<()> {
        // One reference is the registry's own; anything beyond that is an
        // in-flight task or a caller-held handle.
        if Arc::strong_count(model) > 1 {
            return Err(Error::BusyResource(format!(
                "model {model_id} is referenced by in-flight tasks"
            )));
        }
        Ok(())
    }
}

impl Drop for ModelRegistry {
    fn drop(&mut self) {
        for entry in self.models.get_mut().values() {
            entry.model.shutdown();
        }
    }
}
