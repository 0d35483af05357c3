//! Keyed model constructors.
//!
//! Backends register a constructor under a string key at process init; the
//! registry looks the key up when loading a model. The factory is an
//! explicit object rather than process-global state so tests (and embedders
//! running several isolated stacks) can each hold their own.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::Model;

/// Constructor for an unbound model instance.
pub type ModelCtor = Box<dyn Fn() -> Box<dyn Model> + Send + Sync>;

/// Registry of model constructors, keyed by backend-chosen type names.
#[derive(Default)]
pub struct ModelFactory {
    ctors: RwLock<HashMap<String, ModelCtor>>,
}

impl ModelFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor under `key`. Returns `false` if the key is
    /// already taken (the existing registration wins).
    pub fn register(
        &self,
        key: impl Into<String>,
        ctor: impl Fn() -> Box<dyn Model> + Send + Sync + 'static,
    ) -> bool {
        let key = key.into();
        let mut ctors = self.ctors.write();
        if ctors.contains_key(&key) {
            return false;
        }
        debug!(factory_key = %key, "model constructor registered");
        ctors.insert(key, Box::new(ctor));
        true
    }

    /// Remove a registration. Returns `false` if the key was unknown.
    pub fn unregister(&self, key: &str) -> bool {
        self.ctors.write().remove(key).is_some()
    }

    #[must_use]
    pub fn is_registered(&self, key: &str) -> bool {
        self.ctors.read().contains_key(key)
    }

    /// Construct an unbound model for `key`.
    pub fn create(&self, key: &str) -> Result<Box<dyn Model>> {
        let ctors = self.ctors.read();
        let ctor = ctors
            .get(key)
            .ok_or_else(|| Error::ModelNotFound(format!("factory key {key:?} not registered")))?;
        Ok(ctor())
    }

    #[must_use]
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.ctors.read().keys().cloned().collect();
        types.sort();
        types
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ctors.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ctors.read().is_empty()
    }
}
