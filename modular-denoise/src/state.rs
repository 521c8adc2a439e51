//! Per-generation state: the persistent module store and the progress snapshot.

use std::collections::{HashMap, HashSet};

use candle::Tensor;

/// Generation-scoped tensor cache keyed by `(module_id, tag)`.
///
/// Created empty when a generation starts and dropped when it ends. Entries are written on first
/// access and only read afterwards.
#[derive(Debug, Default)]
pub struct PersistentStore {
    entries: HashMap<(String, String), Tensor>,
    notices: HashSet<String>,
}

impl PersistentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, module_id: &str, tag: &str) -> Option<&Tensor> {
        self.entries.get(&(module_id.to_string(), tag.to_string()))
    }

    pub fn insert(&mut self, module_id: &str, tag: &str, tensor: Tensor) {
        self.entries.insert((module_id.to_string(), tag.to_string()), tensor);
    }

    /// Return the cached tensor, computing and storing it on first access.
    pub fn get_or_try_insert_with<E>(
        &mut self,
        module_id: &str,
        tag: &str,
        init: impl FnOnce() -> Result<Tensor, E>,
    ) -> Result<Tensor, E> {
        let key = (module_id.to_string(), tag.to_string());
        if let Some(tensor) = self.entries.get(&key) {
            return Ok(tensor.clone());
        }
        let tensor = init()?;
        tracing::debug!(module_id, tag, "cached persistent module data");
        self.entries.insert(key, tensor.clone());
        Ok(tensor)
    }

    /// `true` the first time `key` is seen in this generation. Used to report a condition once
    /// per run instead of once per tile and timestep.
    pub fn first_notice(&mut self, key: &str) -> bool {
        self.notices.insert(key.to_string())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Snapshot handed to the step callback and to extension hooks after every timestep.
#[derive(Debug, Clone)]
pub struct PipelineIntermediateState {
    pub step: usize,
    pub order: usize,
    pub total_steps: usize,
    pub timestep: f64,
    pub latents: Tensor,
    pub predicted_original: Option<Tensor>,
}
