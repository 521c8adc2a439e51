//! Configuration types shared across the pipeline.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Spatial factor between image space and latent space.
pub const LATENT_SCALE_FACTOR: usize = 8;

/// Open keyword-argument mapping carried by a module descriptor.
pub type ModuleKwargs = serde_json::Map<String, serde_json::Value>;

/// Parse an open kwargs mapping into a module's typed configuration.
///
/// A missing mapping parses like an empty one, so every field with a default may be omitted.
pub fn parse_kwargs<T: DeserializeOwned>(kwargs: Option<&ModuleKwargs>) -> Result<T> {
    // Deserialized straight from the borrowed map: trees are resolved once per tile.
    let config = match kwargs {
        Some(kwargs) => T::deserialize(kwargs)?,
        None => T::deserialize(&ModuleKwargs::new())?,
    };
    Ok(config)
}

/// Serialize a typed configuration back into an open kwargs mapping.
pub fn to_kwargs<T: Serialize>(config: &T) -> Result<ModuleKwargs> {
    match serde_json::to_value(config)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(crate::Error::config(format!(
            "module kwargs must serialize to an object, got {other}"
        ))),
    }
}

/// Flow-matching scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of training timesteps (default: 1000).
    #[serde(default = "default_num_train_timesteps")]
    pub num_train_timesteps: usize,

    /// Whether to shift sigmas depending on the latent size (default: false).
    #[serde(default)]
    pub use_dynamic_shifting: bool,

    /// Shift used when dynamic shifting is on and no `mu` is given (default: 0.5).
    #[serde(default = "default_base_shift")]
    pub base_shift: f64,

    /// Shift reached at `max_image_seq_len` (default: 1.15).
    #[serde(default = "default_max_shift")]
    pub max_shift: f64,

    #[serde(default = "default_base_image_seq_len")]
    pub base_image_seq_len: usize,

    #[serde(default = "default_max_image_seq_len")]
    pub max_image_seq_len: usize,
}

fn default_num_train_timesteps() -> usize {
    1000
}
fn default_base_shift() -> f64 {
    0.5
}
fn default_max_shift() -> f64 {
    1.15
}
fn default_base_image_seq_len() -> usize {
    256
}
fn default_max_image_seq_len() -> usize {
    4096
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: default_num_train_timesteps(),
            use_dynamic_shifting: false,
            base_shift: default_base_shift(),
            max_shift: default_max_shift(),
            base_image_seq_len: default_base_image_seq_len(),
            max_image_seq_len: default_max_image_seq_len(),
        }
    }
}
