//! Module descriptors and the key-to-constructor registry.
//!
//! Descriptors are plain data and are never validated ahead of evaluation. A descriptor is
//! resolved each time its parent evaluates it, so an unknown key surfaces as a configuration
//! error on first use.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::ModuleKwargs;
use crate::modules::{
    ColorGuidance, CosineDecayTransfer, DilatedSampling, LinearTransfer, MultiDiffusion, NoisePredictionModule,
    RegisteredModule, SkipResidual, StandardStep,
};
use crate::{config_bail, Result};

/// The only module category the denoise loop consumes.
pub const UNET_STEP_MODULE_TYPE: &str = "do_unet_step";

/// Serialized reference to a module and its parameters. `module_kwargs` may embed further
/// descriptors, which makes a descriptor the root of a module tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub name: String,
    pub module_type: String,
    pub module: String,
    #[serde(default)]
    pub module_kwargs: Option<ModuleKwargs>,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>, module: impl Into<String>, module_kwargs: ModuleKwargs) -> Self {
        Self {
            name: name.into(),
            module_type: UNET_STEP_MODULE_TYPE.to_string(),
            module: module.into(),
            module_kwargs: Some(module_kwargs),
        }
    }
}

pub type ModuleFactory = Box<dyn Fn(Option<&ModuleKwargs>) -> Result<Box<dyn NoisePredictionModule>>>;

/// Mapping from registry key to module constructor.
pub struct ModuleRegistry {
    factories: BTreeMap<String, ModuleFactory>,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("keys", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ModuleRegistry {
    /// A registry with no modules, not even the standard step.
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// A registry holding every built-in module.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register::<StandardStep>();
        registry.register::<MultiDiffusion>();
        registry.register::<DilatedSampling>();
        registry.register::<CosineDecayTransfer>();
        registry.register::<LinearTransfer>();
        registry.register::<ColorGuidance>();
        registry.register::<SkipResidual>();
        registry
    }

    pub fn register<T: RegisteredModule>(&mut self) {
        self.register_factory(T::KEY, |kwargs| {
            Ok(Box::new(T::from_kwargs(kwargs)?) as Box<dyn NoisePredictionModule>)
        });
    }

    /// Register a constructor under `key`, replacing any previous one.
    pub fn register_factory<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn(Option<&ModuleKwargs>) -> Result<Box<dyn NoisePredictionModule>> + 'static,
    {
        self.factories.insert(key.into(), Box::new(factory));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Build the module a descriptor names. `None` resolves to the standard step.
    pub fn resolve(&self, descriptor: Option<&ModuleDescriptor>) -> Result<Box<dyn NoisePredictionModule>> {
        let (key, kwargs) = match descriptor {
            None => (StandardStep::KEY, None),
            Some(d) => {
                if d.module_type != UNET_STEP_MODULE_TYPE {
                    config_bail!(
                        "module '{}' has type '{}', expected '{UNET_STEP_MODULE_TYPE}'",
                        d.name,
                        d.module_type
                    )
                }
                (d.module.as_str(), d.module_kwargs.as_ref())
            }
        };
        let Some(factory) = self.factories.get(key) else {
            config_bail!("unknown noise prediction module '{key}'")
        };
        tracing::trace!(module = key, "resolved module");
        factory(kwargs)
    }
}
