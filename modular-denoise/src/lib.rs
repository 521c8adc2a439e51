//! Modular noise prediction for latent diffusion.
//!
//! The denoising step function is a tree of interchangeable modules described by serializable
//! [`ModuleDescriptor`]s. Leaves run the model and a scheduler step; composite nodes tile the
//! latent ([`modules::MultiDiffusion`]), interlace it ([`modules::DilatedSampling`]), blend two
//! subtrees over time ([`modules::CosineDecayTransfer`], [`modules::LinearTransfer`]) or
//! post-process a prediction ([`modules::ColorGuidance`], [`modules::SkipResidual`]).
//!
//! # Architecture
//!
//! ```text
//! DenoiseDriver (owns scheduler, advances it once per timestep)
//!   └── ModuleRegistry::resolve(descriptor) -> Box<dyn NoisePredictionModule>
//!         ├── MultiDiffusion: views -> sub-module per tile -> AccumulationBuffers
//!         ├── DilatedSampling: blur -> interlace -> sub-module per phase -> deinterlace
//!         ├── transfers: sub-module 1, sub-module 2 -> lerp
//!         └── StandardStep: ControlNet/T2I residuals -> model -> guidance -> pure step
//! ```
//!
//! # Example
//!
//! ```ignore
//! use modular_denoise::modules::{DilatedSamplingConfig, CosineDecayTransferConfig, MultiDiffusionConfig};
//!
//! let tree = CosineDecayTransferConfig {
//!     sub_module_1: Some(MultiDiffusionConfig::default().descriptor()?),
//!     sub_module_2: Some(DilatedSamplingConfig::default().descriptor()?),
//!     decay_rate: 3.0,
//! }
//! .descriptor()?;
//!
//! let registry = ModuleRegistry::new();
//! let driver = DenoiseDriver::new(&model, &registry, &store);
//! let mut inputs = DenoiseInputs::new(conditioning, 30);
//! inputs.noise = Some(SeededLatents::new(noise, Some(42)));
//! inputs.module = Some(tree);
//! let latents = driver.invoke(inputs, Box::new(scheduler), |_| Ok(()))?;
//! ```

pub mod conditioning;
pub mod config;
pub mod debug;
pub mod driver;
pub mod error;
pub mod extensions;
pub mod latents;
pub mod modules;
pub mod ops;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod stitch;
pub mod views;

pub use conditioning::{ConditioningData, ControlNetData, DenoiseModel, GuidanceScale, StepValue, T2IAdapterData};
pub use config::{ModuleKwargs, SchedulerConfig};
pub use driver::{DenoiseData, DenoiseDriver, DenoiseInputs, SeededLatents};
pub use error::{Error, Result};
pub use extensions::{Extension, ExtensionHandler};
pub use latents::{LatentStore, LatentsField, MemoryLatentStore, SafetensorsLatentStore};
pub use modules::{ModuleContext, ModuleInput, ModuleOutput, NoisePredictionModule, RegisteredModule};
pub use registry::{ModuleDescriptor, ModuleRegistry};
pub use scheduler::{FlowMatchEulerDiscreteScheduler, Scheduler, StepOutput};
pub use state::{PersistentStore, PipelineIntermediateState};
pub use views::{get_jittered_views, get_views, View};
