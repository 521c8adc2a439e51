//! Noise-prediction modules.
//!
//! A module turns the current sample into either a noise prediction or a full scheduler step.
//! Composite modules resolve their children from descriptors at every call and combine what they
//! return:
//!
//! - [`StandardStep`]: model forward pass, guidance, one pure scheduler step (the leaf default)
//! - [`MultiDiffusion`]: tiled evaluation with overlap averaging
//! - [`DilatedSampling`]: interlaced low-resolution evaluation
//! - [`CosineDecayTransfer`] / [`LinearTransfer`]: blend two children over time
//! - [`ColorGuidance`]: channel-mean correction of a child's prediction
//! - [`SkipResidual`]: synthetic re-noising of a fixed latent
//!
//! Modules never advance the scheduler. The driver commits exactly one step per timestep.

use candle::Tensor;
use rand::rngs::StdRng;

use crate::conditioning::{ConditioningData, ControlNetData, DenoiseModel, StepProgress, T2IAdapterData};
use crate::config::ModuleKwargs;
use crate::latents::LatentStore;
use crate::ops;
use crate::registry::{ModuleDescriptor, ModuleRegistry};
use crate::scheduler::{Scheduler, StepOutput};
use crate::state::PersistentStore;
use crate::{Error, Result};

pub mod color_guidance;
pub mod dilated;
pub mod multidiffusion;
pub mod skip_residual;
pub mod standard;
pub mod transfer;

pub use color_guidance::{ChannelSelection, ColorGuidance, ColorGuidanceConfig};
pub use dilated::{DilatedSampling, DilatedSamplingConfig};
pub use multidiffusion::{MultiDiffusion, MultiDiffusionConfig, TiledDenoiseConfig};
pub use skip_residual::{SkipResidual, SkipResidualConfig};
pub use standard::StandardStep;
pub use transfer::{CosineDecayTransfer, CosineDecayTransferConfig, LinearTransfer, LinearTransferConfig};

/// Everything a module may use besides its own input.
///
/// The scheduler is only reachable through a shared reference, so no module can move it.
pub struct ModuleContext<'a> {
    pub scheduler: &'a dyn Scheduler,
    pub model: &'a dyn DenoiseModel,
    pub conditioning: &'a ConditioningData,
    pub registry: &'a ModuleRegistry,
    pub latent_store: &'a dyn LatentStore,
    pub persistent: &'a mut PersistentStore,
    pub rng: &'a mut StdRng,
}

impl ModuleContext<'_> {
    /// Resolve `descriptor` (the standard step when `None`) and evaluate it.
    pub fn run(&mut self, descriptor: Option<&ModuleDescriptor>, input: ModuleInput) -> Result<ModuleOutput> {
        let registry = self.registry;
        let module = registry.resolve(descriptor)?;
        module.step(self, input)
    }

    /// Evaluate a child and reduce its output to a noise prediction.
    pub fn run_noise_prediction(
        &mut self,
        descriptor: Option<&ModuleDescriptor>,
        input: ModuleInput,
    ) -> Result<Tensor> {
        Ok(self.run(descriptor, input)?.noise_prediction())
    }

    /// Evaluate a child and complete its output to a step-output over the input latents.
    pub fn run_step(&mut self, descriptor: Option<&ModuleDescriptor>, input: ModuleInput) -> Result<StepOutput> {
        let latents = input.latents.clone();
        let timestep = input.timestep;
        self.run(descriptor, input)?
            .into_step_output(self.scheduler, timestep, &latents)
    }
}

/// Per-call input of a module. Composite modules derive a child's input from their own, e.g.
/// cropped to a tile.
#[derive(Debug, Clone)]
pub struct ModuleInput {
    /// The running latent the scheduler steps from.
    pub latents: Tensor,
    /// The model input, i.e. the scaled (and possibly transformed) latent.
    pub sample: Tensor,
    pub timestep: f64,
    pub step_index: usize,
    pub total_step_count: usize,
    pub control_data: Option<Vec<ControlNetData>>,
    pub t2i_adapter_data: Option<Vec<T2IAdapterData>>,
}

impl ModuleInput {
    pub fn progress(&self) -> StepProgress {
        StepProgress {
            step_index: self.step_index,
            total_step_count: self.total_step_count,
        }
    }

    /// Same step position, new tensors and side channels.
    pub fn derive(
        &self,
        latents: Tensor,
        sample: Tensor,
        control_data: Option<Vec<ControlNetData>>,
        t2i_adapter_data: Option<Vec<T2IAdapterData>>,
    ) -> Self {
        Self {
            latents,
            sample,
            timestep: self.timestep,
            step_index: self.step_index,
            total_step_count: self.total_step_count,
            control_data,
            t2i_adapter_data,
        }
    }
}

/// What a module returns.
#[derive(Debug, Clone)]
pub enum ModuleOutput {
    NoisePrediction(Tensor),
    Step(StepOutput),
}

impl ModuleOutput {
    pub fn dims(&self) -> &[usize] {
        match self {
            Self::NoisePrediction(t) => t.dims(),
            Self::Step(s) => s.prev_sample.dims(),
        }
    }

    pub fn noise_prediction(self) -> Tensor {
        match self {
            Self::NoisePrediction(t) => t,
            Self::Step(s) => s.noise_pred,
        }
    }

    /// A noise prediction becomes a step-output through a pure scheduler step on `latents`.
    pub fn into_step_output(self, scheduler: &dyn Scheduler, timestep: f64, latents: &Tensor) -> Result<StepOutput> {
        match self {
            Self::Step(s) => Ok(s),
            Self::NoisePrediction(noise_pred) => {
                if noise_pred.dims() != latents.dims() {
                    return Err(Error::shape_mismatch("noise prediction", latents.dims(), noise_pred.dims()));
                }
                scheduler.step(&noise_pred, timestep, latents)
            }
        }
    }

    /// `lerp(self, other, weight)`. Two noise predictions blend directly; otherwise both sides are
    /// completed to step-outputs and every field is blended.
    pub fn lerp(
        self,
        other: Self,
        weight: f64,
        scheduler: &dyn Scheduler,
        timestep: f64,
        latents: &Tensor,
    ) -> Result<Self> {
        match (self, other) {
            (Self::NoisePrediction(a), Self::NoisePrediction(b)) => Ok(Self::NoisePrediction(ops::lerp(&a, &b, weight)?)),
            (a, b) => {
                let a = a.into_step_output(scheduler, timestep, latents)?;
                let b = b.into_step_output(scheduler, timestep, latents)?;
                Ok(Self::Step(StepOutput {
                    prev_sample: ops::lerp(&a.prev_sample, &b.prev_sample, weight)?,
                    pred_original_sample: ops::lerp(&a.pred_original_sample, &b.pred_original_sample, weight)?,
                    noise_pred: ops::lerp(&a.noise_pred, &b.noise_pred, weight)?,
                }))
            }
        }
    }
}

/// A node of the module tree.
pub trait NoisePredictionModule {
    fn step(&self, ctx: &mut ModuleContext<'_>, input: ModuleInput) -> Result<ModuleOutput>;
}

/// A module type with a registry key, built from descriptor kwargs.
pub trait RegisteredModule: NoisePredictionModule + Sized + 'static {
    const KEY: &'static str;

    fn from_kwargs(kwargs: Option<&ModuleKwargs>) -> Result<Self>;
}
