//! Transfer modules: blend the outputs of two sub-modules evaluated on the same input.

use serde::{Deserialize, Serialize};

use crate::config::{parse_kwargs, to_kwargs, ModuleKwargs};
use crate::registry::ModuleDescriptor;
use crate::{config_bail, Result};

use super::{ModuleContext, ModuleInput, ModuleOutput, NoisePredictionModule, RegisteredModule};

/// `0.5 * (1 + cos(pi * (T - t) / T))`: 1 at `t = T`, 0 at `t = 0`.
pub fn cosine_factor(timestep: f64, num_train_timesteps: usize) -> f64 {
    let total = num_train_timesteps as f64;
    0.5 * (1.0 + (std::f64::consts::PI * (total - timestep) / total).cos())
}

/// Weight of the second sub-module, `1 - cosine_factor^decay_rate`.
pub fn cosine_transfer_weight(timestep: f64, num_train_timesteps: usize, decay_rate: f64) -> f64 {
    1.0 - cosine_factor(timestep, num_train_timesteps).powf(decay_rate)
}

/// Weight of the second sub-module, `clamp((step - start) / (end - start), 0, 1)`.
pub fn linear_transfer_weight(step_index: usize, start_step: usize, end_step: usize) -> f64 {
    let factor = (step_index as f64 - start_step as f64) / (end_step as f64 - start_step as f64);
    factor.clamp(0.0, 1.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CosineDecayTransferConfig {
    #[serde(default)]
    pub sub_module_1: Option<ModuleDescriptor>,
    #[serde(default)]
    pub sub_module_2: Option<ModuleDescriptor>,
    /// Higher values hand over to the second sub-module sooner (default: 1.0).
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f64,
}

fn default_decay_rate() -> f64 {
    1.0
}

impl Default for CosineDecayTransferConfig {
    fn default() -> Self {
        Self {
            sub_module_1: None,
            sub_module_2: None,
            decay_rate: default_decay_rate(),
        }
    }
}

impl CosineDecayTransferConfig {
    pub fn validate(&self) -> Result<()> {
        if self.decay_rate.is_nan() || self.decay_rate < 0.0 {
            config_bail!("decay_rate must be >= 0, got {}", self.decay_rate)
        }
        Ok(())
    }

    pub fn descriptor(&self) -> Result<ModuleDescriptor> {
        self.validate()?;
        Ok(ModuleDescriptor::new(
            "Cosine Decay Transfer module",
            CosineDecayTransfer::KEY,
            to_kwargs(self)?,
        ))
    }
}

/// Smoothly hands over from sub-module 1 to sub-module 2 as the remaining noise decreases.
#[derive(Debug, Clone)]
pub struct CosineDecayTransfer {
    config: CosineDecayTransferConfig,
}

impl RegisteredModule for CosineDecayTransfer {
    const KEY: &'static str = "cosine_decay_transfer";

    fn from_kwargs(kwargs: Option<&ModuleKwargs>) -> Result<Self> {
        let config: CosineDecayTransferConfig = parse_kwargs(kwargs)?;
        config.validate()?;
        Ok(Self { config })
    }
}

impl NoisePredictionModule for CosineDecayTransfer {
    fn step(&self, ctx: &mut ModuleContext<'_>, input: ModuleInput) -> Result<ModuleOutput> {
        let weight = cosine_transfer_weight(
            input.timestep,
            ctx.scheduler.num_train_timesteps(),
            self.config.decay_rate,
        );
        let (timestep, latents) = (input.timestep, input.latents.clone());
        let pred_1 = ctx.run(self.config.sub_module_1.as_ref(), input.clone())?;
        let pred_2 = ctx.run(self.config.sub_module_2.as_ref(), input)?;
        pred_1.lerp(pred_2, weight, ctx.scheduler, timestep, &latents)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearTransferConfig {
    #[serde(default)]
    pub sub_module_1: Option<ModuleDescriptor>,
    #[serde(default)]
    pub sub_module_2: Option<ModuleDescriptor>,
    /// Step at which sub-module 2 starts contributing (default: 0).
    #[serde(default)]
    pub start_step: usize,
    /// Step from which only sub-module 2 is used (default: 10).
    #[serde(default = "default_end_step")]
    pub end_step: usize,
}

fn default_end_step() -> usize {
    10
}

impl Default for LinearTransferConfig {
    fn default() -> Self {
        Self {
            sub_module_1: None,
            sub_module_2: None,
            start_step: 0,
            end_step: default_end_step(),
        }
    }
}

impl LinearTransferConfig {
    pub fn validate(&self) -> Result<()> {
        if self.start_step == self.end_step {
            config_bail!(
                "linear transfer needs distinct start and end steps, both are {}",
                self.start_step
            )
        }
        Ok(())
    }

    pub fn descriptor(&self) -> Result<ModuleDescriptor> {
        self.validate()?;
        Ok(ModuleDescriptor::new(
            "Linear Transfer module",
            LinearTransfer::KEY,
            to_kwargs(self)?,
        ))
    }
}

/// Hands over from sub-module 1 to sub-module 2 linearly between two step indices. A sub-module
/// whose weight is zero is not evaluated.
#[derive(Debug, Clone)]
pub struct LinearTransfer {
    config: LinearTransferConfig,
}

impl RegisteredModule for LinearTransfer {
    const KEY: &'static str = "linear_transfer";

    fn from_kwargs(kwargs: Option<&ModuleKwargs>) -> Result<Self> {
        let config: LinearTransferConfig = parse_kwargs(kwargs)?;
        config.validate()?;
        Ok(Self { config })
    }
}

impl NoisePredictionModule for LinearTransfer {
    fn step(&self, ctx: &mut ModuleContext<'_>, input: ModuleInput) -> Result<ModuleOutput> {
        let factor = linear_transfer_weight(input.step_index, self.config.start_step, self.config.end_step);
        tracing::trace!(factor, step_index = input.step_index, "linear transfer");
        if factor == 0.0 {
            return ctx.run(self.config.sub_module_1.as_ref(), input);
        }
        if factor == 1.0 {
            return ctx.run(self.config.sub_module_2.as_ref(), input);
        }
        let (timestep, latents) = (input.timestep, input.latents.clone());
        let pred_1 = ctx.run(self.config.sub_module_1.as_ref(), input.clone())?;
        let pred_2 = ctx.run(self.config.sub_module_2.as_ref(), input)?;
        pred_1.lerp(pred_2, factor, ctx.scheduler, timestep, &latents)
    }
}
