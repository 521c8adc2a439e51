//! The default leaf: one guided model evaluation followed by one scheduler step.

use crate::conditioning::{controlnet_residuals, t2i_intrablock_residuals, AdditionalResiduals};
use crate::config::ModuleKwargs;
use crate::registry::ModuleDescriptor;
use crate::{Error, Result};

use super::{ModuleContext, ModuleInput, ModuleOutput, NoisePredictionModule, RegisteredModule};

#[derive(Debug, Clone, Copy, Default)]
pub struct StandardStep;

impl StandardStep {
    pub fn descriptor() -> ModuleDescriptor {
        ModuleDescriptor::new("Standard UNet Step Module", Self::KEY, ModuleKwargs::new())
    }
}

impl RegisteredModule for StandardStep {
    const KEY: &'static str = "standard_unet_step_module";

    fn from_kwargs(_kwargs: Option<&ModuleKwargs>) -> Result<Self> {
        Ok(Self)
    }
}

impl NoisePredictionModule for StandardStep {
    fn step(&self, ctx: &mut ModuleContext<'_>, input: ModuleInput) -> Result<ModuleOutput> {
        let progress = input.progress();

        let (down_block, mid_block) = match input.control_data.as_deref() {
            Some(control_data) => controlnet_residuals(
                control_data,
                &input.sample,
                input.timestep,
                progress,
                ctx.conditioning,
            )?,
            None => (None, None),
        };
        let down_intrablock = match input.t2i_adapter_data.as_deref() {
            Some(adapters) => t2i_intrablock_residuals(adapters, progress)?,
            None => None,
        };
        let residuals = AdditionalResiduals {
            down_block,
            mid_block,
            down_intrablock,
        };

        let prediction = ctx
            .model
            .predict(&input.sample, input.timestep, ctx.conditioning, progress, &residuals)?;
        let guidance_scale = ctx.conditioning.guidance_scale.at(input.step_index)?;
        let noise_pred = prediction.combine(guidance_scale)?;
        if noise_pred.dims() != input.latents.dims() {
            return Err(Error::shape_mismatch("model prediction", input.latents.dims(), noise_pred.dims()));
        }

        let step_output = ctx.scheduler.step(&noise_pred, input.timestep, &input.latents)?;
        Ok(ModuleOutput::Step(step_output))
    }
}
