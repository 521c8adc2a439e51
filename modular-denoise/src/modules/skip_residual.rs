//! Skip residual: instead of denoising, re-noise a fixed latent to the current noise level and
//! return the residual from that latent.
//!
//! From: <https://ruoyidu.github.io/demofusion/demofusion.html>

use serde::{Deserialize, Serialize};

use crate::config::{parse_kwargs, to_kwargs, ModuleKwargs};
use crate::latents::LatentsField;
use crate::ops::lerp;
use crate::registry::ModuleDescriptor;
use crate::{config_bail, Error, Result};

use super::{ModuleContext, ModuleInput, ModuleOutput, NoisePredictionModule, RegisteredModule};

const LATENT_TAG: &str = "latent";
const NOISE_TAG: &str = "noise";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipResidualConfig {
    /// The base latent, usually the img2img input.
    pub latent_input: LatentsField,
    /// The noise mixed into the base latent.
    pub noise_input: LatentsField,
    /// Stable id keying this module's cached tensors.
    pub module_id: String,
}

impl SkipResidualConfig {
    pub fn validate(&self) -> Result<()> {
        if self.module_id.is_empty() {
            config_bail!("skip residual needs a non-empty module_id")
        }
        Ok(())
    }

    pub fn descriptor(&self) -> Result<ModuleDescriptor> {
        self.validate()?;
        Ok(ModuleDescriptor::new("Skip Residual module", SkipResidual::KEY, to_kwargs(self)?))
    }
}

#[derive(Debug, Clone)]
pub struct SkipResidual {
    config: SkipResidualConfig,
}

impl SkipResidual {
    /// Load a source tensor on first use and serve it from the persistent store afterwards.
    fn persistent_tensor(
        &self,
        ctx: &mut ModuleContext<'_>,
        tag: &str,
        field: &LatentsField,
        input: &ModuleInput,
    ) -> Result<candle::Tensor> {
        let store = ctx.latent_store;
        let tensor = ctx.persistent.get_or_try_insert_with(&self.config.module_id, tag, || {
            let tensor = store.load(&field.latents_name)?;
            Ok::<_, Error>(tensor.to_device(input.sample.device())?.to_dtype(input.sample.dtype())?)
        })?;
        if tensor.dims() != input.sample.dims() {
            return Err(Error::shape_mismatch(
                format!("skip residual {tag} '{}'", field.latents_name),
                input.sample.dims(),
                tensor.dims(),
            ));
        }
        Ok(tensor)
    }
}

impl RegisteredModule for SkipResidual {
    const KEY: &'static str = "skip_residual";

    fn from_kwargs(kwargs: Option<&ModuleKwargs>) -> Result<Self> {
        let config: SkipResidualConfig = parse_kwargs(kwargs)?;
        config.validate()?;
        Ok(Self { config })
    }
}

impl NoisePredictionModule for SkipResidual {
    fn step(&self, ctx: &mut ModuleContext<'_>, input: ModuleInput) -> Result<ModuleOutput> {
        let latent = self.persistent_tensor(ctx, LATENT_TAG, &self.config.latent_input, &input)?;
        let noise = self.persistent_tensor(ctx, NOISE_TAG, &self.config.noise_input, &input)?;
        let fraction = input.timestep / ctx.scheduler.num_train_timesteps() as f64;
        let noised = lerp(&latent, &noise, fraction)?;
        Ok(ModuleOutput::NoisePrediction((noised - &latent)?))
    }
}
