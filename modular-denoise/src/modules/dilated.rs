//! Dilated sampling.
//!
//! The latent is split into `scale x scale` interlaced sub-grids that are denoised independently
//! at a fraction of the resolution, which widens the receptive field of the model early in the
//! schedule. The model input is blurred first, with a blur that fades out as noise decreases.
//!
//! From: <https://ruoyidu.github.io/demofusion/demofusion.html>

use serde::{Deserialize, Serialize};

use crate::config::{parse_kwargs, to_kwargs, ModuleKwargs};
use crate::ops::{deinterlace, gaussian_filter, interlaced_subsample, match_statistics};
use crate::registry::ModuleDescriptor;
use crate::{config_bail, Error, Result};

use super::transfer::cosine_factor;
use super::{ModuleContext, ModuleInput, ModuleOutput, NoisePredictionModule, RegisteredModule};

/// Added to the blur sigma so it never reaches zero.
const SIGMA_EPSILON: f64 = 1e-2;

/// Persistent-store notice key for the ignored spatial conditioning warning.
pub const IGNORED_CONDITIONING_NOTICE: &str = "dilated_sampling/ignored_conditioning";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DilatedSamplingConfig {
    #[serde(default)]
    pub sub_module: Option<ModuleDescriptor>,

    /// Interlacing factor per axis, e.g. 2 splits every 2x2 block among 4 sub-grids (default: 2).
    #[serde(default = "default_dilation_scale")]
    pub dilation_scale: usize,

    /// Exponent on the cosine blur schedule (default: 1.0).
    #[serde(default = "default_gaussian_decay_rate")]
    pub gaussian_decay_rate: f64,
}

fn default_dilation_scale() -> usize {
    2
}
fn default_gaussian_decay_rate() -> f64 {
    1.0
}

impl Default for DilatedSamplingConfig {
    fn default() -> Self {
        Self {
            sub_module: None,
            dilation_scale: default_dilation_scale(),
            gaussian_decay_rate: default_gaussian_decay_rate(),
        }
    }
}

impl DilatedSamplingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dilation_scale == 0 {
            config_bail!("dilation_scale must be >= 1")
        }
        if self.gaussian_decay_rate.is_nan() || self.gaussian_decay_rate < 0.0 {
            config_bail!("gaussian_decay_rate must be >= 0, got {}", self.gaussian_decay_rate)
        }
        Ok(())
    }

    pub fn descriptor(&self) -> Result<ModuleDescriptor> {
        self.validate()?;
        Ok(ModuleDescriptor::new(
            "Dilated Sampling Step module",
            DilatedSampling::KEY,
            to_kwargs(self)?,
        ))
    }
}

/// Blur sigma at `timestep`: `cosine_factor^decay_rate + 0.01`.
pub fn blur_sigma(timestep: f64, num_train_timesteps: usize, decay_rate: f64) -> f64 {
    cosine_factor(timestep, num_train_timesteps).powf(decay_rate) + SIGMA_EPSILON
}

#[derive(Debug, Clone)]
pub struct DilatedSampling {
    config: DilatedSamplingConfig,
}

impl RegisteredModule for DilatedSampling {
    const KEY: &'static str = "dilated_sampling";

    fn from_kwargs(kwargs: Option<&ModuleKwargs>) -> Result<Self> {
        let config: DilatedSamplingConfig = parse_kwargs(kwargs)?;
        config.validate()?;
        Ok(Self { config })
    }
}

impl NoisePredictionModule for DilatedSampling {
    fn step(&self, ctx: &mut ModuleContext<'_>, input: ModuleInput) -> Result<ModuleOutput> {
        let scale = self.config.dilation_scale;
        let (_, _, height, width) = input.sample.dims4()?;
        if height < scale || width < scale {
            return Err(Error::shape_mismatch(
                "dilated sampling input",
                format!("spatial size >= {scale}"),
                input.sample.dims(),
            ));
        }
        if input.control_data.is_some() || input.t2i_adapter_data.is_some() {
            let controlnets = input.control_data.as_ref().map_or(0, Vec::len);
            let t2i_adapters = input.t2i_adapter_data.as_ref().map_or(0, Vec::len);
            if ctx.persistent.first_notice(IGNORED_CONDITIONING_NOTICE) {
                tracing::warn!(
                    controlnets,
                    t2i_adapters,
                    "dilated sampling ignores ControlNet and T2I-Adapter conditioning"
                );
            } else {
                tracing::debug!(controlnets, t2i_adapters, step = input.step_index, "ignoring spatial conditioning");
            }
        }

        let sigma = blur_sigma(
            input.timestep,
            ctx.scheduler.num_train_timesteps(),
            self.config.gaussian_decay_rate,
        );
        let blurred = gaussian_filter(&input.sample, 2 * scale - 1, sigma)?;
        let blurred = match_statistics(&blurred, &input.sample)?;
        tracing::debug!(scale, sigma, "dilated sampling step");

        let mut phases = Vec::with_capacity(scale * scale);
        for h in 0..scale {
            for w in 0..scale {
                let sub_latents = interlaced_subsample(&input.latents, h, w, scale)?;
                let sub_sample = interlaced_subsample(&blurred, h, w, scale)?;
                let expected = sub_sample.dims().to_vec();
                let phase_input = input.derive(sub_latents, sub_sample, None, None);
                let noise_pred = ctx.run_noise_prediction(self.config.sub_module.as_ref(), phase_input)?;
                if noise_pred.dims() != expected.as_slice() {
                    return Err(Error::shape_mismatch(
                        format!("dilated phase ({h}, {w})"),
                        expected,
                        noise_pred.dims(),
                    ));
                }
                phases.push(noise_pred);
            }
        }
        Ok(ModuleOutput::NoisePrediction(deinterlace(&phases, scale, height, width)?))
    }
}
