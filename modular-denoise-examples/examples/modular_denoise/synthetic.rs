//! A closed-form stand-in for a diffusion model.
//!
//! For linear flow matching `x_t = (1 - sigma) * x_0 + sigma * noise` the ideal velocity towards
//! a known clean latent is `(x_t - x_0) / sigma`. The conditional branch targets a fixed
//! per-channel value, the unconditional branch targets zero.

use candle::{Device, Tensor};
use modular_denoise::conditioning::{AdditionalResiduals, GuidedPrediction, StepProgress};
use modular_denoise::{ConditioningData, DenoiseModel, Result};

const MIN_SIGMA: f64 = 1e-3;

pub struct SyntheticModel {
    target: Tensor,
    num_train_timesteps: f64,
}

impl SyntheticModel {
    pub fn new(channel_targets: &[f32], num_train_timesteps: usize, device: &Device) -> Result<Self> {
        let target = Tensor::from_slice(channel_targets, (1, channel_targets.len(), 1, 1), device)?;
        Ok(Self {
            target,
            num_train_timesteps: num_train_timesteps as f64,
        })
    }
}

impl DenoiseModel for SyntheticModel {
    fn predict(
        &self,
        sample: &Tensor,
        timestep: f64,
        _conditioning: &ConditioningData,
        progress: StepProgress,
        _residuals: &AdditionalResiduals,
    ) -> Result<GuidedPrediction> {
        let sigma = (timestep / self.num_train_timesteps).max(MIN_SIGMA);
        let target = self.target.to_dtype(sample.dtype())?.broadcast_as(sample.shape())?;
        let cond = ((sample - &target)? / sigma)?;
        tracing::trace!(step = progress.step_index, sigma, "synthetic prediction");
        Ok(GuidedPrediction {
            uncond: (sample / sigma)?,
            cond,
        })
    }
}
