//! Conditioning data and the external model collaborators.
//!
//! The pipeline does not build embeddings or run networks itself. The diffusion model and any
//! ControlNets are supplied by the host through [`DenoiseModel`] and [`ControlNetModel`], and
//! T2I-Adapter states arrive precomputed.

use std::sync::Arc;

use candle::Tensor;
use serde::{Deserialize, Serialize};

use crate::{config_bail, Error, Result};

/// A value that is either constant over the run or given per step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepValue {
    Constant(f64),
    PerStep(Vec<f64>),
}

impl StepValue {
    /// The value at `step_index`, indexing into a per-step list.
    pub fn at(&self, step_index: usize) -> Result<f64> {
        match self {
            Self::Constant(v) => Ok(*v),
            Self::PerStep(values) => values.get(step_index).copied().ok_or_else(|| {
                Error::config(format!(
                    "per-step value list has {} entries, step {step_index} requested",
                    values.len()
                ))
            }),
        }
    }
}

impl From<f64> for StepValue {
    fn from(v: f64) -> Self {
        Self::Constant(v)
    }
}

/// Classifier-free guidance scale.
pub type GuidanceScale = StepValue;

/// Check that a guidance scale can drive a run of `steps` steps.
pub fn validate_guidance_scale(scale: &GuidanceScale, steps: usize) -> Result<()> {
    match scale {
        StepValue::Constant(v) if *v < 1.0 => config_bail!("cfg_scale must be >= 1, got {v}"),
        StepValue::PerStep(values) => {
            if values.len() != steps {
                config_bail!("cfg_scale list has {} entries but steps is {steps}", values.len())
            }
            if let Some(v) = values.iter().find(|v| **v < 1.0) {
                config_bail!("every cfg_scale entry must be >= 1, got {v}")
            }
            Ok(())
        }
        StepValue::Constant(_) => Ok(()),
    }
}

/// Text conditioning plus the guidance configuration.
#[derive(Debug, Clone)]
pub struct ConditioningData {
    pub cond_text_embeddings: Tensor,
    pub uncond_text_embeddings: Tensor,
    pub guidance_scale: GuidanceScale,
}

/// Step position handed to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepProgress {
    pub step_index: usize,
    pub total_step_count: usize,
}

/// Residuals injected into the model's blocks.
#[derive(Debug, Clone, Default)]
pub struct AdditionalResiduals {
    /// ControlNet down-block residuals.
    pub down_block: Option<Vec<Tensor>>,
    /// ControlNet mid-block residual.
    pub mid_block: Option<Tensor>,
    /// T2I-Adapter intrablock residuals.
    pub down_intrablock: Option<Vec<Tensor>>,
}

/// Unconditional and conditional noise predictions from one forward pass.
#[derive(Debug, Clone)]
pub struct GuidedPrediction {
    pub uncond: Tensor,
    pub cond: Tensor,
}

impl GuidedPrediction {
    /// `uncond + scale * (cond - uncond)`
    pub fn combine(&self, guidance_scale: f64) -> Result<Tensor> {
        let delta = (&self.cond - &self.uncond)?;
        Ok((&self.uncond + (delta * guidance_scale)?)?)
    }
}

/// The diffusion model forward pass.
pub trait DenoiseModel {
    fn predict(
        &self,
        sample: &Tensor,
        timestep: f64,
        conditioning: &ConditioningData,
        progress: StepProgress,
        residuals: &AdditionalResiduals,
    ) -> Result<GuidedPrediction>;
}

/// How ControlNet residuals are balanced against the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    #[default]
    Balanced,
    MorePrompt,
    MoreControl,
    UnbalancedLegacy,
}

/// Down and mid block residuals produced by one ControlNet.
#[derive(Debug, Clone)]
pub struct ControlResiduals {
    pub down_block: Vec<Tensor>,
    pub mid_block: Tensor,
}

pub trait ControlNetModel {
    /// `image` is in image space, i.e. `LATENT_SCALE_FACTOR` times the latent resolution.
    fn residuals(
        &self,
        image: &Tensor,
        sample: &Tensor,
        timestep: f64,
        conditioning: &ConditioningData,
        control_mode: ControlMode,
    ) -> Result<ControlResiduals>;
}

/// A ControlNet with its prepared control image.
#[derive(Clone)]
pub struct ControlNetData {
    pub model: Arc<dyn ControlNetModel>,
    pub image_tensor: Tensor,
    pub weight: StepValue,
    pub begin_step_percent: f64,
    pub end_step_percent: f64,
    pub control_mode: ControlMode,
}

impl std::fmt::Debug for ControlNetData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlNetData")
            .field("image_tensor", &self.image_tensor.dims())
            .field("weight", &self.weight)
            .field("begin_step_percent", &self.begin_step_percent)
            .field("end_step_percent", &self.end_step_percent)
            .field("control_mode", &self.control_mode)
            .finish()
    }
}

impl ControlNetData {
    /// Same ControlNet, different control image.
    pub fn with_image(&self, image_tensor: Tensor) -> Self {
        Self {
            image_tensor,
            ..self.clone()
        }
    }
}

/// Precomputed T2I-Adapter feature maps, one per down block.
#[derive(Debug, Clone)]
pub struct T2IAdapterData {
    pub adapter_state: Vec<Tensor>,
    pub weight: StepValue,
    pub begin_step_percent: f64,
    pub end_step_percent: f64,
}

/// Whether a conditioning input with the given step range applies at `step_index`.
pub fn step_is_active(step_index: usize, total_step_count: usize, begin_percent: f64, end_percent: f64) -> bool {
    let first = (begin_percent * total_step_count as f64).floor();
    let last = (end_percent * total_step_count as f64).ceil();
    let step = step_index as f64;
    first <= step && step <= last
}

fn add_residuals(acc: &mut Option<Vec<Tensor>>, residuals: Vec<Tensor>) -> Result<()> {
    match acc {
        None => *acc = Some(residuals),
        Some(acc) => {
            if acc.len() != residuals.len() {
                return Err(Error::shape_mismatch("down block residuals", acc.len(), residuals.len()));
            }
            for (a, r) in acc.iter_mut().zip(residuals) {
                *a = (&*a + r)?;
            }
        }
    }
    Ok(())
}

/// Evaluate every active ControlNet and sum their weighted residuals.
pub fn controlnet_residuals(
    control_data: &[ControlNetData],
    sample: &Tensor,
    timestep: f64,
    progress: StepProgress,
    conditioning: &ConditioningData,
) -> Result<(Option<Vec<Tensor>>, Option<Tensor>)> {
    let mut down_block = None;
    let mut mid_block: Option<Tensor> = None;
    for control in control_data {
        if !step_is_active(
            progress.step_index,
            progress.total_step_count,
            control.begin_step_percent,
            control.end_step_percent,
        ) {
            continue;
        }
        let weight = control.weight.at(progress.step_index)?;
        let residuals = control.model.residuals(
            &control.image_tensor,
            sample,
            timestep,
            conditioning,
            control.control_mode,
        )?;
        let down = residuals
            .down_block
            .iter()
            .map(|d| d * weight)
            .collect::<candle::Result<Vec<_>>>()?;
        let mid = (residuals.mid_block * weight)?;
        add_residuals(&mut down_block, down)?;
        mid_block = Some(match mid_block {
            None => mid,
            Some(acc) => (acc + mid)?,
        });
    }
    Ok((down_block, mid_block))
}

/// Sum the weighted states of every active T2I-Adapter.
pub fn t2i_intrablock_residuals(
    adapters: &[T2IAdapterData],
    progress: StepProgress,
) -> Result<Option<Vec<Tensor>>> {
    let mut acc = None;
    for adapter in adapters {
        if !step_is_active(
            progress.step_index,
            progress.total_step_count,
            adapter.begin_step_percent,
            adapter.end_step_percent,
        ) {
            continue;
        }
        let weight = adapter.weight.at(progress.step_index)?;
        let state = adapter
            .adapter_state
            .iter()
            .map(|s| s * weight)
            .collect::<candle::Result<Vec<_>>>()?;
        add_residuals(&mut acc, state)?;
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{DType, Device};

    #[test]
    fn test_step_value() -> Result<()> {
        assert_eq!(StepValue::Constant(7.5).at(99)?, 7.5);
        let per_step = StepValue::PerStep(vec![1.0, 2.0]);
        assert_eq!(per_step.at(1)?, 2.0);
        assert!(per_step.at(2).is_err());

        let parsed: StepValue = serde_json::from_str("[3.0, 4.5]")?;
        assert_eq!(parsed, StepValue::PerStep(vec![3.0, 4.5]));
        Ok(())
    }

    #[test]
    fn test_validate_guidance_scale() {
        assert!(validate_guidance_scale(&StepValue::Constant(1.0), 10).is_ok());
        assert!(validate_guidance_scale(&StepValue::Constant(0.5), 10).is_err());
        assert!(validate_guidance_scale(&StepValue::PerStep(vec![2.0; 3]), 3).is_ok());
        assert!(validate_guidance_scale(&StepValue::PerStep(vec![2.0; 3]), 4).is_err());
        assert!(validate_guidance_scale(&StepValue::PerStep(vec![2.0, 0.9]), 2).is_err());
    }

    #[test]
    fn test_step_gating() {
        // floor(0.25 * 10) = 2, ceil(0.55 * 10) = 6
        let active: Vec<usize> = (0..10).filter(|&i| step_is_active(i, 10, 0.25, 0.55)).collect();
        assert_eq!(active, vec![2, 3, 4, 5, 6]);
        assert!(step_is_active(9, 10, 0.0, 1.0));
    }

    #[test]
    fn test_guidance_combine() -> Result<()> {
        let device = Device::Cpu;
        let prediction = GuidedPrediction {
            uncond: Tensor::full(1f32, (1, 4, 2, 2), &device)?,
            cond: Tensor::full(3f32, (1, 4, 2, 2), &device)?,
        };
        let combined = prediction.combine(2.0)?;
        let values = combined.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| (v - 5.0).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn test_t2i_residuals_weighted_and_gated() -> Result<()> {
        let device = Device::Cpu;
        let state = || -> Result<Vec<Tensor>> {
            Ok(vec![
                Tensor::ones((1, 4, 8, 8), DType::F32, &device)?,
                Tensor::ones((1, 4, 4, 4), DType::F32, &device)?,
            ])
        };
        let adapters = vec![
            T2IAdapterData {
                adapter_state: state()?,
                weight: StepValue::Constant(0.5),
                begin_step_percent: 0.0,
                end_step_percent: 1.0,
            },
            T2IAdapterData {
                adapter_state: state()?,
                weight: StepValue::PerStep(vec![2.0, 3.0]),
                begin_step_percent: 0.5,
                end_step_percent: 1.0,
            },
        ];
        let progress = |step_index| StepProgress {
            step_index,
            total_step_count: 2,
        };

        let early = t2i_intrablock_residuals(&adapters, progress(0))?.expect("first adapter active");
        assert_eq!(early[0].max_all()?.to_scalar::<f32>()?, 0.5);
        let late = t2i_intrablock_residuals(&adapters, progress(1))?.expect("both adapters active");
        assert_eq!(late[1].max_all()?.to_scalar::<f32>()?, 3.5);

        assert!(t2i_intrablock_residuals(&[], progress(0))?.is_none());
        Ok(())
    }
}
