//! Tile stitching: accumulation buffers and per-tile cropping of side-channel data.

use candle::Tensor;

use crate::conditioning::{ControlNetData, T2IAdapterData};
use crate::config::LATENT_SCALE_FACTOR;
use crate::ops::{pad2d, PadMode};
use crate::scheduler::StepOutput;
use crate::views::View;
use crate::{Error, Result};

/// Per-pixel sums and hit counts of the tile results of one timestep.
///
/// The noise sum shares the value counts, every tile contributing to all three sums at once.
#[derive(Debug)]
pub struct AccumulationBuffers {
    value_sum: Tensor,
    value_count: Tensor,
    pred_sum: Tensor,
    pred_count: Tensor,
    noise_sum: Tensor,
}

fn add_to_region(buffer: &Tensor, view: &View, values: &Tensor) -> Result<Tensor> {
    let (b, c, _, _) = buffer.dims4()?;
    let updated = (view.crop(buffer)? + values)?;
    Ok(buffer.slice_assign(
        &[0..b, 0..c, view.row_start..view.row_end, view.col_start..view.col_end],
        &updated,
    )?)
}

impl AccumulationBuffers {
    /// Zeroed buffers shaped like the (possibly padded) working latent.
    pub fn new(like: &Tensor) -> Result<Self> {
        let zeros = like.zeros_like()?;
        Ok(Self {
            value_sum: zeros.clone(),
            value_count: zeros.clone(),
            pred_sum: zeros.clone(),
            pred_count: zeros.clone(),
            noise_sum: zeros,
        })
    }

    /// Add one tile's step-output over `view`.
    pub fn accumulate(&mut self, view: &View, output: &StepOutput) -> Result<()> {
        let (b, c, _, _) = self.value_sum.dims4()?;
        let expected = [b, c, view.height(), view.width()];
        for (name, t) in [
            ("tile prev_sample", &output.prev_sample),
            ("tile pred_original_sample", &output.pred_original_sample),
            ("tile noise_pred", &output.noise_pred),
        ] {
            if t.dims() != expected {
                return Err(Error::shape_mismatch(name, expected, t.dims()));
            }
        }
        let ones = output.prev_sample.ones_like()?;
        self.value_sum = add_to_region(&self.value_sum, view, &output.prev_sample)?;
        self.value_count = add_to_region(&self.value_count, view, &ones)?;
        self.pred_sum = add_to_region(&self.pred_sum, view, &output.pred_original_sample)?;
        self.pred_count = add_to_region(&self.pred_count, view, &ones)?;
        self.noise_sum = add_to_region(&self.noise_sum, view, &output.noise_pred)?;
        Ok(())
    }

    /// Crop the padding off and average. Every in-bounds pixel has a non-zero count as long as
    /// the views cover the extent.
    pub fn combine(self, padding: usize, height: usize, width: usize) -> Result<StepOutput> {
        let inner = View::new(padding, padding + height, padding, padding + width);
        let value_count = inner.crop(&self.value_count)?;
        Ok(StepOutput {
            prev_sample: (inner.crop(&self.value_sum)? / &value_count)?,
            pred_original_sample: (inner.crop(&self.pred_sum)? / inner.crop(&self.pred_count)?)?,
            noise_pred: (inner.crop(&self.noise_sum)? / &value_count)?,
        })
    }
}

/// Pad every control image by the jitter range in image space.
pub fn pad_control_data(control_data: &[ControlNetData], jitter: usize, mode: PadMode) -> Result<Vec<ControlNetData>> {
    control_data
        .iter()
        .map(|c| Ok(c.with_image(pad2d(&c.image_tensor, jitter * LATENT_SCALE_FACTOR, mode)?)))
        .collect()
}

/// Crop padded control images to a latent-space view.
pub fn crop_control_data(control_data: &[ControlNetData], view: &View) -> Result<Vec<ControlNetData>> {
    let view = view.scaled(LATENT_SCALE_FACTOR);
    control_data
        .iter()
        .map(|c| Ok(c.with_image(view.crop(&c.image_tensor)?)))
        .collect()
}

/// T2I-Adapter states prepared for tiling. Each feature map has its own downscale factor relative
/// to the latent, derived from its height.
#[derive(Debug, Clone)]
pub struct TiledAdapterData {
    adapters: Vec<(T2IAdapterData, Vec<usize>)>,
}

impl TiledAdapterData {
    pub fn new(adapters: &[T2IAdapterData], latent_height: usize, jitter: usize, mode: PadMode) -> Result<Self> {
        let mut prepared = Vec::with_capacity(adapters.len());
        for adapter in adapters {
            let mut states = Vec::with_capacity(adapter.adapter_state.len());
            let mut scales = Vec::with_capacity(adapter.adapter_state.len());
            for state in &adapter.adapter_state {
                let (_, _, h, _) = state.dims4()?;
                if h == 0 || h > latent_height {
                    return Err(Error::shape_mismatch(
                        "t2i adapter state height",
                        format!("1..={latent_height}"),
                        h,
                    ));
                }
                let scale = latent_height / h;
                if jitter % scale != 0 {
                    tracing::warn!(jitter, scale, "jitter padding is not a multiple of the adapter downscale factor");
                }
                states.push(pad2d(state, jitter / scale, mode)?);
                scales.push(scale);
            }
            prepared.push((
                T2IAdapterData {
                    adapter_state: states,
                    ..adapter.clone()
                },
                scales,
            ));
        }
        Ok(Self { adapters: prepared })
    }

    /// The adapter states covering a latent-space view.
    pub fn crop(&self, view: &View) -> Result<Vec<T2IAdapterData>> {
        self.adapters
            .iter()
            .map(|(adapter, scales)| {
                let adapter_state = adapter
                    .adapter_state
                    .iter()
                    .zip(scales)
                    .map(|(state, &scale)| view.downscaled(scale).crop(state))
                    .collect::<Result<Vec<_>>>()?;
                Ok(T2IAdapterData {
                    adapter_state,
                    ..adapter.clone()
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditioning::StepValue;
    use crate::views::get_views;
    use candle::{DType, Device};

    fn constant_output(value: f32, view: &View) -> Result<StepOutput> {
        let t = Tensor::full(value, (1, 4, view.height(), view.width()), &Device::Cpu)?;
        Ok(StepOutput {
            prev_sample: t.clone(),
            pred_original_sample: (&t * 2.0)?,
            noise_pred: t,
        })
    }

    #[test]
    fn test_identical_tiles_average_to_themselves() -> Result<()> {
        let latent = Tensor::zeros((1, 4, 40, 56), DType::F32, &Device::Cpu)?;
        let mut buffers = AccumulationBuffers::new(&latent)?;
        for view in get_views(40, 56, 16, 8)? {
            buffers.accumulate(&view, &constant_output(0.75, &view)?)?;
        }
        let combined = buffers.combine(0, 40, 56)?;
        assert_eq!(combined.prev_sample.dims(), &[1, 4, 40, 56]);
        for v in combined.prev_sample.flatten_all()?.to_vec1::<f32>()? {
            assert!((v - 0.75).abs() < 1e-6);
        }
        for v in combined.pred_original_sample.flatten_all()?.to_vec1::<f32>()? {
            assert!((v - 1.5).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_overlap_is_averaged() -> Result<()> {
        let latent = Tensor::zeros((1, 4, 1, 4), DType::F32, &Device::Cpu)?;
        let mut buffers = AccumulationBuffers::new(&latent)?;
        let (left, right) = (View::new(0, 1, 0, 3), View::new(0, 1, 1, 4));
        buffers.accumulate(&left, &constant_output(1.0, &left)?)?;
        buffers.accumulate(&right, &constant_output(3.0, &right)?)?;
        let combined = buffers.combine(0, 1, 4)?;
        let row = combined.prev_sample.narrow(1, 0, 1)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(row, [1.0, 2.0, 2.0, 3.0]);
        Ok(())
    }

    #[test]
    fn test_accumulate_rejects_wrong_tile_shape() -> Result<()> {
        let latent = Tensor::zeros((1, 4, 16, 16), DType::F32, &Device::Cpu)?;
        let mut buffers = AccumulationBuffers::new(&latent)?;
        let view = View::new(0, 8, 0, 8);
        let wrong = constant_output(1.0, &View::new(0, 8, 0, 4))?;
        assert!(buffers.accumulate(&view, &wrong).is_err());
        Ok(())
    }

    #[test]
    fn test_padding_is_cropped() -> Result<()> {
        let padded = Tensor::zeros((1, 4, 12, 12), DType::F32, &Device::Cpu)?;
        let mut buffers = AccumulationBuffers::new(&padded)?;
        let view = View::new(0, 12, 0, 12);
        buffers.accumulate(&view, &constant_output(2.0, &view)?)?;
        let combined = buffers.combine(2, 8, 8)?;
        assert_eq!(combined.prev_sample.dims(), &[1, 4, 8, 8]);
        Ok(())
    }

    #[test]
    fn test_tiled_adapter_crop_uses_state_resolution() -> Result<()> {
        let device = Device::Cpu;
        let adapter = T2IAdapterData {
            adapter_state: vec![
                Tensor::zeros((1, 8, 32, 32), DType::F32, &device)?,
                Tensor::zeros((1, 8, 16, 16), DType::F32, &device)?,
            ],
            weight: StepValue::Constant(1.0),
            begin_step_percent: 0.0,
            end_step_percent: 1.0,
        };
        let tiled = TiledAdapterData::new(&[adapter], 32, 4, PadMode::Constant)?;
        let cropped = tiled.crop(&View::new(0, 16, 8, 24))?;
        assert_eq!(cropped[0].adapter_state[0].dims(), &[1, 8, 16, 16]);
        assert_eq!(cropped[0].adapter_state[1].dims(), &[1, 8, 8, 8]);
        Ok(())
    }
}
