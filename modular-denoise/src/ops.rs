//! Tensor helpers used by the noise-prediction modules.
//!
//! All helpers operate on `(B, C, H, W)` latents.

use candle::{DType, Device, Module, Tensor, D};
use candle_nn::{Conv2d, Conv2dConfig};
use serde::{Deserialize, Serialize};

use crate::{config_bail, Error, Result};

/// Border handling when padding a latent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PadMode {
    /// Zero padding.
    Constant,
    /// Mirror without repeating the edge (`d c b | a b c d | c b a`).
    #[default]
    Reflect,
    /// Repeat the edge value.
    Replicate,
}

fn pad_dim(xs: &Tensor, dim: usize, pad: usize, mode: PadMode) -> Result<Tensor> {
    if pad == 0 {
        return Ok(xs.clone());
    }
    let xs = match mode {
        PadMode::Constant => xs.pad_with_zeros(dim, pad, pad)?,
        PadMode::Replicate => xs.pad_with_same(dim, pad, pad)?,
        PadMode::Reflect => {
            let n = xs.dim(dim)?;
            if pad >= n {
                config_bail!("reflect padding of {pad} needs a dimension larger than {n}")
            }
            let idx: Vec<u32> = (1..=pad)
                .rev()
                .chain(0..n)
                .chain((n - 1 - pad..n - 1).rev())
                .map(|i| i as u32)
                .collect();
            let idx = Tensor::from_vec(idx, n + 2 * pad, xs.device())?;
            // Tiles are narrowed views and index_select needs contiguous storage.
            xs.contiguous()?.index_select(&idx, dim)?
        }
    };
    Ok(xs)
}

/// Pad both spatial dimensions by `pad` on every side.
pub fn pad2d(xs: &Tensor, pad: usize, mode: PadMode) -> Result<Tensor> {
    let rank = xs.rank();
    if rank < 2 {
        return Err(Error::shape_mismatch("pad2d", "rank >= 2", xs.dims()));
    }
    let xs = pad_dim(xs, rank - 2, pad, mode)?;
    pad_dim(&xs, rank - 1, pad, mode)
}

/// Linear interpolation `a + (b - a) * weight`.
pub fn lerp(a: &Tensor, b: &Tensor, weight: f64) -> Result<Tensor> {
    if a.dims() != b.dims() {
        return Err(Error::shape_mismatch("lerp", a.dims(), b.dims()));
    }
    Ok((a + ((b - a)? * weight)?)?)
}

/// Normalized 2-D Gaussian kernel of shape `(channels, 1, k, k)` for a depthwise convolution.
pub fn gaussian_kernel(
    kernel_size: usize,
    sigma: f64,
    channels: usize,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let center = (kernel_size as f64 - 1.0) / 2.0;
    let gaussian_1d: Vec<f64> = (0..kernel_size)
        .map(|x| (-(x as f64 - center).powi(2) / (2.0 * sigma * sigma)).exp())
        .collect();
    let total: f64 = gaussian_1d.iter().sum();
    let mut gaussian_2d = Vec::with_capacity(kernel_size * kernel_size);
    for gy in &gaussian_1d {
        for gx in &gaussian_1d {
            gaussian_2d.push((gy / total * gx / total) as f32);
        }
    }
    let kernel = Tensor::from_vec(gaussian_2d, (1, 1, kernel_size, kernel_size), device)?;
    Ok(kernel.repeat((channels, 1, 1, 1))?.to_dtype(dtype)?)
}

/// Blur every channel independently, keeping the spatial size.
pub fn gaussian_filter(xs: &Tensor, kernel_size: usize, sigma: f64) -> Result<Tensor> {
    let (_, channels, _, _) = xs.dims4()?;
    let kernel = gaussian_kernel(kernel_size, sigma, channels, xs.device(), xs.dtype())?;
    let config = Conv2dConfig {
        padding: kernel_size / 2,
        groups: channels,
        ..Default::default()
    };
    Ok(Conv2d::new(kernel, None, config).forward(&xs.contiguous()?)?)
}

/// Global mean and standard deviation of a tensor.
pub fn mean_std(xs: &Tensor) -> Result<(f64, f64)> {
    let xs = xs.to_dtype(DType::F64)?.flatten_all()?;
    let mean = xs.mean_all()?.to_scalar::<f64>()?;
    let var = xs.affine(1.0, -mean)?.sqr()?.mean_all()?.to_scalar::<f64>()?;
    Ok((mean, var.sqrt()))
}

/// Shift and scale `xs` so its global mean/std match `reference`.
pub fn match_statistics(xs: &Tensor, reference: &Tensor) -> Result<Tensor> {
    let (mean, std) = mean_std(xs)?;
    let (ref_mean, ref_std) = mean_std(reference)?;
    if std == 0.0 {
        // Constant input carries no high-frequency content; only the mean can be restored.
        return Ok(xs.affine(1.0, ref_mean - mean)?);
    }
    let scale = ref_std / std;
    Ok(xs.affine(scale, ref_mean - mean * scale)?)
}

fn strided_indices(phase: usize, extent: usize, scale: usize, device: &Device) -> Result<Tensor> {
    let idx: Vec<u32> = (phase..extent).step_by(scale).map(|i| i as u32).collect();
    let len = idx.len();
    Ok(Tensor::from_vec(idx, len, device)?)
}

/// The strided sub-grid `xs[:, :, row_phase::scale, col_phase::scale]`.
pub fn interlaced_subsample(xs: &Tensor, row_phase: usize, col_phase: usize, scale: usize) -> Result<Tensor> {
    let (_, _, h, w) = xs.dims4()?;
    if row_phase >= scale.min(h) || col_phase >= scale.min(w) {
        config_bail!("phase ({row_phase}, {col_phase}) invalid for scale {scale} over {h}x{w}")
    }
    let rows = strided_indices(row_phase, h, scale, xs.device())?;
    let cols = strided_indices(col_phase, w, scale, xs.device())?;
    let rows_selected = xs.contiguous()?.index_select(&rows, 2)?;
    Ok(rows_selected.contiguous()?.index_select(&cols, 3)?)
}

/// Split a latent into its `scale * scale` interlaced sub-grids, row-major over phases.
pub fn interlace(xs: &Tensor, scale: usize) -> Result<Vec<Tensor>> {
    let mut phases = Vec::with_capacity(scale * scale);
    for h in 0..scale {
        for w in 0..scale {
            phases.push(interlaced_subsample(xs, h, w, scale)?);
        }
    }
    Ok(phases)
}

/// Inverse of [`interlace`]: write every phase back into its strided positions of a
/// `height x width` tensor. Each output position receives exactly one phase value.
pub fn deinterlace(phases: &[Tensor], scale: usize, height: usize, width: usize) -> Result<Tensor> {
    if phases.len() != scale * scale {
        return Err(Error::shape_mismatch("deinterlace phases", scale * scale, phases.len()));
    }
    let (b, c, _, _) = phases[0].dims4()?;
    let (device, dtype) = (phases[0].device(), phases[0].dtype());
    let mut total = Tensor::zeros((b, c, height, width), dtype, device)?;
    for (i, phase) in phases.iter().enumerate() {
        let rows = strided_indices(i / scale, height, scale, device)?;
        let cols = strided_indices(i % scale, width, scale, device)?;
        let expected = (b, c, rows.dim(0)?, cols.dim(0)?);
        if phase.dims4()? != expected {
            return Err(Error::shape_mismatch(format!("deinterlace phase {i}"), expected, phase.dims()));
        }
        let wide = Tensor::zeros((b, c, expected.2, width), dtype, device)?
            .index_add(&cols, &phase.contiguous()?, 3)?;
        total = total.index_add(&rows, &wide, 2)?;
    }
    Ok(total)
}

/// Subtract `channel_shift` times the per-channel mean from the selected channels, then
/// `full_shift` times the mean of the whole result.
pub fn center_tensor(xs: &Tensor, channel_shift: f64, full_shift: f64, channels: &[usize]) -> Result<Tensor> {
    let (_, num_channels, _, _) = xs.dims4()?;
    if let Some(&bad) = channels.iter().find(|&&c| c >= num_channels) {
        return Err(Error::shape_mismatch(
            "color guidance channels",
            format!("channel index < {num_channels}"),
            bad,
        ));
    }
    let mut weights = vec![0f32; num_channels];
    for &c in channels {
        weights[c] = channel_shift as f32;
    }
    let weights = Tensor::from_vec(weights, (1, num_channels, 1, 1), xs.device())?.to_dtype(xs.dtype())?;
    let channel_means = xs.mean_keepdim(D::Minus1)?.mean_keepdim(D::Minus2)?;
    let centered = xs.broadcast_sub(&channel_means.broadcast_mul(&weights)?)?;
    let full_mean = (centered.mean_all()? * full_shift)?;
    Ok(centered.broadcast_sub(&full_mean)?)
}
