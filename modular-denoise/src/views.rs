//! Tile view planning for MultiDiffusion-style sampling.
//!
//! A view is a rectangular window over the latent. Views are laid out on a regular grid with a
//! fixed stride; the last row/column is shifted back so it ends exactly on the border, which
//! guarantees that every latent position is covered by at least one view.
//!
//! # Jitter
//!
//! With jitter enabled every view is moved by a random offset in `[-j, j]` per axis, where
//! `j = (window - stride) / 4`. Coordinates are returned in a frame shifted by `+j` so they index
//! into a buffer padded by `j` on every side. Views touching a border only move inwards.
//!
//! See <https://arxiv.org/abs/2302.08113> (MultiDiffusion, Eq. 7).

use candle::{IndexOp, Tensor};
use rand::{Rng, RngCore};

use crate::{config_bail, Result};

/// A rectangular region `[row_start, row_end) x [col_start, col_end)` in latent coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct View {
    pub row_start: usize,
    pub row_end: usize,
    pub col_start: usize,
    pub col_end: usize,
}

impl View {
    pub fn new(row_start: usize, row_end: usize, col_start: usize, col_end: usize) -> Self {
        Self {
            row_start,
            row_end,
            col_start,
            col_end,
        }
    }

    pub fn height(&self) -> usize {
        self.row_end - self.row_start
    }

    pub fn width(&self) -> usize {
        self.col_end - self.col_start
    }

    /// The same region in a space `factor` times larger (e.g. image space for ControlNet inputs).
    pub fn scaled(&self, factor: usize) -> Self {
        Self::new(
            self.row_start * factor,
            self.row_end * factor,
            self.col_start * factor,
            self.col_end * factor,
        )
    }

    /// The same region in a space `factor` times smaller (e.g. a T2I-Adapter feature map).
    pub fn downscaled(&self, factor: usize) -> Self {
        Self::new(
            self.row_start / factor,
            self.row_end / factor,
            self.col_start / factor,
            self.col_end / factor,
        )
    }

    /// Slice the last two dimensions of a `(B, C, H, W)` tensor to this view.
    pub fn crop(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(xs.i((.., .., self.row_start..self.row_end, self.col_start..self.col_end))?)
    }
}

/// Jitter amplitude for a window/stride pair.
pub fn jitter_range(window_size: usize, stride: usize) -> usize {
    window_size.saturating_sub(stride) / 4
}

/// Number of views along one axis.
fn num_blocks(extent: usize, window_size: usize, stride: usize) -> usize {
    if extent > window_size {
        (extent - window_size).div_ceil(stride) + 1
    } else {
        1
    }
}

/// Place a window starting at `start` inside `[0, extent)`, shifting it back from the far border.
fn clamp_window(start: usize, window_size: usize, extent: usize) -> (usize, usize) {
    let end = start + window_size;
    if end > extent {
        let start = extent.saturating_sub(window_size);
        (start, extent.min(start + window_size))
    } else {
        (start, end)
    }
}

/// Random offset for one axis: interior views move both ways, border views only inwards.
fn jitter_offset(start: usize, end: usize, extent: usize, range: usize, rng: &mut dyn RngCore) -> i64 {
    let range = range as i64;
    match (start != 0, end != extent) {
        (true, true) => rng.random_range(-range..=range),
        (false, true) => rng.random_range(-range..=0),
        (true, false) => rng.random_range(0..=range),
        (false, false) => 0,
    }
}

fn plan_views(
    height: usize,
    width: usize,
    window_size: usize,
    stride: usize,
    mut jitter: Option<&mut dyn RngCore>,
) -> Result<Vec<View>> {
    if height == 0 || width == 0 {
        config_bail!("cannot plan views over an empty {height}x{width} latent")
    }
    if window_size == 0 || stride == 0 {
        config_bail!("window size ({window_size}) and stride ({stride}) must be positive")
    }
    if stride > window_size {
        config_bail!("stride ({stride}) larger than window size ({window_size}) leaves gaps between views")
    }

    let num_blocks_height = num_blocks(height, window_size, stride);
    let num_blocks_width = num_blocks(width, window_size, stride);
    let range = jitter_range(window_size, stride);

    let mut views = Vec::with_capacity(num_blocks_height * num_blocks_width);
    for i in 0..num_blocks_height * num_blocks_width {
        let (h_start, h_end) = clamp_window((i / num_blocks_width) * stride, window_size, height);
        let (w_start, w_end) = clamp_window((i % num_blocks_width) * stride, window_size, width);

        let view = match jitter.as_deref_mut() {
            Some(rng) => {
                let h_jitter = jitter_offset(h_start, h_end, height, range, rng);
                let w_jitter = jitter_offset(w_start, w_end, width, range, rng);
                let shift = |v: usize, j: i64| (v as i64 + j + range as i64) as usize;
                View::new(
                    shift(h_start, h_jitter),
                    shift(h_end, h_jitter),
                    shift(w_start, w_jitter),
                    shift(w_end, w_jitter),
                )
            }
            None => View::new(h_start, h_end, w_start, w_end),
        };
        views.push(view);
    }
    Ok(views)
}

/// Deterministic row-major views covering a `height x width` latent.
pub fn get_views(height: usize, width: usize, window_size: usize, stride: usize) -> Result<Vec<View>> {
    plan_views(height, width, window_size, stride, None)
}

/// Jittered views, in the coordinate frame of a buffer padded by [`jitter_range`] on every side.
pub fn get_jittered_views<R: RngCore>(
    height: usize,
    width: usize,
    window_size: usize,
    stride: usize,
    rng: &mut R,
) -> Result<Vec<View>> {
    plan_views(height, width, window_size, stride, Some(rng as &mut dyn RngCore))
}
