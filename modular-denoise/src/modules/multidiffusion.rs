//! MultiDiffusion tiled sampling.
//!
//! The latent is covered by overlapping tiles (see [`crate::views`]); the sub-module runs on every
//! tile and the per-tile step-outputs are averaged where tiles overlap. With jitter enabled the
//! tile grid moves randomly every step, on a latent padded by the jitter range.
//!
//! From: <https://multidiffusion.github.io/>

use serde::{Deserialize, Serialize};

use crate::config::{parse_kwargs, to_kwargs, ModuleKwargs, LATENT_SCALE_FACTOR};
use crate::ops::{pad2d, PadMode};
use crate::registry::ModuleDescriptor;
use crate::stitch::{crop_control_data, pad_control_data, AccumulationBuffers, TiledAdapterData};
use crate::views::{get_jittered_views, get_views, jitter_range};
use crate::{config_bail, Result};

use super::{ModuleContext, ModuleInput, ModuleOutput, NoisePredictionModule, RegisteredModule};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiDiffusionConfig {
    /// Module evaluated on every tile (standard step when absent).
    #[serde(default)]
    pub sub_module: Option<ModuleDescriptor>,

    /// Tile size in image pixels (default: 512).
    #[serde(default = "default_tile_size")]
    pub tile_size: usize,

    /// Distance between tile starts in image pixels (default: 256).
    #[serde(default = "default_stride")]
    pub stride: usize,

    /// Border padding used with jitter (default: reflect). `None` pads with zeros.
    #[serde(default = "default_pad_mode")]
    pub pad_mode: Option<PadMode>,

    #[serde(default = "default_enable_jitter")]
    pub enable_jitter: bool,
}

fn default_tile_size() -> usize {
    512
}
fn default_stride() -> usize {
    256
}
fn default_pad_mode() -> Option<PadMode> {
    Some(PadMode::Reflect)
}
fn default_enable_jitter() -> bool {
    true
}

impl Default for MultiDiffusionConfig {
    fn default() -> Self {
        Self {
            sub_module: None,
            tile_size: default_tile_size(),
            stride: default_stride(),
            pad_mode: default_pad_mode(),
            enable_jitter: default_enable_jitter(),
        }
    }
}

impl MultiDiffusionConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("tile_size", self.tile_size), ("stride", self.stride)] {
            if value == 0 || value % LATENT_SCALE_FACTOR != 0 {
                config_bail!("{name} must be a positive multiple of {LATENT_SCALE_FACTOR}, got {value}")
            }
        }
        if self.stride > self.tile_size {
            config_bail!("stride ({}) must not exceed tile_size ({})", self.stride, self.tile_size)
        }
        Ok(())
    }

    /// Tile size in latent units.
    pub fn window_size(&self) -> usize {
        self.tile_size / LATENT_SCALE_FACTOR
    }

    /// Stride in latent units.
    pub fn latent_stride(&self) -> usize {
        self.stride / LATENT_SCALE_FACTOR
    }

    pub fn descriptor(&self) -> Result<ModuleDescriptor> {
        self.validate()?;
        Ok(ModuleDescriptor::new(
            "MultiDiffusion Sampling Step module",
            MultiDiffusion::KEY,
            to_kwargs(self)?,
        ))
    }
}

/// Fixed-grid tiling: MultiDiffusion with `stride = tile_size - overlap`, no jitter and no padding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TiledDenoiseConfig {
    #[serde(default)]
    pub sub_module: Option<ModuleDescriptor>,

    #[serde(default = "default_tile_size")]
    pub tile_size: usize,

    /// Minimum overlap between neighbouring tiles in image pixels (default: 64).
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

fn default_overlap() -> usize {
    64
}

impl Default for TiledDenoiseConfig {
    fn default() -> Self {
        Self {
            sub_module: None,
            tile_size: default_tile_size(),
            overlap: default_overlap(),
        }
    }
}

impl TiledDenoiseConfig {
    pub fn to_multidiffusion(&self) -> Result<MultiDiffusionConfig> {
        if self.overlap >= self.tile_size {
            config_bail!("overlap ({}) must be smaller than tile_size ({})", self.overlap, self.tile_size)
        }
        let config = MultiDiffusionConfig {
            sub_module: self.sub_module.clone(),
            tile_size: self.tile_size,
            stride: self.tile_size - self.overlap,
            pad_mode: None,
            enable_jitter: false,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn descriptor(&self) -> Result<ModuleDescriptor> {
        let config = self.to_multidiffusion()?;
        Ok(ModuleDescriptor::new(
            "Tiled Denoise Latents module",
            MultiDiffusion::KEY,
            to_kwargs(&config)?,
        ))
    }
}

#[derive(Debug, Clone)]
pub struct MultiDiffusion {
    config: MultiDiffusionConfig,
}

impl MultiDiffusion {
    pub fn new(config: MultiDiffusionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }
}

impl RegisteredModule for MultiDiffusion {
    const KEY: &'static str = "multidiffusion_sampling";

    fn from_kwargs(kwargs: Option<&ModuleKwargs>) -> Result<Self> {
        Self::new(parse_kwargs(kwargs)?)
    }
}

impl NoisePredictionModule for MultiDiffusion {
    fn step(&self, ctx: &mut ModuleContext<'_>, input: ModuleInput) -> Result<ModuleOutput> {
        let (_, _, height, width) = input.sample.dims4()?;
        let window_size = self.config.window_size();
        let stride = self.config.latent_stride();

        let (views, jitter) = if self.config.enable_jitter {
            let views = get_jittered_views(height, width, window_size, stride, &mut *ctx.rng)?;
            (views, jitter_range(window_size, stride))
        } else {
            (get_views(height, width, window_size, stride)?, 0)
        };
        let pad_mode = self.config.pad_mode.unwrap_or(PadMode::Constant);
        tracing::debug!(tiles = views.len(), jitter, ?pad_mode, "multidiffusion step");

        let sample = pad2d(&input.sample, jitter, pad_mode)?;
        let latents = pad2d(&input.latents, jitter, pad_mode)?;
        let control_data = match input.control_data.as_deref() {
            Some(c) => Some(pad_control_data(c, jitter, pad_mode)?),
            None => None,
        };
        let t2i_adapter_data = match input.t2i_adapter_data.as_deref() {
            Some(a) => Some(TiledAdapterData::new(a, height, jitter, pad_mode)?),
            None => None,
        };

        let mut buffers = AccumulationBuffers::new(&sample)?;
        for view in &views {
            let tile_control = match control_data.as_deref() {
                Some(c) => Some(crop_control_data(c, view)?),
                None => None,
            };
            let tile_t2i = match &t2i_adapter_data {
                Some(a) => Some(a.crop(view)?),
                None => None,
            };
            let tile_input = input.derive(view.crop(&latents)?, view.crop(&sample)?, tile_control, tile_t2i);
            let output = ctx.run_step(self.config.sub_module.as_ref(), tile_input)?;
            buffers.accumulate(view, &output)?;
        }

        Ok(ModuleOutput::Step(buffers.combine(jitter, height, width)?))
    }
}
