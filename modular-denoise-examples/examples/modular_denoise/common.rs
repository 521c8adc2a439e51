//! Tracing setup and module tree presets.

use anyhow::Result;
use clap::ValueEnum;
use modular_denoise::modules::{
    ColorGuidanceConfig, CosineDecayTransferConfig, DilatedSamplingConfig, MultiDiffusionConfig, StandardStep,
    TiledDenoiseConfig,
};
use modular_denoise::ModuleDescriptor;
use tracing_chrome::ChromeLayerBuilder;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Install a log formatter filtered by `RUST_LOG` (default `info`), plus the Chrome tracing
/// profiler when `chrome` is set.
///
/// Returns a guard that must be kept alive for the duration of tracing.
pub fn setup_tracing(chrome: bool) -> Option<tracing_chrome::FlushGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter).with(fmt::layer());
    if chrome {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        registry.with(chrome_layer).init();
        Some(guard)
    } else {
        registry.init();
        None
    }
}

/// Ready-made module trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Preset {
    /// One model evaluation per step.
    Standard,
    /// Jittered overlapping tiles.
    Multidiffusion,
    /// Fixed tiles with a constant overlap.
    Tiled,
    /// Tiles early, dilated global sampling late, blended by a cosine schedule.
    Demofusion,
    /// Multidiffusion with latent channel centering.
    Color,
}

impl Preset {
    pub fn descriptor(self, tile_size: usize) -> Result<ModuleDescriptor> {
        let multidiffusion = MultiDiffusionConfig {
            tile_size,
            stride: tile_size / 2,
            ..Default::default()
        };
        let descriptor = match self {
            Self::Standard => StandardStep::descriptor(),
            Self::Multidiffusion => multidiffusion.descriptor()?,
            Self::Tiled => TiledDenoiseConfig {
                sub_module: None,
                tile_size,
                overlap: tile_size / 8,
            }
            .descriptor()?,
            Self::Demofusion => CosineDecayTransferConfig {
                sub_module_1: Some(multidiffusion.descriptor()?),
                sub_module_2: Some(DilatedSamplingConfig::default().descriptor()?),
                decay_rate: 3.0,
            }
            .descriptor()?,
            Self::Color => ColorGuidanceConfig {
                sub_module: Some(multidiffusion.descriptor()?),
                ..Default::default()
            }
            .descriptor()?,
        };
        Ok(descriptor)
    }
}
