//! Color guidance: counteract the channel-mean drift of SDXL latents by re-centering the noise
//! prediction early and late in the schedule.
//!
//! From: <https://huggingface.co/blog/TimothyAlexisVass/explaining-the-sdxl-latent-space>

use serde::{Deserialize, Serialize};

use crate::config::{parse_kwargs, to_kwargs, ModuleKwargs};
use crate::ops::center_tensor;
use crate::registry::ModuleDescriptor;
use crate::{config_bail, Result};

use super::{ModuleContext, ModuleInput, ModuleOutput, NoisePredictionModule, RegisteredModule};

/// Named latent channel subsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChannelSelection {
    #[default]
    #[serde(rename = "All Channels")]
    AllChannels,
    #[serde(rename = "Colors Only")]
    ColorsOnly,
    #[serde(rename = "L0: Brightness")]
    Brightness,
    #[serde(rename = "L1: Cyan->Red")]
    CyanRed,
    #[serde(rename = "L2: Lime->Purple")]
    LimePurple,
    #[serde(rename = "L3: Structure")]
    Structure,
}

impl ChannelSelection {
    pub fn channels(self) -> Vec<usize> {
        match self {
            Self::AllChannels => vec![0, 1, 2, 3],
            Self::ColorsOnly => vec![1, 2],
            Self::Brightness => vec![0],
            Self::CyanRed => vec![1],
            Self::LimePurple => vec![2],
            Self::Structure => vec![3],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorGuidanceConfig {
    #[serde(default)]
    pub sub_module: Option<ModuleDescriptor>,
    /// Channels to re-center (default: all four).
    #[serde(default = "default_channels")]
    pub channels: Vec<usize>,
}

fn default_channels() -> Vec<usize> {
    ChannelSelection::AllChannels.channels()
}

impl Default for ColorGuidanceConfig {
    fn default() -> Self {
        Self::from_selection(None, ChannelSelection::default())
    }
}

impl ColorGuidanceConfig {
    pub fn from_selection(sub_module: Option<ModuleDescriptor>, selection: ChannelSelection) -> Self {
        Self {
            sub_module,
            channels: selection.channels(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            config_bail!("color guidance needs at least one channel")
        }
        Ok(())
    }

    pub fn descriptor(&self) -> Result<ModuleDescriptor> {
        self.validate()?;
        Ok(ModuleDescriptor::new(
            "Color Guidance module",
            ColorGuidance::KEY,
            to_kwargs(self)?,
        ))
    }
}

/// `(per_channel_shift, full_shift)` applied at `timestep`, if any.
pub fn centering_shifts(timestep: f64) -> Option<(f64, f64)> {
    if timestep > 700.0 {
        Some((0.8, 0.8))
    } else if timestep > 1.0 && timestep < 100.0 {
        Some((0.6, 1.0))
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct ColorGuidance {
    config: ColorGuidanceConfig,
}

impl RegisteredModule for ColorGuidance {
    const KEY: &'static str = "color_guidance";

    fn from_kwargs(kwargs: Option<&ModuleKwargs>) -> Result<Self> {
        let config: ColorGuidanceConfig = parse_kwargs(kwargs)?;
        config.validate()?;
        Ok(Self { config })
    }
}

impl NoisePredictionModule for ColorGuidance {
    fn step(&self, ctx: &mut ModuleContext<'_>, input: ModuleInput) -> Result<ModuleOutput> {
        let timestep = input.timestep;
        let noise_pred = ctx.run_noise_prediction(self.config.sub_module.as_ref(), input)?;
        let noise_pred = match centering_shifts(timestep) {
            Some((channel_shift, full_shift)) => {
                center_tensor(&noise_pred, channel_shift, full_shift, &self.config.channels)?
            }
            None => noise_pred,
        };
        Ok(ModuleOutput::NoisePrediction(noise_pred))
    }
}
