//! Extension hooks around the denoise loop.
//!
//! Extensions observe or mutate the shared denoise data at three points: a model-patch scope
//! around the whole generation, a one-time mutation before the loop and a callback after every
//! timestep. They are not part of the module tree.

use crate::driver::DenoiseData;
use crate::modules::TiledDenoiseConfig;
use crate::state::PipelineIntermediateState;
use crate::Result;

pub trait Extension {
    fn name(&self) -> &str;

    /// Apply model patches. Paired with [`Extension::exit_patch`].
    fn enter_patch(&self) -> Result<()> {
        Ok(())
    }

    fn exit_patch(&self) {}

    fn modify_data_before_denoising(&self, _data: &mut DenoiseData) -> Result<()> {
        Ok(())
    }

    fn on_step(&self, _state: &PipelineIntermediateState) -> Result<()> {
        Ok(())
    }
}

/// Ordered list of extensions.
#[derive(Default)]
pub struct ExtensionHandler {
    extensions: Vec<Box<dyn Extension>>,
}

impl std::fmt::Debug for ExtensionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.extensions.iter().map(|e| e.name()))
            .finish()
    }
}

impl ExtensionHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, extension: impl Extension + 'static) {
        self.extensions.push(Box::new(extension));
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// Enter every extension's patch in order. The returned guard exits them in reverse order;
    /// if an enter fails, the ones already entered are exited before the error is returned.
    pub fn patch_scope(&self) -> Result<PatchScope<'_>> {
        let mut scope = PatchScope { entered: Vec::new() };
        for extension in &self.extensions {
            extension.enter_patch()?;
            scope.entered.push(extension.as_ref());
        }
        Ok(scope)
    }

    pub fn modify_data_before_denoising(&self, data: &mut DenoiseData) -> Result<()> {
        for extension in &self.extensions {
            tracing::debug!(extension = extension.name(), "modify_data_before_denoising");
            extension.modify_data_before_denoising(data)?;
        }
        Ok(())
    }

    pub fn on_step(&self, state: &PipelineIntermediateState) -> Result<()> {
        for extension in &self.extensions {
            extension.on_step(state)?;
        }
        Ok(())
    }
}

/// Guard for entered model patches.
pub struct PatchScope<'a> {
    entered: Vec<&'a dyn Extension>,
}

impl Drop for PatchScope<'_> {
    fn drop(&mut self) {
        while let Some(extension) = self.entered.pop() {
            extension.exit_patch();
        }
    }
}

/// Wraps the configured module tree in fixed-grid tiling.
#[derive(Debug, Clone, Default)]
pub struct TiledDenoiseExtension {
    pub tile_size: Option<usize>,
    pub overlap: Option<usize>,
}

impl Extension for TiledDenoiseExtension {
    fn name(&self) -> &str {
        "tiled_denoise"
    }

    fn modify_data_before_denoising(&self, data: &mut DenoiseData) -> Result<()> {
        let defaults = TiledDenoiseConfig::default();
        let config = TiledDenoiseConfig {
            sub_module: data.module.take(),
            tile_size: self.tile_size.unwrap_or(defaults.tile_size),
            overlap: self.overlap.unwrap_or(defaults.overlap),
        };
        data.module = Some(config.descriptor()?);
        Ok(())
    }
}
