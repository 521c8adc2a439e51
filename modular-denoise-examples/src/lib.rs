//! Helpers shared by the modular-denoise examples.

use std::path::Path;

use anyhow::{Context, Result};
use candle::utils::{cuda_is_available, metal_is_available};
use candle::{Device, Tensor};
use modular_denoise::ModuleDescriptor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            println!("Running on CPU, to run on GPU(metal), build this example with `--features metal`");
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            println!("Running on CPU, to run on GPU, build this example with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

/// Standard normal noise of `shape` from a seeded Box-Muller generator, so that CPU runs
/// are reproducible.
pub fn seeded_noise(shape: (usize, usize, usize, usize), seed: u64, device: &Device) -> Result<Tensor> {
    let (b, c, h, w) = shape;
    let len = b * c * h * w;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = Vec::with_capacity(len + 1);
    while data.len() < len {
        // Reject 0 so that ln stays finite.
        let u1: f64 = 1.0 - rng.random::<f64>();
        let u2: f64 = rng.random();
        let radius = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f64::consts::PI * u2;
        data.push((radius * theta.cos()) as f32);
        data.push((radius * theta.sin()) as f32);
    }
    data.truncate(len);
    Ok(Tensor::from_vec(data, shape, device)?)
}

/// Read a module tree from a JSON file.
pub fn load_module_tree(path: &Path) -> Result<ModuleDescriptor> {
    let json = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("parsing module tree {}", path.display()))
}
