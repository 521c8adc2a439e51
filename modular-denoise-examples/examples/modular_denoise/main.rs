//! Modular denoise: run module trees against a synthetic model.
//!
//! # Usage
//!
//! ```bash
//! # Print a preset tree as JSON
//! cargo run --release --example modular_denoise -- preset demofusion > tree.json
//!
//! # Denoise a 1024x1024 image-space canvas with a tree from disk
//! cargo run --release --example modular_denoise -- run \
//!     --tree tree.json --height 1024 --width 1024 --steps 20 --output-dir ./latents/
//!
//! # Use a preset directly
//! cargo run --release --example modular_denoise -- --seed 7 run --preset multidiffusion
//! ```

mod common;
mod synthetic;

use std::path::PathBuf;

use anyhow::{bail, Result};
use candle::{DType, Tensor};
use clap::{Parser, Subcommand};
use common::Preset;
use modular_denoise::config::LATENT_SCALE_FACTOR;
use modular_denoise::debug::tensor_stats;
use modular_denoise::{
    ConditioningData, DenoiseDriver, DenoiseInputs, FlowMatchEulerDiscreteScheduler, ModuleRegistry,
    SafetensorsLatentStore, SchedulerConfig, SeededLatents, StepValue,
};
use modular_denoise_examples::{device, load_module_tree, seeded_noise};
use synthetic::SyntheticModel;

const LATENT_CHANNELS: usize = 4;

#[derive(Parser)]
#[command(
    name = "modular-denoise",
    about = "Run composable noise-prediction trees",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Run on CPU instead of GPU.
    #[arg(long, global = true)]
    cpu: bool,

    /// Enable Chrome tracing profiler.
    #[arg(long, global = true)]
    tracing: bool,

    /// Random seed for the initial noise.
    #[arg(long, global = true)]
    seed: Option<u64>,
}

#[derive(Subcommand)]
enum Command {
    /// Denoise a synthetic canvas.
    Run {
        /// JSON module tree. Overrides `--preset`.
        #[arg(long)]
        tree: Option<PathBuf>,

        /// Preset tree used when no `--tree` is given.
        #[arg(long, value_enum, default_value_t = Preset::Standard)]
        preset: Preset,

        /// Tile size of the preset, in image space.
        #[arg(long, default_value_t = 1024)]
        tile_size: usize,

        /// Canvas height in image space (must be divisible by 8).
        #[arg(long, default_value_t = 512)]
        height: usize,

        /// Canvas width in image space (must be divisible by 8).
        #[arg(long, default_value_t = 512)]
        width: usize,

        /// Number of denoising steps.
        #[arg(long, default_value_t = 20)]
        steps: usize,

        /// Classifier-free guidance scale.
        #[arg(long, default_value_t = 7.5)]
        guidance_scale: f64,

        /// Fraction of the schedule to skip.
        #[arg(long, default_value_t = 0.0)]
        denoising_start: f64,

        /// Fraction of the schedule after which to stop.
        #[arg(long, default_value_t = 1.0)]
        denoising_end: f64,

        /// Directory latents are read from and written to.
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,

        /// Name of the written latents.
        #[arg(long, default_value = "modular_denoise_output")]
        output: String,
    },

    /// Print a preset tree as JSON.
    Preset {
        #[arg(value_enum)]
        preset: Preset,

        /// Tile size of the preset, in image space.
        #[arg(long, default_value_t = 1024)]
        tile_size: usize,
    },
}

fn main() -> Result<()> {
    let args = Cli::parse();
    let _guard = common::setup_tracing(args.tracing);

    match args.command {
        Command::Preset { preset, tile_size } => {
            let tree = preset.descriptor(tile_size)?;
            println!("{}", serde_json::to_string_pretty(&tree)?);
        }
        Command::Run {
            tree,
            preset,
            tile_size,
            height,
            width,
            steps,
            guidance_scale,
            denoising_start,
            denoising_end,
            output_dir,
            output,
        } => {
            if height % LATENT_SCALE_FACTOR != 0 || width % LATENT_SCALE_FACTOR != 0 {
                bail!("height and width must be multiples of {LATENT_SCALE_FACTOR}, got {height}x{width}")
            }
            let device = device(args.cpu)?;
            let module = match &tree {
                Some(path) => load_module_tree(path)?,
                None => preset.descriptor(tile_size)?,
            };
            tracing::info!(module = %module.module, "loaded module tree");

            let config = SchedulerConfig::default();
            let scheduler = FlowMatchEulerDiscreteScheduler::new(&config);
            let model = SyntheticModel::new(&[0.5, -0.25, 0.1, 0.0], config.num_train_timesteps, &device)?;
            let registry = ModuleRegistry::new();
            let store = SafetensorsLatentStore::new(&output_dir, &device);
            let driver = DenoiseDriver::new(&model, &registry, &store);

            let seed = args.seed.unwrap_or(0);
            let shape = (1, LATENT_CHANNELS, height / LATENT_SCALE_FACTOR, width / LATENT_SCALE_FACTOR);
            let noise = seeded_noise(shape, seed, &device)?;
            let embeddings = Tensor::zeros((1, 77, 768), DType::F32, &device)?;
            let conditioning = ConditioningData {
                cond_text_embeddings: embeddings.clone(),
                uncond_text_embeddings: embeddings,
                guidance_scale: StepValue::Constant(guidance_scale),
            };

            let mut inputs = DenoiseInputs::new(conditioning, steps);
            inputs.noise = Some(SeededLatents::new(noise, Some(seed)));
            inputs.denoising_start = denoising_start;
            inputs.denoising_end = denoising_end;
            inputs.module = Some(module);

            let start = std::time::Instant::now();
            let latents = driver.invoke(inputs, Box::new(scheduler), |state| {
                println!("step {}/{} (t = {:.1})", state.step + 1, state.total_steps, state.timestep);
                Ok(())
            })?;
            let (mean, std, min, max) = tensor_stats(&latents)?;
            tracing::info!(elapsed = ?start.elapsed(), mean, std, min, max, "denoising finished");

            let path = store.save(&output, &latents)?;
            println!("latents written to {}", path.display());
        }
    }
    Ok(())
}
