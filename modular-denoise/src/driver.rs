//! The denoise loop.
//!
//! [`DenoiseDriver::invoke`] runs one generation:
//!
//! 1. enter the extension patch scope
//! 2. validate the inputs and build the shared [`DenoiseData`] (timestep window included)
//! 3. let extensions mutate the data once
//! 4. for every timestep, evaluate the root module, commit one scheduler step, report progress
//!
//! The persistent module store and the random generator live exactly as long as the loop.

use candle::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::conditioning::{validate_guidance_scale, ConditioningData, ControlNetData, DenoiseModel, T2IAdapterData};
use crate::debug::{debug_tensor, ensure_finite};
use crate::extensions::ExtensionHandler;
use crate::latents::LatentStore;
use crate::modules::{ModuleContext, ModuleInput};
use crate::registry::{ModuleDescriptor, ModuleRegistry};
use crate::scheduler::Scheduler;
use crate::state::{PersistentStore, PipelineIntermediateState};
use crate::{config_bail, Error, Result};

/// A latent tensor with the seed it was generated from, if known.
#[derive(Debug, Clone)]
pub struct SeededLatents {
    pub tensor: Tensor,
    pub seed: Option<u64>,
}

impl SeededLatents {
    pub fn new(tensor: Tensor, seed: Option<u64>) -> Self {
        Self { tensor, seed }
    }
}

/// Generation inputs as supplied by the host.
#[derive(Debug, Clone)]
pub struct DenoiseInputs {
    pub noise: Option<SeededLatents>,
    pub latents: Option<SeededLatents>,
    pub conditioning: ConditioningData,
    pub steps: usize,
    /// Fraction of the schedule to skip at the start, in `[0, 1]`.
    pub denoising_start: f64,
    /// Fraction of the schedule after which to stop, in `[0, 1]`.
    pub denoising_end: f64,
    pub control_data: Option<Vec<ControlNetData>>,
    pub t2i_adapter_data: Option<Vec<T2IAdapterData>>,
    /// Root of the module tree. `None` runs the standard step.
    pub module: Option<ModuleDescriptor>,
}

impl DenoiseInputs {
    pub fn new(conditioning: ConditioningData, steps: usize) -> Self {
        Self {
            noise: None,
            latents: None,
            conditioning,
            steps,
            denoising_start: 0.0,
            denoising_end: 1.0,
            control_data: None,
            t2i_adapter_data: None,
            module: None,
        }
    }
}

/// Shared state of one generation. Extensions may mutate it before the loop; modules only see
/// it through [`ModuleContext`].
pub struct DenoiseData {
    pub seed: u64,
    pub latents: Tensor,
    pub noise: Option<Tensor>,
    pub conditioning: ConditioningData,
    pub scheduler: Box<dyn Scheduler>,
    pub timesteps: Vec<f64>,
    pub init_timestep: Option<f64>,
    pub num_inference_steps: usize,
    pub control_data: Option<Vec<ControlNetData>>,
    pub t2i_adapter_data: Option<Vec<T2IAdapterData>>,
    pub module: Option<ModuleDescriptor>,
}

/// Timestep window selected from a scheduler's full schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestepWindow {
    pub num_inference_steps: usize,
    pub timesteps: Vec<f64>,
    pub init_timestep: Option<f64>,
    pub begin_index: usize,
}

/// Set the scheduler's timesteps and select the `[denoising_start, denoising_end]` window. The
/// scheduler's begin index is moved to the start of the window.
pub fn init_scheduler(
    scheduler: &mut dyn Scheduler,
    steps: usize,
    denoising_start: f64,
    denoising_end: f64,
) -> Result<TimestepWindow> {
    for (name, value) in [("denoising_start", denoising_start), ("denoising_end", denoising_end)] {
        if !(0.0..=1.0).contains(&value) {
            config_bail!("{name} must be within [0, 1], got {value}")
        }
    }
    scheduler.set_timesteps(steps);
    let all = scheduler.timesteps().to_vec();
    let order = scheduler.order().max(1);
    let first_order: Vec<f64> = all.iter().step_by(order).copied().collect();

    let num_train_timesteps = scheduler.num_train_timesteps() as f64;
    let t_start_val = (num_train_timesteps * (1.0 - denoising_start)).round();
    let t_start_idx = first_order.iter().filter(|&&t| t >= t_start_val).count();
    let t_end_val = (num_train_timesteps * (1.0 - denoising_end)).round();
    let t_end_idx = first_order[t_start_idx..].iter().filter(|&&t| t >= t_end_val).count();

    let t_start_idx = (t_start_idx * order).min(all.len());
    let t_end_idx = t_end_idx * order;
    let window_end = (t_start_idx + t_end_idx).min(all.len());
    let timesteps = all[t_start_idx..window_end].to_vec();

    scheduler.set_begin_index(t_start_idx);
    Ok(TimestepWindow {
        num_inference_steps: timesteps.len() / order,
        init_timestep: all.get(t_start_idx).copied(),
        timesteps,
        begin_index: t_start_idx,
    })
}

/// Runs generations against one model, registry and latent store.
pub struct DenoiseDriver<'a> {
    model: &'a dyn DenoiseModel,
    registry: &'a ModuleRegistry,
    latent_store: &'a dyn LatentStore,
    extensions: ExtensionHandler,
}

impl<'a> DenoiseDriver<'a> {
    pub fn new(model: &'a dyn DenoiseModel, registry: &'a ModuleRegistry, latent_store: &'a dyn LatentStore) -> Self {
        Self {
            model,
            registry,
            latent_store,
            extensions: ExtensionHandler::new(),
        }
    }

    pub fn with_extensions(mut self, extensions: ExtensionHandler) -> Self {
        self.extensions = extensions;
        self
    }

    /// Validate the inputs and build the shared data for a generation.
    pub fn prepare(&self, inputs: DenoiseInputs, mut scheduler: Box<dyn Scheduler>) -> Result<DenoiseData> {
        let mut seed = inputs.noise.as_ref().and_then(|n| n.seed);
        let noise = inputs.noise.map(|n| n.tensor);
        let latents = match (inputs.latents, &noise) {
            (Some(latents), noise) => {
                seed = seed.or(latents.seed);
                latents.tensor.dims4()?;
                if let Some(noise) = noise {
                    if noise.rank() != 4 || noise.dims()[1..] != latents.tensor.dims()[1..] {
                        return Err(Error::shape_mismatch(
                            "noise vs latents",
                            latents.tensor.dims(),
                            noise.dims(),
                        ));
                    }
                }
                latents.tensor
            }
            (None, Some(noise)) => {
                noise.dims4()?;
                noise.zeros_like()?
            }
            (None, None) => return Err(Error::MissingInput("'latents' or 'noise' must be provided".into())),
        };

        validate_guidance_scale(&inputs.conditioning.guidance_scale, inputs.steps)?;
        if inputs.steps == 0 {
            config_bail!("steps must be positive")
        }

        let window = init_scheduler(
            scheduler.as_mut(),
            inputs.steps,
            inputs.denoising_start,
            inputs.denoising_end,
        )?;
        Ok(DenoiseData {
            seed: seed.unwrap_or(0),
            latents,
            noise,
            conditioning: inputs.conditioning,
            scheduler,
            timesteps: window.timesteps,
            init_timestep: window.init_timestep,
            num_inference_steps: window.num_inference_steps,
            control_data: inputs.control_data,
            t2i_adapter_data: inputs.t2i_adapter_data,
            module: inputs.module,
        })
    }

    /// Run the timestep loop over prepared data and return the final latents.
    pub fn denoise<F>(&self, data: &mut DenoiseData, mut callback: F) -> Result<Tensor>
    where
        F: FnMut(&PipelineIntermediateState) -> Result<()>,
    {
        let Some(init_timestep) = data.init_timestep else {
            return Ok(data.latents.clone());
        };
        let mut latents = match &data.noise {
            Some(noise) => data.scheduler.add_noise(&data.latents, noise, init_timestep)?,
            None => data.latents.clone(),
        };

        let mut persistent = PersistentStore::new();
        let mut rng = StdRng::seed_from_u64(data.seed);
        let total_step_count = data.timesteps.len();
        tracing::info!(
            steps = total_step_count,
            init_timestep,
            root = data.module.as_ref().map_or("standard", |m| m.module.as_str()),
            "starting denoise loop"
        );

        for (step_index, &timestep) in data.timesteps.iter().enumerate() {
            let sample = data.scheduler.scale_model_input(&latents, timestep)?;
            let input = ModuleInput {
                latents: latents.clone(),
                sample,
                timestep,
                step_index,
                total_step_count,
                control_data: data.control_data.clone(),
                t2i_adapter_data: data.t2i_adapter_data.clone(),
            };
            let step_output = {
                let mut ctx = ModuleContext {
                    scheduler: data.scheduler.as_ref(),
                    model: self.model,
                    conditioning: &data.conditioning,
                    registry: self.registry,
                    latent_store: self.latent_store,
                    persistent: &mut persistent,
                    rng: &mut rng,
                };
                ctx.run(data.module.as_ref(), input)?
                    .into_step_output(data.scheduler.as_ref(), timestep, &latents)?
            };
            data.scheduler.advance();

            if step_output.prev_sample.dims() != latents.dims() {
                return Err(Error::shape_mismatch("root module output", latents.dims(), step_output.prev_sample.dims()));
            }
            latents = step_output.prev_sample;
            debug_tensor("latents", &latents);
            if cfg!(debug_assertions) {
                ensure_finite("latents", &latents)?;
            }
            tracing::debug!(step_index, timestep, "denoise step done");

            let state = PipelineIntermediateState {
                step: step_index,
                order: data.scheduler.order(),
                total_steps: total_step_count,
                timestep,
                latents: latents.clone(),
                predicted_original: Some(step_output.pred_original_sample),
            };
            callback(&state)?;
            self.extensions.on_step(&state)?;
        }
        tracing::info!(persistent_entries = persistent.len(), "denoise loop finished");
        Ok(latents)
    }

    /// Run a whole generation.
    pub fn invoke<F>(&self, inputs: DenoiseInputs, scheduler: Box<dyn Scheduler>, callback: F) -> Result<Tensor>
    where
        F: FnMut(&PipelineIntermediateState) -> Result<()>,
    {
        let _patches = self.extensions.patch_scope()?;
        let mut data = self.prepare(inputs, scheduler)?;
        self.extensions.modify_data_before_denoising(&mut data)?;
        self.denoise(&mut data, callback)
    }
}
