//! Schedulers used by the denoise loop.
//!
//! The module tree may evaluate the leaf step many times per logical timestep (once per tile or
//! dilation phase). To keep that safe, [`Scheduler::step`] is a pure computation of the candidate
//! next sample and never touches the scheduler's position in the schedule. The driver is the only
//! caller of [`Scheduler::advance`], exactly once per timestep, after the root module returns.
//!
//! # Noise Schedule
//!
//! [`FlowMatchEulerDiscreteScheduler`] uses the rectified flow formulation:
//! ```text
//! x_t = (1 - sigma) * x_0 + sigma * noise
//! ```
//! with sigmas going from 1.0 (pure noise) to 0.0 (clean latent).

use candle::Tensor;

use crate::config::SchedulerConfig;
use crate::{Error, Result};

/// Result of one scheduler update.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// The sample at the next (less noisy) timestep.
    pub prev_sample: Tensor,
    /// Current estimate of the fully denoised latent.
    pub pred_original_sample: Tensor,
    /// The noise prediction the update was computed from.
    pub noise_pred: Tensor,
}

/// A diffusion scheduler with an explicit, driver-owned position in its schedule.
pub trait Scheduler {
    fn num_train_timesteps(&self) -> usize;

    /// Number of model evaluations per logical step.
    fn order(&self) -> usize {
        1
    }

    /// Build the schedule for `num_inference_steps` steps and rewind to the begin index.
    fn set_timesteps(&mut self, num_inference_steps: usize);

    /// Timesteps of the current schedule, one per model evaluation.
    fn timesteps(&self) -> &[f64];

    /// Start the schedule at `begin_index` (partial denoising).
    fn set_begin_index(&mut self, begin_index: usize);

    fn step_index(&self) -> usize;

    fn scale_model_input(&self, sample: &Tensor, _timestep: f64) -> Result<Tensor> {
        Ok(sample.clone())
    }

    /// Compute the update for `sample` at the current step index without advancing.
    fn step(&self, model_output: &Tensor, timestep: f64, sample: &Tensor) -> Result<StepOutput>;

    /// Commit the current step.
    fn advance(&mut self);

    /// Noise a clean sample to the level of `timestep`.
    fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: f64) -> Result<Tensor>;
}

/// Flow Match Euler Discrete Scheduler.
///
/// # Example
///
/// ```ignore
/// let mut scheduler = FlowMatchEulerDiscreteScheduler::new(&config);
/// scheduler.set_timesteps(30);
///
/// for &t in scheduler.timesteps().to_vec().iter() {
///     let noise_pred = model.predict(&latents, t)?;
///     latents = scheduler.step(&noise_pred, t, &latents)?.prev_sample;
///     scheduler.advance();
/// }
/// ```
#[derive(Debug, Clone)]
pub struct FlowMatchEulerDiscreteScheduler {
    config: SchedulerConfig,

    /// Shift parameter applied when dynamic shifting is enabled.
    mu: Option<f64>,

    /// Noise levels for each step plus a trailing 0.0.
    sigmas: Vec<f64>,

    /// `sigmas * num_train_timesteps`, without the trailing entry.
    timesteps: Vec<f64>,

    step_index: usize,
    begin_index: usize,
}

impl FlowMatchEulerDiscreteScheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            config: config.clone(),
            mu: None,
            sigmas: Vec::new(),
            timesteps: Vec::new(),
            step_index: 0,
            begin_index: 0,
        }
    }

    /// Use a resolution-dependent shift, usually from [`calculate_shift`]. Takes effect on the
    /// next [`Scheduler::set_timesteps`].
    pub fn with_mu(mut self, mu: f64) -> Self {
        self.mu = Some(mu);
        self
    }

    /// Maps uniform sigmas to shifted ones, biased towards larger noise for larger `mu`.
    pub fn time_shift(mu: f64, t: f64) -> f64 {
        if t <= 0.0 || t >= 1.0 {
            return t;
        }
        let exp_mu = mu.exp();
        exp_mu / (exp_mu + (1.0 / t - 1.0))
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    pub fn num_inference_steps(&self) -> usize {
        self.timesteps.len()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Rewind to the begin index for a new run over the same schedule.
    pub fn reset(&mut self) {
        self.step_index = self.begin_index;
    }

    /// `x_t = (1 - sigma) * x_0 + sigma * noise`
    pub fn scale_noise(&self, sample: &Tensor, noise: &Tensor, sigma: f64) -> Result<Tensor> {
        Ok(((sample * (1.0 - sigma))? + (noise * sigma)?)?)
    }
}

impl Scheduler for FlowMatchEulerDiscreteScheduler {
    fn num_train_timesteps(&self) -> usize {
        self.config.num_train_timesteps
    }

    fn set_timesteps(&mut self, num_inference_steps: usize) {
        // linspace from sigma_max (1.0) to sigma_min (1/num_train_timesteps)
        let sigma_max = 1.0;
        let sigma_min = 1.0 / self.config.num_train_timesteps as f64;
        let mut sigmas: Vec<f64> = (0..num_inference_steps)
            .map(|i| {
                sigma_max - (sigma_max - sigma_min) * i as f64 / (num_inference_steps - 1).max(1) as f64
            })
            .collect();

        if self.config.use_dynamic_shifting {
            let mu = self.mu.unwrap_or(self.config.base_shift);
            sigmas = sigmas.iter().map(|&s| Self::time_shift(mu, s)).collect();
        }

        self.timesteps = sigmas
            .iter()
            .map(|&s| s * self.config.num_train_timesteps as f64)
            .collect();
        sigmas.push(0.0);
        self.sigmas = sigmas;
        self.step_index = self.begin_index;
    }

    fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    fn set_begin_index(&mut self, begin_index: usize) {
        self.begin_index = begin_index;
        self.step_index = begin_index;
    }

    fn step_index(&self) -> usize {
        self.step_index
    }

    /// Euler step `x_{t+1} = x_t + dt * v`, with `x_0 = x_t - sigma * v`.
    fn step(&self, model_output: &Tensor, _timestep: f64, sample: &Tensor) -> Result<StepOutput> {
        let (Some(&sigma), Some(&sigma_next)) = (
            self.sigmas.get(self.step_index),
            self.sigmas.get(self.step_index + 1),
        ) else {
            return Err(Error::config(format!(
                "step index {} is past the end of a {}-step schedule",
                self.step_index,
                self.timesteps.len()
            )));
        };
        let dt = sigma_next - sigma;
        let prev_sample = (sample + (model_output * dt)?)?;
        let pred_original_sample = (sample - (model_output * sigma)?)?;
        Ok(StepOutput {
            prev_sample,
            pred_original_sample,
            noise_pred: model_output.clone(),
        })
    }

    fn advance(&mut self) {
        self.step_index += 1;
    }

    fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: f64) -> Result<Tensor> {
        let sigma = timestep / self.config.num_train_timesteps as f64;
        self.scale_noise(original, noise, sigma)
    }
}

/// Calculate the dynamic shift parameter `mu` for a latent sequence length.
///
/// ```text
/// mu = (seq_len - base_seq_len) / (max_seq_len - base_seq_len) * (max_shift - base_shift) + base_shift
/// ```
pub fn calculate_shift(
    image_seq_len: usize,
    base_seq_len: usize,
    max_seq_len: usize,
    base_shift: f64,
    max_shift: f64,
) -> f64 {
    let m = (max_shift - base_shift) / (max_seq_len - base_seq_len) as f64;
    let b = base_shift - m * base_seq_len as f64;
    image_seq_len as f64 * m + b
}
