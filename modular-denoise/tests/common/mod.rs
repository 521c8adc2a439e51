#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use candle::{DType, Device, Tensor};
use modular_denoise::conditioning::{
    AdditionalResiduals, ControlMode, ControlNetModel, ControlResiduals, GuidedPrediction, StepProgress,
};
use modular_denoise::config::ModuleKwargs;
use modular_denoise::state::PersistentStore;
use modular_denoise::{
    ConditioningData, DenoiseModel, FlowMatchEulerDiscreteScheduler, MemoryLatentStore, ModuleContext,
    ModuleDescriptor, ModuleInput, ModuleOutput, ModuleRegistry, NoisePredictionModule, Result, Scheduler,
    SchedulerConfig, StepOutput, StepValue,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Deterministic model: `uncond = 0.05 * sample`, `cond = 0.1 * sample`.
#[derive(Debug, Default)]
pub struct StubModel {
    pub calls: Cell<usize>,
    pub calls_with_control: Cell<usize>,
    pub calls_with_t2i: Cell<usize>,
    pub sample_dims: RefCell<Vec<Vec<usize>>>,
    /// Shapes of the T2I-Adapter residuals of every call that received some.
    pub t2i_dims: RefCell<Vec<Vec<Vec<usize>>>>,
}

impl DenoiseModel for StubModel {
    fn predict(
        &self,
        sample: &Tensor,
        _timestep: f64,
        _conditioning: &ConditioningData,
        _progress: StepProgress,
        residuals: &AdditionalResiduals,
    ) -> Result<GuidedPrediction> {
        self.calls.set(self.calls.get() + 1);
        if residuals.mid_block.is_some() {
            self.calls_with_control.set(self.calls_with_control.get() + 1);
        }
        if let Some(states) = &residuals.down_intrablock {
            self.calls_with_t2i.set(self.calls_with_t2i.get() + 1);
            self.t2i_dims
                .borrow_mut()
                .push(states.iter().map(|s| s.dims().to_vec()).collect());
        }
        self.sample_dims.borrow_mut().push(sample.dims().to_vec());
        Ok(GuidedPrediction {
            uncond: (sample * 0.05)?,
            cond: (sample * 0.1)?,
        })
    }
}

/// ControlNet recording the control image sizes it is evaluated on.
#[derive(Debug, Default)]
pub struct RecordingControlNet {
    pub image_dims: RefCell<Vec<Vec<usize>>>,
}

impl ControlNetModel for RecordingControlNet {
    fn residuals(
        &self,
        image: &Tensor,
        sample: &Tensor,
        _timestep: f64,
        _conditioning: &ConditioningData,
        _control_mode: ControlMode,
    ) -> Result<ControlResiduals> {
        self.image_dims.borrow_mut().push(image.dims().to_vec());
        Ok(ControlResiduals {
            down_block: vec![sample.zeros_like()?],
            mid_block: sample.zeros_like()?,
        })
    }
}

pub fn conditioning(guidance_scale: f64) -> Result<ConditioningData> {
    let device = Device::Cpu;
    Ok(ConditioningData {
        cond_text_embeddings: Tensor::zeros((1, 77, 8), DType::F32, &device)?,
        uncond_text_embeddings: Tensor::zeros((1, 77, 8), DType::F32, &device)?,
        guidance_scale: StepValue::Constant(guidance_scale),
    })
}

pub fn flow_match() -> FlowMatchEulerDiscreteScheduler {
    FlowMatchEulerDiscreteScheduler::new(&SchedulerConfig::default())
}

/// Flow-match scheduler counting step computations and commits.
#[derive(Debug)]
pub struct SpyScheduler {
    pub inner: FlowMatchEulerDiscreteScheduler,
    pub step_calls: Rc<Cell<usize>>,
    pub advances: Rc<Cell<usize>>,
}

impl SpyScheduler {
    pub fn new() -> Self {
        Self {
            inner: flow_match(),
            step_calls: Rc::new(Cell::new(0)),
            advances: Rc::new(Cell::new(0)),
        }
    }
}

impl Scheduler for SpyScheduler {
    fn num_train_timesteps(&self) -> usize {
        self.inner.num_train_timesteps()
    }

    fn set_timesteps(&mut self, num_inference_steps: usize) {
        self.inner.set_timesteps(num_inference_steps)
    }

    fn timesteps(&self) -> &[f64] {
        self.inner.timesteps()
    }

    fn set_begin_index(&mut self, begin_index: usize) {
        self.inner.set_begin_index(begin_index)
    }

    fn step_index(&self) -> usize {
        self.inner.step_index()
    }

    fn step(&self, model_output: &Tensor, timestep: f64, sample: &Tensor) -> Result<StepOutput> {
        self.step_calls.set(self.step_calls.get() + 1);
        self.inner.step(model_output, timestep, sample)
    }

    fn advance(&mut self) {
        self.advances.set(self.advances.get() + 1);
        self.inner.advance()
    }

    fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: f64) -> Result<Tensor> {
        self.inner.add_noise(original, noise, timestep)
    }
}

/// What a [`SpyModule`] returns.
#[derive(Debug, Clone, Copy)]
pub enum SpyOutput {
    /// A constant noise prediction.
    Noise(f32),
    /// A step-output with every field set to the constant.
    Step(f32),
    /// A noise prediction holding the 1-based index of the call.
    CallIndex,
}

/// Test module returning constants and counting its calls.
pub struct SpyModule {
    output: SpyOutput,
    calls: Rc<Cell<usize>>,
}

impl NoisePredictionModule for SpyModule {
    fn step(&self, _ctx: &mut ModuleContext<'_>, input: ModuleInput) -> Result<ModuleOutput> {
        let index = self.calls.get();
        self.calls.set(index + 1);
        let full = |v: f32| Tensor::full(v, input.latents.dims(), input.latents.device());
        Ok(match self.output {
            SpyOutput::Noise(v) => ModuleOutput::NoisePrediction(full(v)?),
            SpyOutput::CallIndex => ModuleOutput::NoisePrediction(full((index + 1) as f32)?),
            SpyOutput::Step(v) => ModuleOutput::Step(StepOutput {
                prev_sample: full(v)?,
                pred_original_sample: full(v)?,
                noise_pred: full(v)?,
            }),
        })
    }
}

/// Register a spy under `key` and return its call counter. The counter is shared by every
/// instance the registry builds.
pub fn register_spy(registry: &mut ModuleRegistry, key: &str, output: SpyOutput) -> Rc<Cell<usize>> {
    let calls = Rc::new(Cell::new(0));
    let counter = calls.clone();
    registry.register_factory(key, move |_| {
        Ok(Box::new(SpyModule {
            output,
            calls: counter.clone(),
        }) as Box<dyn NoisePredictionModule>)
    });
    calls
}

pub fn spy_descriptor(key: &str) -> ModuleDescriptor {
    ModuleDescriptor::new(key, key, ModuleKwargs::new())
}

/// Owns everything a [`ModuleContext`] borrows.
pub struct Harness {
    pub scheduler: SpyScheduler,
    pub model: StubModel,
    pub conditioning: ConditioningData,
    pub registry: ModuleRegistry,
    pub store: MemoryLatentStore,
    pub persistent: PersistentStore,
    pub rng: StdRng,
}

impl Harness {
    pub fn new(steps: usize) -> Result<Self> {
        let mut scheduler = SpyScheduler::new();
        scheduler.set_timesteps(steps);
        Ok(Self {
            scheduler,
            model: StubModel::default(),
            conditioning: conditioning(1.0)?,
            registry: ModuleRegistry::new(),
            store: MemoryLatentStore::new(),
            persistent: PersistentStore::new(),
            rng: StdRng::seed_from_u64(0),
        })
    }

    /// Evaluate `descriptor` once at `(step_index, timestep)` on `latents`.
    pub fn run(
        &mut self,
        descriptor: &ModuleDescriptor,
        latents: &Tensor,
        timestep: f64,
        step_index: usize,
        total_step_count: usize,
    ) -> Result<ModuleOutput> {
        let input = ModuleInput {
            latents: latents.clone(),
            sample: latents.clone(),
            timestep,
            step_index,
            total_step_count,
            control_data: None,
            t2i_adapter_data: None,
        };
        self.run_input(descriptor, input)
    }

    /// Evaluate `descriptor` once on a caller-built input.
    pub fn run_input(&mut self, descriptor: &ModuleDescriptor, input: ModuleInput) -> Result<ModuleOutput> {
        let mut ctx = ModuleContext {
            scheduler: &self.scheduler,
            model: &self.model,
            conditioning: &self.conditioning,
            registry: &self.registry,
            latent_store: &self.store,
            persistent: &mut self.persistent,
            rng: &mut self.rng,
        };
        ctx.run(Some(descriptor), input)
    }
}

pub fn values(t: &Tensor) -> Result<Vec<f32>> {
    Ok(t.flatten_all()?.to_vec1::<f32>()?)
}

pub fn assert_all_close(t: &Tensor, expected: f32) -> Result<()> {
    for v in values(t)? {
        assert!((v - expected).abs() < 1e-5, "expected {expected}, got {v}");
    }
    Ok(())
}
