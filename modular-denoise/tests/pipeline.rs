mod common;

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

use candle::{DType, Device, Tensor};
use common::{conditioning, flow_match, values, RecordingControlNet, SpyScheduler, StubModel};
use modular_denoise::conditioning::{ControlMode, StepValue};
use modular_denoise::debug::ensure_finite;
use modular_denoise::extensions::TiledDenoiseExtension;
use modular_denoise::modules::{CosineDecayTransferConfig, DilatedSamplingConfig, MultiDiffusionConfig};
use modular_denoise::ops::PadMode;
use modular_denoise::{
    ControlNetData, DenoiseDriver, DenoiseInputs, Error, Extension, ExtensionHandler, MemoryLatentStore,
    ModuleDescriptor, ModuleRegistry, PipelineIntermediateState, Result, Scheduler, SeededLatents, T2IAdapterData,
};

fn noise(h: usize, w: usize) -> Result<Tensor> {
    Ok(Tensor::randn(0f32, 1f32, (1, 4, h, w), &Device::Cpu)?)
}

fn inputs(steps: usize, noise_tensor: Tensor, module: Option<ModuleDescriptor>) -> Result<DenoiseInputs> {
    let mut inputs = DenoiseInputs::new(conditioning(7.5)?, steps);
    inputs.noise = Some(SeededLatents::new(noise_tensor, Some(42)));
    inputs.module = module;
    Ok(inputs)
}

fn multidiffusion(tile_size: usize, stride: usize, enable_jitter: bool) -> Result<ModuleDescriptor> {
    tiled(None, tile_size, stride, enable_jitter, PadMode::Reflect)
}

fn tiled(
    sub_module: Option<ModuleDescriptor>,
    tile_size: usize,
    stride: usize,
    enable_jitter: bool,
    pad_mode: PadMode,
) -> Result<ModuleDescriptor> {
    MultiDiffusionConfig {
        sub_module,
        tile_size,
        stride,
        pad_mode: Some(pad_mode),
        enable_jitter,
    }
    .descriptor()
}

fn dilated(dilation_scale: usize) -> Result<ModuleDescriptor> {
    DilatedSamplingConfig {
        dilation_scale,
        ..Default::default()
    }
    .descriptor()
}

fn control(model: Arc<RecordingControlNet>, height: usize, width: usize) -> Result<ControlNetData> {
    Ok(ControlNetData {
        model,
        image_tensor: Tensor::zeros((1, 3, height, width), DType::F32, &Device::Cpu)?,
        weight: StepValue::Constant(1.0),
        begin_step_percent: 0.0,
        end_step_percent: 1.0,
        control_mode: ControlMode::Balanced,
    })
}

#[test]
fn scheduler_advances_once_per_timestep_regardless_of_tiles() -> Result<()> {
    // (tile_size, stride) over a 64x64 latent: 1, 4 and 9 tiles.
    for (tile_size, stride, tiles) in [(512, 256, 1), (256, 256, 4), (256, 128, 9)] {
        let model = StubModel::default();
        let registry = ModuleRegistry::new();
        let store = MemoryLatentStore::new();
        let driver = DenoiseDriver::new(&model, &registry, &store);

        let scheduler = SpyScheduler::new();
        let (step_calls, advances) = (scheduler.step_calls.clone(), scheduler.advances.clone());
        let seen_indices = Rc::new(Cell::new(0usize));
        let steps = 4;
        let module = multidiffusion(tile_size, stride, false)?;
        driver.invoke(inputs(steps, noise(64, 64)?, Some(module))?, Box::new(scheduler), |state| {
            assert_eq!(advances.get(), state.step + 1);
            seen_indices.set(seen_indices.get() + 1);
            Ok(())
        })?;

        assert_eq!(advances.get(), steps);
        assert_eq!(seen_indices.get(), steps);
        assert_eq!(step_calls.get(), steps * tiles, "{tiles} tiles");
        assert_eq!(model.calls.get(), steps * tiles);
    }
    Ok(())
}

#[test]
fn multidiffusion_end_to_end_over_512_latent() -> Result<()> {
    let model = StubModel::default();
    let registry = ModuleRegistry::new();
    let store = MemoryLatentStore::new();
    let driver = DenoiseDriver::new(&model, &registry, &store);

    // 256x256 latent windows with a 128 stride.
    let module = multidiffusion(2048, 1024, true)?;
    let input = noise(512, 512)?;
    let result = driver.invoke(inputs(2, input, Some(module))?, Box::new(flow_match()), |_| Ok(()))?;

    assert_eq!(result.dims(), &[1, 4, 512, 512]);
    ensure_finite("result", &result)?;
    assert_eq!(model.calls.get(), 2 * 9);
    assert!(model.sample_dims.borrow().iter().all(|d| d == &[1, 4, 256, 256]));
    Ok(())
}

#[test]
fn demofusion_tree_runs() -> Result<()> {
    let model = StubModel::default();
    let registry = ModuleRegistry::new();
    let store = MemoryLatentStore::new();
    let driver = DenoiseDriver::new(&model, &registry, &store);

    let tree = CosineDecayTransferConfig {
        sub_module_1: Some(multidiffusion(256, 128, true)?),
        sub_module_2: Some(DilatedSamplingConfig::default().descriptor()?),
        decay_rate: 3.0,
    }
    .descriptor()?;
    let result = driver.invoke(inputs(3, noise(48, 48)?, Some(tree))?, Box::new(flow_match()), |_| Ok(()))?;
    assert_eq!(result.dims(), &[1, 4, 48, 48]);
    ensure_finite("result", &result)?;
    Ok(())
}

#[test]
fn jittered_runs_are_reproducible_from_the_seed() -> Result<()> {
    let model = StubModel::default();
    let registry = ModuleRegistry::new();
    let store = MemoryLatentStore::new();
    let driver = DenoiseDriver::new(&model, &registry, &store);
    let input = noise(48, 48)?;

    let run = || -> Result<Vec<f32>> {
        let module = multidiffusion(256, 128, true)?;
        let result = driver.invoke(inputs(3, input.clone(), Some(module))?, Box::new(flow_match()), |_| Ok(()))?;
        values(&result)
    };
    assert_eq!(run()?, run()?);
    Ok(())
}

#[test]
fn standard_run_matches_manual_euler_steps() -> Result<()> {
    let model = StubModel::default();
    let registry = ModuleRegistry::new();
    let store = MemoryLatentStore::new();
    let driver = DenoiseDriver::new(&model, &registry, &store);
    let input = noise(8, 8)?;

    let result = driver.invoke(inputs(3, input.clone(), None)?, Box::new(flow_match()), |_| Ok(()))?;

    // Noise only: latents start at zero and are noised to sigma = 1, i.e. to the noise itself.
    // Guided prediction is (0.05 + 7.5 * 0.05) * x, integrated with the flow-match sigmas.
    let mut scheduler = flow_match();
    scheduler.set_timesteps(3);
    let mut expected = input;
    for i in 0..3 {
        let dt = scheduler.sigmas()[i + 1] - scheduler.sigmas()[i];
        expected = (&expected * (1.0 + 0.425 * dt))?;
    }
    let diff = (&result - &expected)?.abs()?.max_all()?.to_scalar::<f32>()?;
    assert!(diff < 1e-4, "max diff {diff}");
    Ok(())
}

#[test]
fn invalid_inputs_are_rejected() -> Result<()> {
    let model = StubModel::default();
    let registry = ModuleRegistry::new();
    let store = MemoryLatentStore::new();
    let driver = DenoiseDriver::new(&model, &registry, &store);

    let missing = DenoiseInputs::new(conditioning(7.5)?, 4);
    assert!(matches!(
        driver.invoke(missing, Box::new(flow_match()), |_| Ok(())),
        Err(Error::MissingInput(_))
    ));

    let mut mismatched = inputs(4, noise(8, 8)?, None)?;
    mismatched.latents = Some(SeededLatents::new(noise(8, 16)?, None));
    assert!(matches!(
        driver.invoke(mismatched, Box::new(flow_match()), |_| Ok(())),
        Err(Error::ShapeMismatch { .. })
    ));

    let mut short_cfg = inputs(4, noise(8, 8)?, None)?;
    short_cfg.conditioning.guidance_scale = StepValue::PerStep(vec![7.5; 3]);
    assert!(matches!(
        driver.invoke(short_cfg, Box::new(flow_match()), |_| Ok(())),
        Err(Error::Configuration(_))
    ));

    let mut low_cfg = inputs(4, noise(8, 8)?, None)?;
    low_cfg.conditioning.guidance_scale = StepValue::Constant(0.5);
    assert!(driver.invoke(low_cfg, Box::new(flow_match()), |_| Ok(())).is_err());
    Ok(())
}

#[test]
fn latents_seed_and_batch_size_may_differ_from_noise() -> Result<()> {
    let model = StubModel::default();
    let registry = ModuleRegistry::new();
    let store = MemoryLatentStore::new();
    let driver = DenoiseDriver::new(&model, &registry, &store);

    let mut both = inputs(2, noise(8, 8)?, None)?;
    both.noise = Some(SeededLatents::new(noise(8, 8)?, None));
    both.latents = Some(SeededLatents::new(noise(8, 8)?, Some(9)));
    let data = driver.prepare(both, Box::new(flow_match()))?;
    assert_eq!(data.seed, 9);

    let mut unseeded = inputs(2, noise(8, 8)?, None)?;
    unseeded.noise = Some(SeededLatents::new(noise(8, 8)?, None));
    assert_eq!(driver.prepare(unseeded, Box::new(flow_match()))?.seed, 0);
    Ok(())
}

#[test]
fn partial_denoise_starts_inside_the_schedule() -> Result<()> {
    let model = StubModel::default();
    let registry = ModuleRegistry::new();
    let store = MemoryLatentStore::new();
    let driver = DenoiseDriver::new(&model, &registry, &store);

    let mut partial = inputs(10, noise(8, 8)?, None)?;
    partial.latents = Some(SeededLatents::new(Tensor::zeros((1, 4, 8, 8), DType::F32, &Device::Cpu)?, None));
    partial.denoising_start = 0.5;
    let mut steps_seen = Vec::new();
    driver.invoke(partial, Box::new(flow_match()), |state| {
        steps_seen.push((state.step, state.total_steps));
        Ok(())
    })?;
    assert_eq!(steps_seen, (0..5).map(|i| (i, 5)).collect::<Vec<_>>());
    assert_eq!(model.calls.get(), 5);
    Ok(())
}

struct StepCounter {
    steps: Rc<Cell<usize>>,
}

impl Extension for StepCounter {
    fn name(&self) -> &str {
        "step_counter"
    }

    fn on_step(&self, _state: &PipelineIntermediateState) -> Result<()> {
        self.steps.set(self.steps.get() + 1);
        Ok(())
    }
}

#[test]
fn extensions_modify_data_and_observe_steps() -> Result<()> {
    let model = StubModel::default();
    let registry = ModuleRegistry::new();
    let store = MemoryLatentStore::new();
    let steps = Rc::new(Cell::new(0));
    let mut extensions = ExtensionHandler::new();
    extensions.push(TiledDenoiseExtension {
        tile_size: Some(256),
        overlap: Some(128),
    });
    extensions.push(StepCounter { steps: steps.clone() });
    let driver = DenoiseDriver::new(&model, &registry, &store).with_extensions(extensions);

    driver.invoke(inputs(2, noise(48, 48)?, None)?, Box::new(flow_match()), |_| Ok(()))?;
    assert_eq!(steps.get(), 2);
    // The standard step was wrapped into 32x32 tiles with stride 16: 2 x 2 tiles per step.
    assert_eq!(model.calls.get(), 2 * 4);
    Ok(())
}

#[test]
fn controlnet_is_gated_and_cropped_per_tile() -> Result<()> {
    let model = StubModel::default();
    let registry = ModuleRegistry::new();
    let store = MemoryLatentStore::new();
    let driver = DenoiseDriver::new(&model, &registry, &store);
    let controlnet = Arc::new(RecordingControlNet::default());

    let mut run = inputs(4, noise(32, 32)?, Some(multidiffusion(128, 128, false)?))?;
    run.control_data = Some(vec![ControlNetData {
        model: controlnet.clone(),
        image_tensor: Tensor::zeros((1, 3, 256, 256), DType::F32, &Device::Cpu)?,
        weight: StepValue::Constant(1.0),
        begin_step_percent: 0.0,
        end_step_percent: 0.25,
        control_mode: ControlMode::Balanced,
    }]);
    driver.invoke(run, Box::new(flow_match()), |_| Ok(()))?;

    // Active at steps floor(0) ..= ceil(1): two steps of four 16x16 tiles.
    let dims = controlnet.image_dims.borrow();
    assert_eq!(dims.len(), 2 * 4);
    assert!(dims.iter().all(|d| d == &[1, 3, 128, 128]));
    assert_eq!(model.calls_with_control.get(), 2 * 4);
    assert_eq!(model.calls.get(), 4 * 4);
    Ok(())
}

#[test]
fn scheduler_step_index_ends_at_window_end() -> Result<()> {
    let mut scheduler = flow_match();
    let window = modular_denoise::driver::init_scheduler(&mut scheduler, 6, 0.0, 1.0)?;
    assert_eq!(window.timesteps.len(), 6);
    for _ in &window.timesteps {
        scheduler.advance();
    }
    assert_eq!(scheduler.step_index(), 6);
    Ok(())
}

#[test]
fn t2i_adapter_states_follow_tiles() -> Result<()> {
    let model = StubModel::default();
    let registry = ModuleRegistry::new();
    let store = MemoryLatentStore::new();
    let driver = DenoiseDriver::new(&model, &registry, &store);

    let mut run = inputs(3, noise(32, 32)?, Some(multidiffusion(128, 128, false)?))?;
    run.t2i_adapter_data = Some(vec![T2IAdapterData {
        adapter_state: vec![
            Tensor::ones((1, 4, 32, 32), DType::F32, &Device::Cpu)?,
            Tensor::ones((1, 4, 16, 16), DType::F32, &Device::Cpu)?,
        ],
        weight: StepValue::Constant(0.5),
        begin_step_percent: 0.0,
        end_step_percent: 1.0,
    }]);
    let result = driver.invoke(run, Box::new(flow_match()), |_| Ok(()))?;
    assert_eq!(result.dims(), &[1, 4, 32, 32]);
    assert_eq!(model.calls_with_t2i.get(), 3 * 4);
    assert_eq!(model.calls_with_control.get(), 0);
    Ok(())
}

#[test]
fn dilated_sampling_runs_inside_tiles() -> Result<()> {
    // 25x25 windows with stride 13 over 50x37: 3 x 2 tiles, each split into 9 phases.
    for (enable_jitter, pad_mode) in [
        (false, PadMode::Reflect),
        (true, PadMode::Reflect),
        (true, PadMode::Replicate),
    ] {
        let model = StubModel::default();
        let registry = ModuleRegistry::new();
        let store = MemoryLatentStore::new();
        let driver = DenoiseDriver::new(&model, &registry, &store);

        let module = tiled(Some(dilated(3)?), 200, 104, enable_jitter, pad_mode)?;
        let result = driver.invoke(inputs(2, noise(50, 37)?, Some(module))?, Box::new(flow_match()), |_| Ok(()))?;
        assert_eq!(result.dims(), &[1, 4, 50, 37]);
        ensure_finite("result", &result)?;
        assert_eq!(model.calls.get(), 2 * 6 * 9, "jitter {enable_jitter}, {pad_mode:?}");
    }
    Ok(())
}

#[test]
fn jittered_tiles_crop_control_images_and_adapter_states() -> Result<()> {
    let model = StubModel::default();
    let registry = ModuleRegistry::new();
    let store = MemoryLatentStore::new();
    let driver = DenoiseDriver::new(&model, &registry, &store);
    let controlnet = Arc::new(RecordingControlNet::default());
    let device = Device::Cpu;

    // 32x32 windows with stride 16 over 48x48 (2 x 2 tiles), jitter range 4.
    let mut run = inputs(2, noise(48, 48)?, Some(multidiffusion(256, 128, true)?))?;
    run.control_data = Some(vec![control(controlnet.clone(), 48 * 8, 48 * 8)?]);
    run.t2i_adapter_data = Some(vec![T2IAdapterData {
        adapter_state: vec![
            Tensor::ones((1, 4, 48, 48), DType::F32, &device)?,
            Tensor::ones((1, 4, 24, 24), DType::F32, &device)?,
            Tensor::ones((1, 4, 12, 12), DType::F32, &device)?,
        ],
        weight: StepValue::Constant(1.0),
        begin_step_percent: 0.0,
        end_step_percent: 1.0,
    }]);
    let result = driver.invoke(run, Box::new(flow_match()), |_| Ok(()))?;
    assert_eq!(result.dims(), &[1, 4, 48, 48]);
    ensure_finite("result", &result)?;

    let image_dims = controlnet.image_dims.borrow();
    assert_eq!(image_dims.len(), 2 * 4);
    assert!(image_dims.iter().all(|d| d == &[1, 3, 32 * 8, 32 * 8]));

    let t2i_dims = model.t2i_dims.borrow();
    assert_eq!(t2i_dims.len(), 2 * 4);
    let expected = vec![vec![1, 4, 32, 32], vec![1, 4, 16, 16], vec![1, 4, 8, 8]];
    assert!(t2i_dims.iter().all(|d| d == &expected), "{t2i_dims:?}");
    assert!(model.sample_dims.borrow().iter().all(|d| d == &[1, 4, 32, 32]));
    Ok(())
}

#[test]
fn dilated_sampling_ignores_spatial_conditioning() -> Result<()> {
    let model = StubModel::default();
    let registry = ModuleRegistry::new();
    let store = MemoryLatentStore::new();
    let driver = DenoiseDriver::new(&model, &registry, &store);
    let controlnet = Arc::new(RecordingControlNet::default());

    let mut run = inputs(3, noise(16, 16)?, Some(dilated(2)?))?;
    run.control_data = Some(vec![control(controlnet.clone(), 128, 128)?]);
    let result = driver.invoke(run, Box::new(flow_match()), |_| Ok(()))?;

    assert_eq!(result.dims(), &[1, 4, 16, 16]);
    assert!(controlnet.image_dims.borrow().is_empty());
    assert_eq!(model.calls.get(), 3 * 4);
    assert_eq!(model.calls_with_control.get(), 0);
    Ok(())
}
