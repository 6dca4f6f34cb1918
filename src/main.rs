// https://burn.dev/book/basic-workflow/backend.html
mod confidence;
mod data;
mod error;
mod evaluation;
mod experiments;
mod model;
mod training;

use burn::backend::wgpu::AutoGraphicsApi;
use burn::backend::{Autodiff, Wgpu};
use burn::module::AutodiffModule;
use burn::optim::AdamConfig;
use tracing_subscriber::EnvFilter;

use crate::data::{ClimBenchDataConfig, ClimBenchDataModule, VariableLayout};
use crate::error::Result;
use crate::model::{ClimateEmulator, EmulatorModelConfig};
use crate::training::TrainingConfig;

const ARTIFACT_DIR: &str = "/tmp/climbenchburn";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run() {
        tracing::error!("run failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    if std::env::args().any(|arg| arg == "--write-experiment-configs") {
        return experiments::write_experiment_configs("configs/experiment");
    }

    type MyBackend = Wgpu<AutoGraphicsApi, f32, i32>;
    type MyAutodiffBackend = Autodiff<MyBackend>;

    let device = burn::backend::wgpu::WgpuDevice::BestAvailable;

    // tas in Kelvin anomalies, pr in mm/day, both over a coarsened grid
    let layout = VariableLayout::new(
        vec!["tas".into(), "pr".into()],
        16,
        144,
        vec![(-2.0, 10.0), (0.0, 16.0)],
    );
    let data = ClimBenchDataConfig::new(
        layout.clone(),
        "data/train.csv".into(),
        vec!["data/val.csv".into()],
        vec!["data/test.csv".into()],
    );

    let trained = training::train::<MyAutodiffBackend>(
        ARTIFACT_DIR,
        TrainingConfig::new(
            EmulatorModelConfig::new(256, layout.clone()),
            AdamConfig::new(),
            data.clone(),
        ),
        device.clone(),
    )?;

    // Post-testing on low/high confidence points
    let emulator = ClimateEmulator::new(trained.valid(), layout);
    let data_module = ClimBenchDataModule::<MyBackend>::new(data, device)?;
    confidence::run_confidence_evaluation(
        &emulator,
        &data_module.val_dataloader()?,
        &data_module.test_dataloader()?,
    )?;
    Ok(())
}
