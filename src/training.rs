use burn::data::dataloader::DataLoaderBuilder;
use burn::nn::loss::{MseLoss, Reduction};
use burn::optim::AdamConfig;
use burn::prelude::{Backend, Config, Module, Tensor};
use burn::record::CompactRecorder;
use burn::tensor::backend::AutodiffBackend;
use burn::train::metric::{Adaptor, CpuUse, LossInput, LossMetric};
use burn::train::{LearnerBuilder, TrainOutput, TrainStep, ValidStep};
use derive_new::new;
use tracing::info;

use crate::data::{ClimBenchBatch, ClimBenchBatcher, ClimBenchDataConfig, ClimBenchDataset};
use crate::error::{self, EmulatorError};
use crate::model::{EmulatorModel, EmulatorModelConfig};

/// Regression output over the soft-maxed bin distributions of all climate
/// variables.
#[derive(new)]
pub struct EmulatorRegressionOutput<B: Backend> {
    /// The loss.
    pub loss: Tensor<B, 1>,
    /// The output [batch_size, vars * bins * cells]
    pub output: Tensor<B, 2>,
    /// The targets [batch_size, vars * bins * cells]
    pub targets: Tensor<B, 2>,
}

impl<B: Backend> Adaptor<LossInput<B>> for EmulatorRegressionOutput<B> {
    fn adapt(&self) -> LossInput<B> {
        LossInput::new(self.loss.clone())
    }
}

/// Forward pass to get loss value: mean squared error between the predicted
/// bin probabilities and the one-hot targets (a Brier-style score).
impl<B: Backend> EmulatorModel<B> {
    pub fn forward_regression(
        &self,
        inputs: Tensor<B, 2>,
        targets: Tensor<B, 2>,
    ) -> EmulatorRegressionOutput<B> {
        let probs = self.forward_probs(inputs);
        let loss = MseLoss::new().forward(probs.clone(), targets.clone(), Reduction::Mean);

        EmulatorRegressionOutput::new(loss, probs, targets)
    }
}

/// Training step
impl<B: AutodiffBackend> TrainStep<ClimBenchBatch<B>, EmulatorRegressionOutput<B>>
    for EmulatorModel<B>
{
    fn step(&self, batch: ClimBenchBatch<B>) -> TrainOutput<EmulatorRegressionOutput<B>> {
        let item = self.forward_regression(batch.inputs, batch.targets);
        TrainOutput::new(self, item.loss.backward(), item)
    }
}

/// Validation step
impl<B: Backend> ValidStep<ClimBenchBatch<B>, EmulatorRegressionOutput<B>> for EmulatorModel<B> {
    fn step(&self, batch: ClimBenchBatch<B>) -> EmulatorRegressionOutput<B> {
        self.forward_regression(batch.inputs, batch.targets)
    }
}

/// Hyperparameters for the emulator
#[derive(Config)]
pub struct TrainingConfig {
    pub model: EmulatorModelConfig,
    pub optimizer: AdamConfig,
    pub data: ClimBenchDataConfig,

    #[config(default = 50)]
    pub num_epochs: usize,

    #[config(default = 4)]
    pub num_workers: usize,

    #[config(default = 22201)]
    pub seed: u64,

    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
}

fn create_artifact_dir(artifact_dir: &str) {
    // Remove existing artifacts before to get an accurate learner summary
    std::fs::remove_dir_all(artifact_dir).ok();
    std::fs::create_dir_all(artifact_dir).ok();
}

pub fn train<B: AutodiffBackend>(
    artifact_dir: &str,
    config: TrainingConfig,
    device: B::Device,
) -> error::Result<EmulatorModel<B>> {
    config.model.layout.validate()?;
    create_artifact_dir(artifact_dir);
    config.save(format!("{artifact_dir}/config.json"))?;

    B::seed(config.seed);

    let val_file = config
        .data
        .val_files
        .first()
        .ok_or_else(|| EmulatorError::InvalidConfig {
            reason: "at least one validation split is required".into(),
        })?;

    // Setup dataloaders
    let batcher_train =
        ClimBenchBatcher::<B>::new(device.clone(), config.model.layout.clone());
    let batcher_valid =
        ClimBenchBatcher::<B::InnerBackend>::new(device.clone(), config.model.layout.clone());

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(config.data.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(ClimBenchDataset::from_csv(&config.data.train_file, &config.model.layout)?);

    let dataloader_valid = DataLoaderBuilder::new(batcher_valid)
        .batch_size(config.data.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(ClimBenchDataset::from_csv(val_file, &config.model.layout)?);

    // Setup learner
    let learner = LearnerBuilder::new(artifact_dir)
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .metric_train_numeric(CpuUse::new())
        .metric_valid_numeric(CpuUse::new())
        .with_file_checkpointer(CompactRecorder::new())
        .devices(vec![device.clone()])
        .num_epochs(config.num_epochs)
        .summary()
        .build(
            config.model.init::<B>(&device),
            config.optimizer.init(),
            config.learning_rate,
        );

    // Start training
    let model_trained = learner.fit(dataloader_train, dataloader_valid);

    model_trained
        .clone()
        .save_file(format!("{artifact_dir}/model"), &CompactRecorder::new())
        .expect("Trained model should be saved successfully");
    info!("saved trained model to {artifact_dir}/model");

    Ok(model_trained)
}
