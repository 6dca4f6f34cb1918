// https://burn.dev/book/basic-workflow/data.html
// https://github.com/tracel-ai/burn/blob/v0.13.2/crates/burn-dataset/src/vision/mnist.rs
use std::fs::File;
use std::io::Seek;
use std::sync::Arc;

use arrow::array::{Float64Array, RecordBatch};
use arrow::error::ArrowError;
use arrow_csv::reader::{Format, ReaderBuilder};
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::data::dataset::Dataset;
use burn::prelude::{Backend, Config, Tensor};
use burn::tensor::{Data, Shape};

use crate::error::{self, EmulatorError};

/// Emission-scenario forcing features, one CSV column each.
pub const IN_VAR_IDS: [&str; 4] = ["BC_sum", "CO2_sum", "SO2_sum", "CH4_sum"];

/// Layout of the concatenated target vector.
///
/// Each output variable occupies a `[bins, cells]` block: `cells` flattened
/// lon-lat grid cells, each holding a one-hot distribution over `bins`
/// discretized value bins. Blocks are concatenated in `var_ids` order, so the
/// full vector has width `var_ids.len() * bins * cells`.
#[derive(Config, Debug)]
pub struct VariableLayout {
    pub var_ids: Vec<String>,
    pub bins: usize,
    pub cells: usize,
    /// Physical value range per variable, used for bin discretization.
    pub ranges: Vec<(f64, f64)>,
}

impl VariableLayout {
    /// Checked once up front so a bad layout fails the run before any
    /// pipeline work starts, not at an arbitrary call site.
    pub fn validate(&self) -> error::Result<()> {
        if self.var_ids.is_empty() {
            return Err(EmulatorError::InvalidLayout {
                reason: "no output variables".into(),
            });
        }
        if self.bins == 0 || self.cells == 0 {
            return Err(EmulatorError::InvalidLayout {
                reason: format!("bins={} cells={} must both be non-zero", self.bins, self.cells),
            });
        }
        if self.ranges.len() != self.var_ids.len() {
            return Err(EmulatorError::InvalidLayout {
                reason: format!(
                    "{} value ranges for {} variables",
                    self.ranges.len(),
                    self.var_ids.len()
                ),
            });
        }
        for (var_id, (min, max)) in self.var_ids.iter().zip(&self.ranges) {
            if min >= max {
                return Err(EmulatorError::InvalidLayout {
                    reason: format!("empty value range [{min}, {max}] for {var_id}"),
                });
            }
        }
        Ok(())
    }

    pub fn width(&self) -> usize {
        self.var_ids.len() * self.bins * self.cells
    }

    /// Width of one variable's `[bins, cells]` block.
    pub fn block(&self) -> usize {
        self.bins * self.cells
    }

    fn bin_index(&self, var: usize, value: f32) -> usize {
        let (min, max) = self.ranges[var];
        let frac = ((value as f64 - min) / (max - min)).clamp(0.0, 1.0);
        ((frac * self.bins as f64) as usize).min(self.bins - 1)
    }

    /// One-hot encode raw per-variable cell values into the concatenated
    /// target vector.
    pub fn encode_targets(&self, fields: &[Vec<f32>]) -> Vec<f32> {
        debug_assert_eq!(fields.len(), self.var_ids.len());
        let mut encoded = vec![0.0; self.width()];
        for (var, values) in fields.iter().enumerate() {
            debug_assert_eq!(values.len(), self.cells);
            let offset = var * self.block();
            for (cell, &value) in values.iter().enumerate() {
                let bin = self.bin_index(var, value);
                encoded[offset + bin * self.cells + cell] = 1.0;
            }
        }
        encoded
    }
}

/// One sample: forcing features plus raw (undiscretized) field values per
/// output variable.
#[derive(Debug, Clone)]
pub struct ClimBenchItem {
    pub input: Vec<f32>,
    pub fields: Vec<Vec<f32>>,
}

/// ClimateBench-style CSV split loaded eagerly into memory through Arrow.
pub struct ClimBenchDataset {
    items: Vec<ClimBenchItem>,
}

fn column<'a>(batch: &'a RecordBatch, name: &str) -> error::Result<&'a Float64Array> {
    Ok(batch
        .column_by_name(name)
        .ok_or_else(|| ArrowError::SchemaError(format!("missing column {name}")))?
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| ArrowError::SchemaError(format!("column {name} is not Float64")))?)
}

impl ClimBenchDataset {
    pub fn from_csv(path: &str, layout: &VariableLayout) -> error::Result<Self> {
        layout.validate()?;
        let mut file =
            File::open(path).map_err(|err| ArrowError::CsvError(format!("{path}: {err}")))?;

        // Infer schema automatically
        let format = Format::default().with_header(true);
        let (schema, _) = format.infer_schema(&mut file, Some(100))?;
        file.rewind()
            .map_err(|err| ArrowError::CsvError(err.to_string()))?;

        let reader = ReaderBuilder::new(Arc::new(schema))
            .with_header(true)
            .with_batch_size(1024)
            .build(file)?;

        let mut items = Vec::new();
        for rec_batch in reader {
            let rec_batch = rec_batch?;
            for row in 0..rec_batch.num_rows() {
                let mut input = Vec::with_capacity(IN_VAR_IDS.len());
                for name in IN_VAR_IDS {
                    input.push(column(&rec_batch, name)?.value(row) as f32);
                }
                let mut fields = Vec::with_capacity(layout.var_ids.len());
                for var_id in &layout.var_ids {
                    let mut values = Vec::with_capacity(layout.cells);
                    for cell in 0..layout.cells {
                        values
                            .push(column(&rec_batch, &format!("{var_id}_{cell}"))?.value(row) as f32);
                    }
                    fields.push(values);
                }
                items.push(ClimBenchItem { input, fields });
            }
        }
        Ok(Self { items })
    }
}

impl Dataset<ClimBenchItem> for ClimBenchDataset {
    fn get(&self, index: usize) -> Option<ClimBenchItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Map dataset items into batched tensors, one-hot encoding the targets.
#[derive(Clone)]
pub struct ClimBenchBatcher<B: Backend> {
    device: B::Device,
    layout: VariableLayout,
}

impl<B: Backend> ClimBenchBatcher<B> {
    pub fn new(device: B::Device, layout: VariableLayout) -> Self {
        Self { device, layout }
    }
}

#[derive(Clone, Debug)]
pub struct ClimBenchBatch<B: Backend> {
    /// [batch_size, forcing_features]
    pub inputs: Tensor<B, 2>,
    /// [batch_size, vars * bins * cells], one-hot over the bin axis
    pub targets: Tensor<B, 2>,
}

impl<B: Backend> Batcher<ClimBenchItem, ClimBenchBatch<B>> for ClimBenchBatcher<B> {
    fn batch(&self, items: Vec<ClimBenchItem>) -> ClimBenchBatch<B> {
        let inputs: Vec<_> = items
            .iter()
            .map(|item| {
                let features = item.input.len();
                Tensor::<B, 2>::from_data(
                    Data::new(item.input.clone(), Shape::new([1, features])).convert(),
                    &self.device,
                )
            })
            .collect();

        let targets: Vec<_> = items
            .iter()
            .map(|item| {
                let encoded = self.layout.encode_targets(&item.fields);
                Tensor::<B, 2>::from_data(
                    Data::new(encoded, Shape::new([1, self.layout.width()])).convert(),
                    &self.device,
                )
            })
            .collect();

        ClimBenchBatch {
            inputs: Tensor::cat(inputs, 0),
            targets: Tensor::cat(targets, 0),
        }
    }
}

#[derive(Config, Debug)]
pub struct ClimBenchDataConfig {
    pub layout: VariableLayout,
    pub train_file: String,
    /// Validation splits, one dataloader each, iterated in order.
    pub val_files: Vec<String>,
    /// Held-out test splits (e.g. one per scenario), iterated in order.
    pub test_files: Vec<String>,

    #[config(default = 4)]
    pub batch_size: usize,

    #[config(default = 4)]
    pub eval_batch_size: usize,
}

/// Dataloader factory over the configured CSV splits.
pub struct ClimBenchDataModule<B: Backend> {
    config: ClimBenchDataConfig,
    device: B::Device,
}

impl<B: Backend> ClimBenchDataModule<B> {
    pub fn new(config: ClimBenchDataConfig, device: B::Device) -> error::Result<Self> {
        config.layout.validate()?;
        Ok(Self { config, device })
    }

    fn loader_for(&self, path: &str) -> error::Result<Arc<dyn DataLoader<ClimBenchBatch<B>>>> {
        let dataset = ClimBenchDataset::from_csv(path, &self.config.layout)?;
        let batcher = ClimBenchBatcher::<B>::new(self.device.clone(), self.config.layout.clone());
        Ok(DataLoaderBuilder::new(batcher)
            .batch_size(self.config.eval_batch_size)
            .num_workers(1)
            .build(dataset))
    }

    pub fn val_dataloader(&self) -> error::Result<Vec<Arc<dyn DataLoader<ClimBenchBatch<B>>>>> {
        self.config
            .val_files
            .iter()
            .map(|f| self.loader_for(f))
            .collect()
    }

    pub fn test_dataloader(&self) -> error::Result<Vec<Arc<dyn DataLoader<ClimBenchBatch<B>>>>> {
        self.config
            .test_files
            .iter()
            .map(|f| self.loader_for(f))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn layout() -> VariableLayout {
        VariableLayout::new(
            vec!["tas".into(), "pr".into()],
            4,
            3,
            vec![(0.0, 4.0), (0.0, 8.0)],
        )
    }

    #[test]
    fn layout_validation_rejects_bad_shapes() {
        let mut bad = layout();
        bad.bins = 0;
        assert!(bad.validate().is_err());

        let mut bad = layout();
        bad.ranges.pop();
        assert!(bad.validate().is_err());

        let mut bad = layout();
        bad.ranges[0] = (2.0, 2.0);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn one_hot_encoding_marks_exactly_one_bin_per_cell() {
        let layout = layout();
        let fields = vec![vec![0.5, 1.5, 3.9], vec![0.0, 7.9, 4.1]];
        let encoded = layout.encode_targets(&fields);

        assert_eq!(encoded.len(), layout.width());
        // tas values 0.5, 1.5, 3.9 over [0, 4) with 4 bins land in bins 0, 1, 3
        assert_eq!(encoded[0], 1.0);
        assert_eq!(encoded[layout.cells + 1], 1.0);
        assert_eq!(encoded[3 * layout.cells + 2], 1.0);
        for var in 0..2 {
            for cell in 0..layout.cells {
                let total: f32 = (0..layout.bins)
                    .map(|bin| encoded[var * layout.block() + bin * layout.cells + cell])
                    .sum();
                assert_eq!(total, 1.0, "cell {cell} of var {var} must have one hot bin");
            }
        }
    }

    #[test]
    fn out_of_range_values_clamp_to_edge_bins() {
        let layout = layout();
        let fields = vec![vec![-10.0, 100.0, 0.0], vec![0.0, 0.0, 0.0]];
        let encoded = layout.encode_targets(&fields);
        assert_eq!(encoded[0], 1.0);
        assert_eq!(encoded[(layout.bins - 1) * layout.cells + 1], 1.0);
    }

    #[test]
    fn batcher_produces_expected_tensor_shapes() {
        let layout = layout();
        let batcher = ClimBenchBatcher::<TestBackend>::new(Default::default(), layout.clone());
        let items = vec![
            ClimBenchItem {
                input: vec![0.1, 0.2, 0.3, 0.4],
                fields: vec![vec![1.0; 3], vec![2.0; 3]],
            },
            ClimBenchItem {
                input: vec![0.5, 0.6, 0.7, 0.8],
                fields: vec![vec![3.0; 3], vec![4.0; 3]],
            },
        ];
        let batch = batcher.batch(items);
        assert_eq!(batch.inputs.dims(), [2, 4]);
        assert_eq!(batch.targets.dims(), [2, layout.width()]);
    }
}
