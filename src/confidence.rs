//! Confidence-stratified evaluation: calibrate a per-variable confidence
//! threshold on the validation split, partition the test split into low- and
//! high-confidence subsets, and re-evaluate the emulator on each subset.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use burn::data::dataloader::DataLoader;
use burn::prelude::{Backend, Tensor};
use burn::tensor::activation::softmax;
use indicatif::ProgressBar;
use tracing::{info, warn};

use crate::data::ClimBenchBatch;
use crate::error::{EmulatorError, Result};
use crate::evaluation::{evaluate_preds, EvalStats};
use crate::model::Emulator;

/// Validation-set percentile below which a prediction counts as low
/// confidence. Deliberately strict: flags the least certain 2.5%.
pub const CONFIDENCE_PERCENTILE: f64 = 2.5;

/// Fixed batch size for re-evaluation passes over materialized subsets.
pub const SUBSET_BATCH_SIZE: usize = 32;

pub type Thresholds = BTreeMap<String, f32>;
pub type PerVariableStats = BTreeMap<String, EvalStats>;

/// Which side of the calibration threshold a partition keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdSide {
    Below,
    Above,
}

impl ThresholdSide {
    fn selects(self, confidence: f32, threshold: f32) -> bool {
        match self {
            ThresholdSide::Below => confidence < threshold,
            ThresholdSide::Above => confidence >= threshold,
        }
    }

    fn label(self) -> &'static str {
        match self {
            ThresholdSide::Below => "below",
            ThresholdSide::Above => "above",
        }
    }
}

/// Per-sample confidence: the maximum soft-maxed class probability, reduced
/// over the class axis. `[batch, classes, cells]` in, `[batch, cells]` out.
pub fn confidence_scores<B: Backend>(var_id: &str, outputs: Tensor<B, 3>) -> Result<Tensor<B, 2>> {
    let [_, classes, _] = outputs.dims();
    if classes == 0 {
        return Err(EmulatorError::EmptyClassAxis {
            var_id: var_id.to_string(),
        });
    }
    let probabilities = softmax(outputs, 1);
    Ok(probabilities.max_dim(1).squeeze::<2>(1))
}

/// Linear-interpolation percentile over an unsorted sample, `pct` in
/// [0, 100]. `values` must be non-empty.
fn percentile(values: &[f32], pct: f64) -> f32 {
    debug_assert!(!values.is_empty());
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (pct / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let t = (rank - lo as f64) as f32;
        sorted[lo] * (1.0 - t) + sorted[hi] * t
    }
}

/// Stream every validation batch through the model and pool the flattened
/// confidence scores per variable, then take the 2.5th percentile of each
/// pool as that variable's calibration threshold.
pub fn calibrate_thresholds<B: Backend, M: Emulator<B>>(
    model: &M,
    val_loaders: &[Arc<dyn DataLoader<ClimBenchBatch<B>>>],
) -> Result<Thresholds> {
    info!("calculating confidence thresholds");
    let mut pooled: BTreeMap<String, Vec<f32>> = BTreeMap::new();

    let progress = ProgressBar::new_spinner().with_message("calibrating confidence thresholds");
    for loader in val_loaders {
        for batch in loader.iter() {
            let outputs = model.predict(batch.inputs);
            for (var_id, raw) in outputs {
                let scores = confidence_scores(&var_id, raw)?;
                let values: Vec<f32> = scores.into_data().convert().value;
                pooled.entry(var_id).or_default().extend(values);
            }
            progress.inc(1);
        }
    }
    progress.finish_and_clear();

    let mut thresholds = Thresholds::new();
    for (var_id, confidences) in pooled {
        if confidences.is_empty() {
            continue;
        }
        let threshold = percentile(&confidences, CONFIDENCE_PERCENTILE);
        info!("{CONFIDENCE_PERCENTILE}th percentile confidence threshold for {var_id}: {threshold:.4}");
        thresholds.insert(var_id, threshold);
    }
    Ok(thresholds)
}

/// Samples captured for one output variable, in dataloader iteration order.
#[derive(Debug, Clone)]
pub struct VariablePoints<B: Backend> {
    pub inputs: Vec<Tensor<B, 1>>,
    pub targets: Vec<Tensor<B, 2>>,
}

impl<B: Backend> Default for VariablePoints<B> {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            targets: Vec::new(),
        }
    }
}

pub type ConfidencePointSet<B> = BTreeMap<String, VariablePoints<B>>;

/// Stream every test batch and capture, per thresholded variable, the samples
/// whose confidence falls on the requested side of the threshold.
///
/// A sample is selected when ANY element of its confidence row qualifies, so
/// a spatially structured prediction counts as low confidence as soon as one
/// cell does. The target slice is only captured when the output splitter
/// recognizes the batch targets; the input is captured either way, and the
/// resulting count skew is rejected later, at materialization.
pub fn collect_confidence_points<B: Backend, M: Emulator<B>>(
    model: &M,
    test_loaders: &[Arc<dyn DataLoader<ClimBenchBatch<B>>>],
    thresholds: &Thresholds,
    side: ThresholdSide,
) -> Result<ConfidencePointSet<B>> {
    info!("collecting {} threshold points", side.label());
    let mut points: ConfidencePointSet<B> = thresholds
        .keys()
        .map(|var_id| (var_id.clone(), VariablePoints::default()))
        .collect();
    let mut uncalibrated: BTreeSet<String> = BTreeSet::new();

    let progress = ProgressBar::new_spinner().with_message("partitioning by confidence");
    for loader in test_loaders {
        for batch in loader.iter() {
            let [n, features] = batch.inputs.dims();
            let outputs = model.predict(batch.inputs.clone());
            let split_targets = model.splitter().split_by_variable(&batch.targets);

            for (var_id, raw) in outputs {
                let Some(&threshold) = thresholds.get(&var_id) else {
                    uncalibrated.insert(var_id);
                    continue;
                };
                let scores = confidence_scores(&var_id, raw)?;
                let [_, cells] = scores.dims();
                let values: Vec<f32> = scores.into_data().convert().value;

                let bucket = points
                    .get_mut(&var_id)
                    .expect("one bucket per thresholded variable");
                for i in 0..n {
                    let row = &values[i * cells..(i + 1) * cells];
                    if row.iter().any(|&c| side.selects(c, threshold)) {
                        bucket.inputs.push(
                            batch
                                .inputs
                                .clone()
                                .slice([i..i + 1, 0..features])
                                .squeeze::<1>(0),
                        );
                        if let Some(targets) = split_targets.as_ref().and_then(|t| t.get(&var_id)) {
                            bucket
                                .targets
                                .push(targets.clone().slice([i..i + 1]).squeeze::<2>(0));
                        }
                    }
                }
            }
            progress.inc(1);
        }
    }
    progress.finish_and_clear();

    for (var_id, data) in &points {
        info!(
            "number of points {} the {CONFIDENCE_PERCENTILE}th percentile threshold for {var_id}: {}",
            side.label(),
            data.inputs.len()
        );
    }
    if !uncalibrated.is_empty() {
        warn!("model outputs without a calibrated threshold were skipped: {uncalibrated:?}");
    }
    Ok(points)
}

/// All captured samples of all variables, flattened in variable order and
/// stacked into one batched dataset for re-evaluation.
#[derive(Debug)]
pub struct ConfidenceSubset<B: Backend> {
    stacked: Option<(Tensor<B, 2>, Tensor<B, 3>)>,
    batch_size: usize,
}

impl<B: Backend> ConfidenceSubset<B> {
    pub fn len(&self) -> usize {
        self.stacked
            .as_ref()
            .map(|(inputs, _)| inputs.dims()[0])
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fixed-size batches in stacking order; no shuffling, so re-evaluation
    /// is reproducible.
    pub fn iter(&self) -> impl Iterator<Item = (Tensor<B, 2>, Tensor<B, 3>)> + '_ {
        let len = self.len();
        let batch = self.batch_size;
        (0..len).step_by(batch).map(move |start| {
            let end = usize::min(start + batch, len);
            let (inputs, targets) = self
                .stacked
                .as_ref()
                .expect("non-empty subset has stacked tensors");
            (
                inputs.clone().slice([start..end]),
                targets.clone().slice([start..end]),
            )
        })
    }
}

/// Flatten a point set into one stacked dataset. Empty point sets produce an
/// empty placeholder so the remaining pipeline can run as a no-op; a variable
/// whose input and target counts diverged is a hard error.
pub fn materialize_subset<B: Backend>(points: ConfidencePointSet<B>) -> Result<ConfidenceSubset<B>> {
    let mut inputs = Vec::new();
    let mut targets = Vec::new();
    for (var_id, data) in points {
        if data.inputs.len() != data.targets.len() {
            return Err(EmulatorError::PointCountMismatch {
                var_id,
                inputs: data.inputs.len(),
                targets: data.targets.len(),
            });
        }
        inputs.extend(data.inputs);
        targets.extend(data.targets);
    }

    let stacked = if inputs.is_empty() {
        None
    } else {
        Some((
            Tensor::cat(inputs.into_iter().map(|t| t.unsqueeze::<2>()).collect(), 0),
            Tensor::cat(targets.into_iter().map(|t| t.unsqueeze::<3>()).collect(), 0),
        ))
    };
    Ok(ConfidenceSubset {
        stacked,
        batch_size: SUBSET_BATCH_SIZE,
    })
}

fn ensure_matching_dims(var_id: &str, targets: &[usize], preds: &[usize]) -> Result<()> {
    if targets != preds {
        return Err(EmulatorError::ShapeMismatch {
            var_id: var_id.to_string(),
            targets: targets.to_vec(),
            preds: preds.to_vec(),
        });
    }
    Ok(())
}

/// Run the model over a materialized subset and compute accuracy statistics
/// per output variable. Variables that accumulated nothing (empty subset)
/// are skipped, so an empty partition degrades to an empty stats map.
pub fn evaluate_on_subset<B: Backend, M: Emulator<B>>(
    model: &M,
    subset: &ConfidenceSubset<B>,
) -> Result<PerVariableStats> {
    let mut accumulated: BTreeMap<String, (Vec<Tensor<B, 3>>, Vec<Tensor<B, 3>>)> = model
        .out_var_ids()
        .iter()
        .map(|var_id| (var_id.clone(), (Vec::new(), Vec::new())))
        .collect();

    for (inputs, targets) in subset.iter() {
        let outputs = model.predict(inputs);
        for (var_id, preds) in outputs {
            if let Some((target_acc, pred_acc)) = accumulated.get_mut(&var_id) {
                target_acc.push(targets.clone());
                pred_acc.push(preds);
            }
        }
    }

    let mut stats_per_var = PerVariableStats::new();
    for (var_id, (target_chunks, pred_chunks)) in accumulated {
        if pred_chunks.is_empty() {
            info!("no confidence points accumulated for {var_id}, skipping evaluation");
            continue;
        }
        let targets = Tensor::cat(target_chunks, 0);
        let preds = Tensor::cat(pred_chunks, 0);
        ensure_matching_dims(&var_id, &targets.dims(), &preds.dims())?;

        let target_values: Vec<f32> = targets.into_data().convert().value;
        let pred_values: Vec<f32> = preds.into_data().convert().value;
        let stats = evaluate_preds(&target_values, &pred_values);
        info!("evaluation metrics for {var_id}: {stats}");
        stats_per_var.insert(var_id, stats);
    }
    Ok(stats_per_var)
}

/// The full post-training pass: calibrate once, partition the test split in
/// both directions, and re-evaluate each partition separately.
pub fn run_confidence_evaluation<B: Backend, M: Emulator<B>>(
    model: &M,
    val_loaders: &[Arc<dyn DataLoader<ClimBenchBatch<B>>>],
    test_loaders: &[Arc<dyn DataLoader<ClimBenchBatch<B>>>],
) -> Result<(PerVariableStats, PerVariableStats)> {
    let thresholds = calibrate_thresholds(model, val_loaders)?;

    let low_points =
        collect_confidence_points(model, test_loaders, &thresholds, ThresholdSide::Below)?;
    let high_points =
        collect_confidence_points(model, test_loaders, &thresholds, ThresholdSide::Above)?;

    let low_subset = materialize_subset(low_points)?;
    let high_subset = materialize_subset(high_points)?;

    info!("evaluating low-confidence points");
    let low_stats = evaluate_on_subset(model, &low_subset)?;
    info!("evaluating high-confidence points");
    let high_stats = evaluate_on_subset(model, &high_subset)?;

    info!("low-confidence stats: {low_stats:?}");
    info!("high-confidence stats: {high_stats:?}");
    Ok((low_stats, high_stats))
}
