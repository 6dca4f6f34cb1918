// https://burn.dev/book/basic-workflow/model.html
use std::collections::BTreeMap;

use burn::nn::{LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::prelude::{Backend, Config, Module, Tensor};
use burn::tensor::activation::{relu, softmax};

use crate::data::VariableLayout;

/// Recovers per-variable `[batch, bins, cells]` slices from a concatenated
/// `[batch, vars * bins * cells]` vector. Works on targets and on raw model
/// outputs alike, since both share the same layout.
#[derive(Debug, Clone)]
pub struct VariableSplitter {
    layout: VariableLayout,
}

impl VariableSplitter {
    pub fn new(layout: VariableLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &VariableLayout {
        &self.layout
    }

    /// `None` when the vector width does not match the layout, e.g. targets
    /// that were batched under a different variable set.
    pub fn split_by_variable<B: Backend>(
        &self,
        vector: &Tensor<B, 2>,
    ) -> Option<BTreeMap<String, Tensor<B, 3>>> {
        let [n, width] = vector.dims();
        if width != self.layout.width() {
            return None;
        }
        let block = self.layout.block();
        let mut split = BTreeMap::new();
        for (var, var_id) in self.layout.var_ids.iter().enumerate() {
            let slice = vector
                .clone()
                .slice([0..n, var * block..(var + 1) * block])
                .reshape([n, self.layout.bins, self.layout.cells]);
            split.insert(var_id.clone(), slice);
        }
        Some(split)
    }
}

#[derive(Module, Debug)]
pub struct EmulatorModel<B: Backend> {
    linear1: Linear<B>,
    linear2: Linear<B>,
    linear3: Linear<B>,
    norm1: LayerNorm<B>,
    norm2: LayerNorm<B>,
    num_vars: usize,
    bins: usize,
    cells: usize,
}

#[derive(Config, Debug)]
pub struct EmulatorModelConfig {
    pub hidden_size: usize,
    pub layout: VariableLayout,

    #[config(default = 4)]
    pub num_features: usize,
}

impl EmulatorModelConfig {
    // Returns the initialized model
    pub fn init<B: Backend>(&self, device: &B::Device) -> EmulatorModel<B> {
        EmulatorModel {
            linear1: LinearConfig::new(self.num_features, self.hidden_size).init(device),
            linear2: LinearConfig::new(self.hidden_size, self.hidden_size / 2).init(device),
            linear3: LinearConfig::new(self.hidden_size / 2, self.layout.width()).init(device),
            norm1: LayerNormConfig::new(self.hidden_size).init(device),
            norm2: LayerNormConfig::new(self.hidden_size / 2).init(device),
            num_vars: self.layout.var_ids.len(),
            bins: self.layout.bins,
            cells: self.layout.cells,
        }
    }
}

impl<B: Backend> EmulatorModel<B> {
    /// # Shapes
    ///   - Inputs [batch_size, forcing_features]
    ///   - Output [batch_size, vars * bins * cells] raw logits
    pub fn forward(&self, inputs: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.linear1.forward(inputs);
        let x = self.norm1.forward(x);
        let x = relu(x);

        let x = self.linear2.forward(x);
        let x = self.norm2.forward(x);
        let x = relu(x);

        self.linear3.forward(x)
    }

    /// Forward pass with the bin axis soft-maxed per variable and cell, for
    /// the Brier-style training loss against one-hot targets.
    pub fn forward_probs(&self, inputs: Tensor<B, 2>) -> Tensor<B, 2> {
        let logits = self.forward(inputs);
        let [n, width] = logits.dims();
        let probs = softmax(
            logits.reshape([n, self.num_vars, self.bins, self.cells]),
            2,
        );
        probs.reshape([n, width])
    }
}

/// The model capability the confidence pipeline consumes: per-variable raw
/// outputs, the output variable ids, and the target splitter.
pub trait Emulator<B: Backend> {
    fn predict(&self, inputs: Tensor<B, 2>) -> BTreeMap<String, Tensor<B, 3>>;
    fn out_var_ids(&self) -> &[String];
    fn splitter(&self) -> &VariableSplitter;
}

/// A trained model bound to its output layout.
pub struct ClimateEmulator<B: Backend> {
    model: EmulatorModel<B>,
    splitter: VariableSplitter,
}

impl<B: Backend> ClimateEmulator<B> {
    pub fn new(model: EmulatorModel<B>, layout: VariableLayout) -> Self {
        Self {
            model,
            splitter: VariableSplitter::new(layout),
        }
    }
}

impl<B: Backend> Emulator<B> for ClimateEmulator<B> {
    fn predict(&self, inputs: Tensor<B, 2>) -> BTreeMap<String, Tensor<B, 3>> {
        let outputs = self.model.forward(inputs);
        self.splitter
            .split_by_variable(&outputs)
            .expect("model output width matches its own layout")
    }

    fn out_var_ids(&self) -> &[String] {
        &self.splitter.layout().var_ids
    }

    fn splitter(&self) -> &VariableSplitter {
        &self.splitter
    }
}
