//! Experiment-grid generation for single-emulator runs: scenario hold-outs
//! and a time-shifted split, written as JSON configs under an explicit output
//! directory. Nothing here runs unless called by the orchestration layer.
use std::fs;
use std::path::Path;

use burn::prelude::Config;
use tracing::info;

use crate::data::IN_VAR_IDS;
use crate::error::{self, EmulatorError};

/// Climate models whose simulations an emulator is trained against.
pub const TRAIN_MODELS: [&str; 5] = [
    "MPI-ESM1-2-HR",
    "AWI-CM-1-1-MR",
    "EC-Earth3",
    "FGOALS-f3-L",
    "BCC-CSM2-MR",
];

/// Emulator architectures covered by every experiment grid.
pub const ARCHITECTURES: [&str; 4] = ["unet", "convlstm", "climax", "climax_frozen"];

const OUT_VAR_IDS: [&str; 2] = ["tas", "pr"];

#[derive(Config, Debug)]
pub struct ExperimentConfig {
    pub name: String,
    pub architecture: String,
    pub train_model: String,
    pub train_historical_years: String,
    /// Scenario-driven split; empty when the split is time-driven.
    pub train_scenarios: Vec<String>,
    pub test_scenarios: Vec<String>,
    /// Time-driven test period; empty when the split is scenario-driven.
    pub test_years: String,
    pub in_var_ids: Vec<String>,
    pub out_var_ids: Vec<String>,

    #[config(default = 50)]
    pub max_epochs: usize,

    #[config(default = 22201)]
    pub seed: u64,

    #[config(default = 1)]
    pub run_id: usize,

    #[config(default = 4)]
    pub batch_size: usize,

    #[config(default = 4)]
    pub eval_batch_size: usize,
}

impl ExperimentConfig {
    /// Rejects malformed grids before anything is written to disk.
    pub fn validate(&self) -> error::Result<()> {
        let invalid = |reason: String| EmulatorError::InvalidConfig { reason };

        if self.name.is_empty() || self.architecture.is_empty() || self.train_model.is_empty() {
            return Err(invalid(format!(
                "name, architecture and train_model are all required (got {:?}/{:?}/{:?})",
                self.name, self.architecture, self.train_model
            )));
        }
        if self.in_var_ids.is_empty() || self.out_var_ids.is_empty() {
            return Err(invalid(format!("{}: empty variable lists", self.name)));
        }
        let scenario_split = !self.train_scenarios.is_empty() || !self.test_scenarios.is_empty();
        let time_split = !self.test_years.is_empty();
        match (scenario_split, time_split) {
            (true, true) => {
                return Err(invalid(format!(
                    "{}: both scenario and time-shift splits configured",
                    self.name
                )))
            }
            (false, false) => {
                return Err(invalid(format!("{}: no test split configured", self.name)))
            }
            (true, false) => {
                if self.train_scenarios.is_empty() || self.test_scenarios.is_empty() {
                    return Err(invalid(format!(
                        "{}: scenario split needs both train and test scenarios",
                        self.name
                    )));
                }
                if let Some(shared) = self
                    .test_scenarios
                    .iter()
                    .find(|s| self.train_scenarios.contains(s))
                {
                    return Err(invalid(format!(
                        "{}: scenario {shared} appears in both train and test",
                        self.name
                    )));
                }
            }
            (false, true) => {}
        }
        Ok(())
    }

    fn file_name(&self) -> String {
        match self.test_scenarios.first() {
            Some(scenario) => format!("{}_experiment_{scenario}.json", self.architecture),
            None => format!("{}_experiment_timeshift.json", self.architecture),
        }
    }
}

fn base_experiment(architecture: &str, train_model: &str) -> ExperimentConfig {
    ExperimentConfig::new(
        format!("{train_model}_{architecture}_run-1"),
        architecture.to_string(),
        train_model.to_string(),
        String::new(),
        Vec::new(),
        Vec::new(),
        String::new(),
        IN_VAR_IDS.iter().map(|v| v.to_string()).collect(),
        OUT_VAR_IDS.iter().map(|v| v.to_string()).collect(),
    )
}

/// One experiment per climate model, architecture, and held-out SSP
/// scenario: train on three scenarios, test on the fourth.
pub fn ssp_holdout_experiments() -> Vec<ExperimentConfig> {
    let combinations: [(&[&str; 3], &str); 3] = [
        (&["ssp245", "ssp370", "ssp585"], "ssp126"),
        (&["ssp245", "ssp126", "ssp585"], "ssp370"),
        (&["ssp245", "ssp126", "ssp370"], "ssp585"),
    ];

    let mut experiments = Vec::new();
    for train_model in TRAIN_MODELS {
        for (train_scenarios, test_scenario) in combinations {
            for architecture in ARCHITECTURES {
                let mut exp = base_experiment(architecture, train_model);
                exp.train_historical_years = "1850-2010".to_string();
                exp.train_scenarios = train_scenarios.iter().map(|s| s.to_string()).collect();
                exp.test_scenarios = vec![test_scenario.to_string()];
                experiments.push(exp);
            }
        }
    }
    experiments
}

/// One experiment per climate model and architecture: train on the extended
/// historical period, test on the years beyond it.
pub fn timeshift_experiments() -> Vec<ExperimentConfig> {
    let mut experiments = Vec::new();
    for train_model in TRAIN_MODELS {
        for architecture in ARCHITECTURES {
            let mut exp = base_experiment(architecture, train_model);
            exp.train_historical_years = "1850-2014".to_string();
            exp.test_years = "2015-2023".to_string();
            experiments.push(exp);
        }
    }
    experiments
}

/// Validate and write both experiment grids under
/// `<dir>/single_emulator/<architecture>/<train_model>/`.
pub fn write_experiment_configs(dir: impl AsRef<Path>) -> error::Result<()> {
    let mut experiments = ssp_holdout_experiments();
    experiments.extend(timeshift_experiments());

    for exp in &experiments {
        exp.validate()?;
        let out_dir = dir
            .as_ref()
            .join("single_emulator")
            .join(&exp.architecture)
            .join(&exp.train_model);
        fs::create_dir_all(&out_dir)?;
        let path = out_dir.join(exp.file_name());
        exp.save(&path)?;
        info!("created {}", path.display());
    }
    Ok(())
}
