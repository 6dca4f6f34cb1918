use arrow::error::ArrowError;
use thiserror::Error;

/// Failure taxonomy for the emulator pipeline. Everything here is fatal:
/// the confidence statistics are single-pass and offline, so partial results
/// have no defined meaning and nothing is retried.
#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error("class axis has size zero for variable {var_id}, cannot compute softmax confidence")]
    EmptyClassAxis { var_id: String },

    #[error("targets and preds dims do not match for variable {var_id}: {targets:?} vs {preds:?}")]
    ShapeMismatch {
        var_id: String,
        targets: Vec<usize>,
        preds: Vec<usize>,
    },

    #[error(
        "variable {var_id} collected {inputs} inputs but {targets} targets; \
         the output splitter dropped target slices for some samples"
    )]
    PointCountMismatch {
        var_id: String,
        inputs: usize,
        targets: usize,
    },

    #[error("invalid variable layout: {reason}")]
    InvalidLayout { reason: String },

    #[error("invalid experiment config: {reason}")]
    InvalidConfig { reason: String },

    #[error("data ingestion failed: {0}")]
    Data(#[from] ArrowError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EmulatorError>;
