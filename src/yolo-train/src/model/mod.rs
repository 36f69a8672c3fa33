pub mod blocks;
pub mod checkpoint;
pub mod darknet;
pub mod loss;
pub mod optimizer;
pub mod schedule;
pub mod training;
pub mod valid;
pub mod weights;

use crate::config::ConfigError;
use std::path::PathBuf;
use thiserror::Error;

pub use checkpoint::{BestTracker, CheckpointWriter};
pub use darknet::{Detector, HeadOutput, HeadSpec};
pub use loss::{LossComponents, LossValues, compute_loss};
pub use schedule::LearningRatePolicy;
pub use training::{BatchTrainer, TrainingState, TrainingSummary, train};
pub use valid::{EvalMetrics, EvalThresholds, evaluate};
pub use weights::load_model;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to load weights from {path}: {message}")]
    Weights { path: PathBuf, message: String },
    #[error("checkpoint {path}: {message}")]
    Checkpoint { path: PathBuf, message: String },
    #[error("target class {class} is out of range for a model with {classes} classes")]
    ClassOutOfRange { class: usize, classes: usize },
    #[error("invalid architecture: {0}")]
    Architecture(String),
}
