pub mod darknet;
pub mod data;
pub mod run;

use std::path::PathBuf;
use thiserror::Error;

pub use darknet::{Hyperparams, LayerDef, ModelDefinition, OptimizerKind, parse_model_config};
pub use data::{DataConfig, load_classes, parse_data_config};
pub use run::{RunArgs, RunConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: {message}")]
    Syntax {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("section [{section}] #{index}: missing key `{key}`")]
    MissingKey {
        section: String,
        index: usize,
        key: String,
    },
    #[error("section [{section}] #{index}: invalid value `{value}` for `{key}`")]
    InvalidValue {
        section: String,
        index: usize,
        key: String,
        value: String,
    },
    #[error("unsupported layer type [{0}]")]
    UnsupportedLayer(String),
    #[error("unknown optimizer `{0}`; choose between adam and sgd")]
    UnknownOptimizer(String),
    #[error("data config {path} has no `{key}` entry")]
    MissingDataKey { path: PathBuf, key: String },
    #[error("invalid architecture: {0}")]
    Architecture(String),
}
