pub mod augmentation;
pub mod batch;
pub mod conversion;
pub mod dataset;
pub mod loader;

use std::path::PathBuf;
use thiserror::Error;

pub use batch::{DetectionBatch, DetectionBatcher};
pub use dataset::{DetectionItem, ListDataset, SampleRef, SampleResult};
pub use loader::{BatchSource, create_train_data_loader, create_validation_data_loader};

/// One ground truth box, normalised to the (square padded) image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxLabel {
    pub class: usize,
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
}

impl BoxLabel {
    pub fn to_xyxy(&self) -> [f32; 4] {
        [
            self.cx - self.w / 2.0,
            self.cy - self.h / 2.0,
            self.cx + self.w / 2.0,
            self.cy + self.h / 2.0,
        ]
    }
}

/// Errors are cloned into every batch that hits them, so they carry strings.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DatasetError {
    #[error("failed to read image list {path}: {message}")]
    ListFile { path: PathBuf, message: String },
    #[error("image path {0} has no `images` directory to derive its label path from")]
    LabelPath(PathBuf),
    #[error("failed to read image {path}: {message}")]
    Image { path: PathBuf, message: String },
    #[error("{path}:{line}: {message}")]
    Label {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("cannot collate an empty batch")]
    EmptyBatch,
    #[error("failed to start {threads} image decoding threads: {message}")]
    DecodePool { threads: usize, message: String },
}
