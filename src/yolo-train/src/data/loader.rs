use crate::data::{DatasetError, DetectionBatch, DetectionBatcher, ListDataset};

use burn::{
    data::{
        dataloader::{DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    prelude::*,
};
use log::{debug, warn};
use std::{path::Path, sync::Arc};

pub type BatchSource<B> = Arc<dyn DataLoader<B, Result<DetectionBatch<B>, DatasetError>>>;

fn load_list(list_path: &Path) -> Result<ListDataset, DatasetError> {
    let dataset = ListDataset::from_list_file(list_path)?;
    if dataset.is_empty() {
        warn!("Image list {} is empty", list_path.display());
    }
    debug!("Loaded {} entries from {}", dataset.len(), list_path.display());
    Ok(dataset)
}

/// Shuffled, augmented batches of `batch_size` (the mini-batch, not the full batch).
///
/// Batches are cut from one shuffled pass over the whole list; `n_cpu` threads
/// decode the images of each batch.
pub fn create_train_data_loader<B: Backend>(
    list_path: impl AsRef<Path>,
    batch_size: usize,
    img_size: usize,
    multiscale: bool,
    n_cpu: usize,
    seed: Option<u64>,
) -> Result<BatchSource<B>, DatasetError> {
    let dataset = load_list(list_path.as_ref())?;
    let batcher =
        DetectionBatcher::train(img_size, multiscale, seed).with_decode_threads(n_cpu)?;
    let shuffle_seed = seed.unwrap_or_else(rand::random);
    Ok(DataLoaderBuilder::new(batcher)
        .batch_size(batch_size)
        .shuffle(shuffle_seed)
        .build(dataset))
}

/// Unshuffled, unaugmented batches at the model's input size.
pub fn create_validation_data_loader<B: Backend>(
    list_path: impl AsRef<Path>,
    batch_size: usize,
    img_size: usize,
    n_cpu: usize,
) -> Result<BatchSource<B>, DatasetError> {
    let dataset = load_list(list_path.as_ref())?;
    let batcher = DetectionBatcher::eval(img_size).with_decode_threads(n_cpu)?;
    Ok(DataLoaderBuilder::new(batcher)
        .batch_size(batch_size)
        .build(dataset))
}
