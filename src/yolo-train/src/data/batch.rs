use crate::{
    common::{MULTISCALE_INTERVAL, MULTISCALE_SPAN, MULTISCALE_STEP},
    data::{
        BoxLabel, DatasetError,
        augmentation::{AugmentationConfig, ImageAugmenter},
        conversion::{images_to_tensor, resize_square},
        dataset::{DetectionItem, SampleRef},
    },
};

use burn::{data::dataloader::batcher::Batcher, prelude::*, tensor::Tensor};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rayon::{ThreadPool, ThreadPoolBuilder, prelude::*};
use std::{
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatcherMode {
    Train,
    Eval,
}

/// Square resolution shared by every clone of a training batcher.
#[derive(Debug)]
struct MultiscaleState {
    batch_count: usize,
    img_size: usize,
}

#[derive(Clone, Debug)]
pub struct DetectionBatcher {
    mode: BatcherMode,
    augmenter: Option<ImageAugmenter>,
    base_size: usize,
    multiscale: Option<Arc<Mutex<MultiscaleState>>>,
    seed: Option<u64>,
    calls: Arc<AtomicU64>,
    /// Decodes the images of a batch; `None` decodes on the calling thread.
    decoder: Option<Arc<ThreadPool>>,
}

impl DetectionBatcher {
    pub fn train(img_size: usize, multiscale: bool, seed: Option<u64>) -> Self {
        Self {
            mode: BatcherMode::Train,
            augmenter: Some(ImageAugmenter::new(AugmentationConfig::default())),
            base_size: img_size,
            multiscale: multiscale.then(|| {
                Arc::new(Mutex::new(MultiscaleState {
                    batch_count: 0,
                    img_size,
                }))
            }),
            seed,
            calls: Arc::new(AtomicU64::new(0)),
            decoder: None,
        }
    }

    pub fn eval(img_size: usize) -> Self {
        Self {
            mode: BatcherMode::Eval,
            augmenter: None,
            base_size: img_size,
            multiscale: None,
            seed: None,
            calls: Arc::new(AtomicU64::new(0)),
            decoder: None,
        }
    }

    /// Decodes each batch on `threads` workers. One thread keeps decoding inline.
    pub fn with_decode_threads(mut self, threads: usize) -> Result<Self, DatasetError> {
        if threads <= 1 {
            self.decoder = None;
            return Ok(self);
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("decode-{i}"))
            .build()
            .map_err(|e| DatasetError::DecodePool {
                threads,
                message: e.to_string(),
            })?;
        self.decoder = Some(Arc::new(pool));
        Ok(self)
    }

    pub fn mode(&self) -> BatcherMode {
        self.mode
    }

    /// Sizes multiscale training draws from, every [`MULTISCALE_INTERVAL`] batches.
    pub fn multiscale_sizes(base: usize) -> Vec<usize> {
        let span = MULTISCALE_SPAN * MULTISCALE_STEP;
        let min = base.saturating_sub(span).max(MULTISCALE_STEP);
        (min..=base + span).step_by(MULTISCALE_STEP).collect()
    }

    fn rng(&self) -> StdRng {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ call.wrapping_mul(0x9E37_79B9_7F4A_7C15)),
            None => StdRng::from_os_rng(),
        }
    }

    fn next_size(&self, rng: &mut StdRng) -> usize {
        let Some(state) = &self.multiscale else {
            return self.base_size;
        };
        // A poisoned lock only means another worker panicked mid-batch.
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        if state.batch_count % MULTISCALE_INTERVAL == 0 {
            let sizes = Self::multiscale_sizes(self.base_size);
            state.img_size = sizes[rng.random_range(0..sizes.len())];
        }
        state.batch_count += 1;
        state.img_size
    }
}

/// Collated images with their ground truth kept on the host for target assignment.
#[derive(Clone, Debug)]
pub struct DetectionBatch<B: Backend> {
    pub paths: Vec<PathBuf>,
    /// `[N, 3, S, S]`, values in `[0, 1]`.
    pub images: Tensor<B, 4>,
    /// Boxes per image, normalised to the square image.
    pub targets: Vec<Vec<BoxLabel>>,
}

impl<B: Backend> DetectionBatch<B> {
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn img_size(&self) -> usize {
        self.images.dims()[3]
    }
}

impl DetectionBatcher {
    /// Loads every sample, keeping the order of `samples`.
    pub fn decode(&self, samples: &[SampleRef]) -> Result<Vec<DetectionItem>, DatasetError> {
        match &self.decoder {
            Some(pool) => pool.install(|| samples.par_iter().map(SampleRef::load).collect()),
            None => samples.iter().map(SampleRef::load).collect(),
        }
    }

    /// Augments (in training) and resizes decoded items into one batch.
    pub fn collate<B: Backend>(
        &self,
        items: Vec<DetectionItem>,
        device: &B::Device,
    ) -> Result<DetectionBatch<B>, DatasetError> {
        if items.is_empty() {
            return Err(DatasetError::EmptyBatch);
        }

        let mut rng = self.rng();
        let size = self.next_size(&mut rng);

        let mut paths = Vec::with_capacity(items.len());
        let mut images = Vec::with_capacity(items.len());
        let mut targets = Vec::with_capacity(items.len());
        for item in items {
            let mut labels = item.labels;
            let image = match (self.mode, &self.augmenter) {
                (BatcherMode::Train, Some(aug)) => aug.augment(&item.image, &mut labels, &mut rng),
                _ => item.image,
            };
            images.push(resize_square(&image, size));
            targets.push(labels);
            paths.push(item.path);
        }

        Ok(DetectionBatch {
            paths,
            images: images_to_tensor(&images, device),
            targets,
        })
    }
}

impl<B: Backend> Batcher<B, SampleRef, Result<DetectionBatch<B>, DatasetError>>
    for DetectionBatcher
{
    fn batch(
        &self,
        items: Vec<SampleRef>,
        device: &B::Device,
    ) -> Result<DetectionBatch<B>, DatasetError> {
        let items = self.decode(&items)?;
        self.collate(items, device)
    }
}
