use crate::{
    common::{BEST_CHECKPOINT_NAME, EPOCH_CHECKPOINT_PREFIX},
    model::{Detector, ModelError},
};

use burn::{
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
};
use log::info;
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Writes epoch and best checkpoints into one directory, overwriting in place.
#[derive(Debug, Clone)]
pub struct CheckpointWriter {
    dir: PathBuf,
    recorder: NamedMpkFileRecorder<FullPrecisionSettings>,
}

impl CheckpointWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ModelError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| ModelError::Checkpoint {
            path: dir.clone(),
            message: e.to_string(),
        })?;
        Ok(Self {
            dir,
            recorder: NamedMpkFileRecorder::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Named MessagePack recorders write `.mpk` files.
    fn file(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{stem}.mpk"))
    }

    pub fn epoch_path(&self, epoch: usize) -> PathBuf {
        self.file(&format!("{EPOCH_CHECKPOINT_PREFIX}{epoch}"))
    }

    pub fn best_path(&self) -> PathBuf {
        self.file(BEST_CHECKPOINT_NAME)
    }

    fn save<B: Backend>(&self, model: &Detector<B>, path: PathBuf) -> Result<PathBuf, ModelError> {
        model
            .clone()
            .save_file(path.clone(), &self.recorder)
            .map_err(|e| ModelError::Checkpoint {
                path: path.clone(),
                message: e.to_string(),
            })?;
        Ok(path)
    }

    pub fn save_epoch<B: Backend>(
        &self,
        model: &Detector<B>,
        epoch: usize,
    ) -> Result<PathBuf, ModelError> {
        let path = self.epoch_path(epoch);
        info!("---- Saving checkpoint to: '{}' ----", path.display());
        self.save(model, path)
    }

    pub fn save_best<B: Backend>(&self, model: &Detector<B>) -> Result<PathBuf, ModelError> {
        let path = self.best_path();
        info!("---- Saving best checkpoint to: '{}' ----", path.display());
        self.save(model, path)
    }
}

/// Best validation mAP seen in the run; the first observation always improves.
#[derive(Debug, Clone, Default)]
pub struct BestTracker {
    best: Option<f64>,
}

impl BestTracker {
    pub fn best(&self) -> Option<f64> {
        self.best
    }

    /// Records `value` and reports whether it strictly beats the previous best.
    pub fn improve(&mut self, value: f64) -> bool {
        match self.best {
            Some(best) if value <= best => false,
            _ => {
                self.best = Some(value);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_only_accepts_strict_improvements() {
        let mut tracker = BestTracker::default();
        assert!(tracker.improve(0.0));
        assert!(!tracker.improve(0.0));
        assert!(tracker.improve(0.4));
        assert!(!tracker.improve(0.3));
        assert!(!tracker.improve(0.4));
        assert_eq!(tracker.best(), Some(0.4));
    }

    #[test]
    fn checkpoint_names() {
        let dir = tempfile::tempdir().unwrap();
        let writer = CheckpointWriter::new(dir.path().join("checkpoints")).unwrap();
        assert!(writer.dir().is_dir());
        assert_eq!(
            writer.epoch_path(3).file_name().unwrap(),
            "yolov3_ckpt_3.mpk"
        );
        assert_eq!(writer.best_path().file_name().unwrap(), "best_ckpt.mpk");
    }
}
