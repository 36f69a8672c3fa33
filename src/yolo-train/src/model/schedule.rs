use crate::config::Hyperparams;

/// Darknet `steps` policy with a linear burn-in.
#[derive(Debug, Clone, PartialEq)]
pub struct LearningRatePolicy {
    pub base_lr: f64,
    pub burn_in: usize,
    /// `(threshold, multiplier)` pairs; a multiplier applies once `batches_done` exceeds its threshold.
    pub steps: Vec<(usize, f64)>,
}

impl LearningRatePolicy {
    pub fn from_hyperparams(hyperparams: &Hyperparams) -> Self {
        Self {
            base_lr: hyperparams.learning_rate,
            burn_in: hyperparams.burn_in,
            steps: hyperparams.lr_steps.clone(),
        }
    }

    pub fn rate(&self, batches_done: usize) -> f64 {
        if batches_done < self.burn_in {
            return self.base_lr * (batches_done as f64 / self.burn_in as f64);
        }
        self.steps
            .iter()
            .filter(|(threshold, _)| batches_done > *threshold)
            .fold(self.base_lr, |lr, (_, multiplier)| lr * multiplier)
    }
}
