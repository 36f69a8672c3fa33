use crate::config::{Hyperparams, OptimizerKind};

use burn::optim::{AdamConfig, SgdConfig, decay::WeightDecayConfig, momentum::MomentumConfig};

/// Adam with the definition's `decay` as weight decay.
pub fn adam_config(hyperparams: &Hyperparams) -> AdamConfig {
    AdamConfig::new().with_weight_decay(Some(WeightDecayConfig::new(hyperparams.decay as f32)))
}

/// SGD with the definition's `momentum` (no dampening) and `decay`.
pub fn sgd_config(hyperparams: &Hyperparams) -> SgdConfig {
    SgdConfig::new()
        .with_weight_decay(Some(WeightDecayConfig::new(hyperparams.decay as f32)))
        .with_momentum(Some(
            MomentumConfig::new()
                .with_momentum(hyperparams.momentum)
                .with_dampening(0.0),
        ))
}

pub fn describe(hyperparams: &Hyperparams) -> String {
    match hyperparams.optimizer {
        OptimizerKind::Adam => format!("adam (weight decay {})", hyperparams.decay),
        OptimizerKind::Sgd => format!(
            "sgd (momentum {}, weight decay {})",
            hyperparams.momentum, hyperparams.decay
        ),
    }
}
