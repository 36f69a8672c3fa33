use crate::backend::backend_name;

use burn::tensor::backend::Backend;
use log::info;
use std::fmt;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// What the run executes on, logged once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvInfo {
    pub version: &'static str,
    pub backend: &'static str,
    pub device: String,
}

impl EnvInfo {
    pub fn collect<B: Backend>(device: &B::Device) -> Self {
        Self {
            version: VERSION,
            backend: backend_name(),
            device: format!("{device:?}"),
        }
    }
}

impl fmt::Display for EnvInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "yolo-train v{} | backend {} | device {}",
            self.version, self.backend, self.device
        )
    }
}

/// Seeds the backend RNG; data shuffling and augmentation take the seed separately.
pub fn seed_backend<B: Backend>(seed: Option<u64>) {
    match seed {
        Some(seed) => {
            B::seed(seed);
            info!("Using seed {seed}");
        }
        None => info!("No seed set, run is not reproducible"),
    }
}
