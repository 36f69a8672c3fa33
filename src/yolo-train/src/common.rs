/// Input channels of every detector built by this crate.
pub const CHANNELS: usize = 3;

/// Multiscale training picks a new input size every this many batches.
pub const MULTISCALE_INTERVAL: usize = 10;
/// Input sizes are multiples of the coarsest head stride.
pub const MULTISCALE_STEP: usize = 32;
/// Multiscale sizes range over `img_size ± MULTISCALE_SPAN * MULTISCALE_STEP`.
pub const MULTISCALE_SPAN: usize = 3;

/// Upper bound of detections kept per image after NMS.
pub const MAX_DETECTIONS: usize = 300;

pub const EPOCH_CHECKPOINT_PREFIX: &str = "yolov3_ckpt_";
pub const BEST_CHECKPOINT_NAME: &str = "best_ckpt";

pub const SCALARS_FILE: &str = "scalars.jsonl";
pub const CONFIG_FILE: &str = "config.json";
