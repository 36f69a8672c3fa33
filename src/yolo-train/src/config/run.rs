use burn::config::Config;
use clap::Parser;

/// Resolved parameters of one training run.
#[derive(Config, Debug)]
pub struct RunConfig {
    /// Darknet model definition (`.cfg`).
    pub model: String,
    /// Data config (`.data`) naming the train/valid lists and class names.
    pub data: String,
    /// Directory for the scalar log, the saved config and the dashboard log file.
    pub logdir: String,
    pub checkpoint_dir: String,
    pub output_dir: String,

    /// `.weights`, `.pt`/`.pth` or native checkpoint to start from.
    pub pretrained_weights: Option<String>,
    /// Experiment tracking root; `None` disables the tracker.
    pub tracking_dir: Option<String>,

    #[config(default = 300)]
    pub epochs: usize,
    #[config(default = false)]
    pub verbose: bool,
    /// Data loader worker threads.
    #[config(default = 8)]
    pub n_cpu: usize,
    #[config(default = 1)]
    pub checkpoint_interval: usize,
    #[config(default = 1)]
    pub evaluation_interval: usize,
    #[config(default = false)]
    pub multiscale_training: bool,
    /// Evaluation: IoU required to count a detection as a true positive.
    #[config(default = 0.1)]
    pub iou_thres: f32,
    /// Evaluation: objectness confidence threshold.
    #[config(default = 0.1)]
    pub conf_thres: f32,
    /// Evaluation: IoU threshold of non-maximum suppression.
    #[config(default = 0.5)]
    pub nms_thres: f32,
    /// Global seed; `None` leaves runs non-deterministic.
    pub seed: Option<u64>,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "yolo-train", about = "Trains a YOLO detector from a Darknet definition")]
pub struct RunArgs {
    /// Path to model definition file (.cfg)
    #[arg(short, long, default_value = "config/yolov3.cfg")]
    pub model: String,
    /// Path to data config file (.data)
    #[arg(short, long, default_value = "config/coco.data")]
    pub data: String,
    /// Number of epochs
    #[arg(short, long, default_value_t = 300)]
    pub epochs: usize,
    /// Makes the training more verbose
    #[arg(short, long)]
    pub verbose: bool,
    /// Number of cpu threads to use during batch generation
    #[arg(long, default_value_t = 8)]
    pub n_cpu: usize,
    /// Checkpoint file (.weights, .pth or native) to start training from
    #[arg(long)]
    pub pretrained_weights: Option<String>,
    /// Interval of epochs between saving model weights
    #[arg(long, default_value_t = 1)]
    pub checkpoint_interval: usize,
    /// Interval of epochs between evaluations
    #[arg(long, default_value_t = 1)]
    pub evaluation_interval: usize,
    /// Scale images to different sizes randomly
    #[arg(long)]
    pub multiscale_training: bool,
    /// Evaluation: IOU threshold required to qualify as detected
    #[arg(long, default_value_t = 0.1)]
    pub iou_thres: f32,
    /// Evaluation: Object confidence threshold
    #[arg(long, default_value_t = 0.1)]
    pub conf_thres: f32,
    /// Evaluation: IOU threshold for non-maximum suppression
    #[arg(long, default_value_t = 0.5)]
    pub nms_thres: f32,
    /// Directory for training log files
    #[arg(long, default_value = "logs")]
    pub logdir: String,
    /// Directory for model checkpoints
    #[arg(long, default_value = "checkpoints")]
    pub checkpoint_dir: String,
    /// Directory for generated outputs
    #[arg(long, default_value = "output")]
    pub output_dir: String,
    /// Root of experiment tracking runs
    #[arg(long, default_value = "runs")]
    pub tracking_dir: String,
    /// Disable the experiment tracker
    #[arg(long)]
    pub no_tracking: bool,
    /// Makes results reproducible. Set -1 to disable.
    #[arg(long, default_value_t = 2, allow_negative_numbers = true)]
    pub seed: i64,
    /// Show the live training dashboard
    #[arg(long)]
    pub tui: bool,
}

impl RunArgs {
    pub fn into_config(self) -> RunConfig {
        let mut config = RunConfig::new(
            self.model,
            self.data,
            self.logdir,
            self.checkpoint_dir,
            self.output_dir,
        )
        .with_epochs(self.epochs)
        .with_verbose(self.verbose)
        .with_n_cpu(self.n_cpu)
        .with_checkpoint_interval(self.checkpoint_interval)
        .with_evaluation_interval(self.evaluation_interval)
        .with_multiscale_training(self.multiscale_training)
        .with_iou_thres(self.iou_thres)
        .with_conf_thres(self.conf_thres)
        .with_nms_thres(self.nms_thres)
        .with_pretrained_weights(self.pretrained_weights);
        if !self.no_tracking {
            config = config.with_tracking_dir(Some(self.tracking_dir));
        }
        config.with_seed(u64::try_from(self.seed).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let args = RunArgs::parse_from(["yolo-train"]);
        let config = args.into_config();
        assert_eq!(config.model, "config/yolov3.cfg");
        assert_eq!(config.data, "config/coco.data");
        assert_eq!(config.epochs, 300);
        assert_eq!(config.n_cpu, 8);
        assert_eq!(config.checkpoint_interval, 1);
        assert_eq!(config.evaluation_interval, 1);
        assert!(!config.multiscale_training);
        assert_eq!(config.seed, Some(2));
        assert_eq!(config.tracking_dir.as_deref(), Some("runs"));
        assert!(config.pretrained_weights.is_none());
    }

    #[test]
    fn negative_seed_disables_determinism() {
        let args = RunArgs::parse_from(["yolo-train", "--seed", "-1", "--no-tracking"]);
        let config = args.into_config();
        assert_eq!(config.seed, None);
        assert_eq!(config.tracking_dir, None);
    }
}
