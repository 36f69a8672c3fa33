use crate::{
    config::{OptimizerKind, RunConfig, load_classes, parse_data_config},
    data::{BatchSource, DetectionBatch, create_train_data_loader, create_validation_data_loader},
    model::{
        BestTracker, CheckpointWriter, Detector, LearningRatePolicy, LossValues, compute_loss,
        load_model,
        optimizer::{adam_config, describe, sgd_config},
        valid::{EvalMetrics, EvalThresholds, evaluate},
    },
    sinks::MetricHub,
    utils::env::seed_backend,
};

use burn::{
    module::AutodiffModule,
    optim::{GradientsAccumulator, GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use color_eyre::{Result, eyre::WrapErr};
use log::{Level, info, log, log_enabled, warn};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Batches between two progress lines when not verbose.
const LOG_EVERY: usize = 50;

pub const TRAINING_SUBSET: &str = "training";
pub const VALIDATION_SUBSET: &str = "validation";

/// `true` when an epoch-periodic action falls on `epoch`; an interval of 0 disables it.
pub fn interval_due(epoch: usize, interval: usize) -> bool {
    interval != 0 && epoch % interval == 0
}

/// Every batch is logged at `Info` when verbose, otherwise one in [`LOG_EVERY`].
fn batch_log_level(verbose: bool, batch: usize) -> Level {
    if verbose || batch % LOG_EVERY == 0 {
        Level::Info
    } else {
        Level::Debug
    }
}

/// Counters carried across epochs.
#[derive(Debug, Clone, Default)]
pub struct TrainingState {
    pub epoch: usize,
    /// Batches processed over the whole run, counted from 0.
    pub batches_done: usize,
    pub optimizer_steps: usize,
    pub best: BestTracker,
    pub last_loss: Option<LossValues>,
    pub last_checkpoint: Option<PathBuf>,
    pub best_checkpoint: Option<PathBuf>,
}

impl TrainingState {
    /// Gradients are applied on the first batch and then every `subdivisions` batches.
    pub fn step_due(&self, subdivisions: usize) -> bool {
        self.batches_done % subdivisions.max(1) == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    pub epochs: usize,
    pub batches: usize,
    pub optimizer_steps: usize,
    pub seen: u64,
    pub best_map: Option<f64>,
    pub last_checkpoint: Option<PathBuf>,
    pub best_checkpoint: Option<PathBuf>,
}

/// Optimizer side of the loop: accumulates gradients and steps once per `subdivisions` batches.
pub struct BatchTrainer<B: AutodiffBackend, O> {
    optim: O,
    accumulator: GradientsAccumulator<Detector<B>>,
    policy: LearningRatePolicy,
    subdivisions: usize,
}

impl<B: AutodiffBackend, O: Optimizer<Detector<B>, B>> BatchTrainer<B, O> {
    pub fn new(optim: O, policy: LearningRatePolicy, subdivisions: usize) -> Self {
        Self {
            optim,
            accumulator: GradientsAccumulator::default(),
            policy,
            subdivisions: subdivisions.max(1),
        }
    }

    /// Forward and backward pass over one batch. The parameters only change on
    /// batches where a step is due; the batch counter advances either way.
    pub fn train_batch(
        &mut self,
        mut model: Detector<B>,
        batch: DetectionBatch<B>,
        state: &mut TrainingState,
        hub: &MetricHub,
    ) -> Result<(Detector<B>, LossValues)> {
        let images = batch.len();
        let img_size = batch.img_size();

        let heads = model.forward(batch.images);
        let loss = compute_loss(&heads, &batch.targets, img_size)?;
        let values = loss.values();
        let grads = GradientsParams::from_grads(loss.total.backward(), &model);
        self.accumulator.accumulate(&model, grads);

        let step = state.batches_done as u64;
        if state.step_due(self.subdivisions) {
            let lr = self.policy.rate(state.batches_done);
            hub.emit("train/learning_rate", lr, step);
            model = self.optim.step(lr, model, self.accumulator.grads());
            state.optimizer_steps += 1;
        }
        model.add_seen(images);

        hub.emit("train/iou_loss", values.box_loss.into(), step);
        hub.emit("train/obj_loss", values.obj_loss.into(), step);
        hub.emit("train/class_loss", values.class_loss.into(), step);
        hub.emit("train/loss", values.total.into(), step);

        state.last_loss = Some(values);
        state.batches_done += 1;
        Ok((model, values))
    }
}

struct EvalSource<B: Backend> {
    subset: &'static str,
    loader: BatchSource<B>,
}

struct Run<'a, B: AutodiffBackend> {
    config: &'a RunConfig,
    hub: &'a MetricHub,
    class_names: Vec<String>,
    train_loader: BatchSource<B>,
    eval_sources: Vec<EvalSource<B::InnerBackend>>,
    checkpoints: CheckpointWriter,
    policy: LearningRatePolicy,
    subdivisions: usize,
}

fn create_dir(path: &str) -> Result<()> {
    fs::create_dir_all(path).wrap_err_with(|| format!("Failed to create directory {path}"))
}

/// Trains the detector described by `config`, emitting every scalar through `hub`.
pub fn train<B: AutodiffBackend>(
    config: &RunConfig,
    hub: &MetricHub,
    device: B::Device,
) -> Result<TrainingSummary> {
    create_dir(&config.output_dir)?;
    let checkpoints = CheckpointWriter::new(&config.checkpoint_dir)
        .wrap_err("Failed to prepare checkpoint directory")?;

    let data_config = parse_data_config(&config.data)?;
    let train_list = data_config.train_list()?.to_string();
    let valid_list = data_config.valid_list()?.to_string();
    let class_names = load_classes(data_config.names_file()?)?;

    seed_backend::<B>(config.seed);

    let pretrained = config.pretrained_weights.as_deref().map(Path::new);
    let model: Detector<B> = load_model(&config.model, pretrained, &device)
        .wrap_err_with(|| format!("Failed to build model from {}", config.model))?;
    if config.verbose {
        info!("\n{}", model.summary());
    }
    if class_names.len() != model.num_classes() {
        warn!(
            "{} class names for a model with {} classes",
            class_names.len(),
            model.num_classes()
        );
    }

    let hyperparams = model.hyperparams().clone();
    let mini_batch = hyperparams.mini_batch_size();
    let img_size = hyperparams.height;

    let train_loader = create_train_data_loader::<B>(
        &train_list,
        mini_batch,
        img_size,
        config.multiscale_training,
        config.n_cpu,
        config.seed,
    )
    .wrap_err_with(|| format!("Failed to create training loader from {train_list}"))?;
    let mut eval_sources = Vec::with_capacity(2);
    for (subset, list) in [(TRAINING_SUBSET, &train_list), (VALIDATION_SUBSET, &valid_list)] {
        let loader = create_validation_data_loader::<B::InnerBackend>(
            list,
            mini_batch,
            img_size,
            config.n_cpu,
        )
        .wrap_err_with(|| format!("Failed to create {subset} loader from {list}"))?;
        eval_sources.push(EvalSource { subset, loader });
    }

    info!(
        "Training for {} epochs, mini-batch {mini_batch}, {} subdivisions, optimizer {}",
        config.epochs,
        hyperparams.subdivisions,
        describe(&hyperparams)
    );

    let run = Run {
        config,
        hub,
        class_names,
        train_loader,
        eval_sources,
        checkpoints,
        policy: LearningRatePolicy::from_hyperparams(&hyperparams),
        subdivisions: hyperparams.subdivisions.max(1),
    };
    match hyperparams.optimizer {
        OptimizerKind::Adam => run.fit(model, adam_config(&hyperparams).init::<B, Detector<B>>()),
        OptimizerKind::Sgd => run.fit(model, sgd_config(&hyperparams).init::<B, Detector<B>>()),
    }
}

impl<B: AutodiffBackend> Run<'_, B> {
    fn fit<O: Optimizer<Detector<B>, B>>(
        &self,
        mut model: Detector<B>,
        optim: O,
    ) -> Result<TrainingSummary> {
        let mut state = TrainingState::default();
        let mut trainer = BatchTrainer::new(optim, self.policy.clone(), self.subdivisions);

        for epoch in 0..self.config.epochs {
            state.epoch = epoch;
            info!("---- Training Model (epoch {epoch}) ----");
            state.last_loss = None;

            for batch in self.train_loader.iter() {
                let batch = batch.wrap_err("Failed to load training batch")?;
                let index = state.batches_done;
                let img_size = batch.img_size();
                let (next, values) = trainer.train_batch(model, batch, &mut state, self.hub)?;
                model = next;
                self.log_batch(epoch, index, &values, img_size);
            }

            match state.last_loss {
                Some(values) => self.hub.emit("train-loss", values.total.into(), epoch as u64 + 1),
                None => warn!("Epoch {epoch} had no training batches"),
            }

            if interval_due(epoch, self.config.checkpoint_interval) {
                let path = self.checkpoints.save_epoch(&model, epoch)?;
                state.last_checkpoint = Some(path);
            }

            if interval_due(epoch, self.config.evaluation_interval) {
                self.evaluate_epoch(&model, &mut state)?;
            }
        }

        Ok(TrainingSummary {
            epochs: self.config.epochs,
            batches: state.batches_done,
            optimizer_steps: state.optimizer_steps,
            seen: model.seen(),
            best_map: state.best.best(),
            last_checkpoint: state.last_checkpoint,
            best_checkpoint: state.best_checkpoint,
        })
    }

    fn log_batch(&self, epoch: usize, index: usize, values: &LossValues, img_size: usize) {
        let level = batch_log_level(self.config.verbose, index);
        if !log_enabled!(level) {
            return;
        }
        log!(
            level,
            "[Epoch {epoch} - Batch {index}] size {img_size} | iou {:.5} | obj {:.5} | class {:.5} | loss {:.5}",
            values.box_loss,
            values.obj_loss,
            values.class_loss,
            values.total
        );
    }

    fn evaluate_epoch(&self, model: &Detector<B>, state: &mut TrainingState) -> Result<()> {
        let step = state.epoch as u64 + 1;
        let thresholds = EvalThresholds {
            iou: self.config.iou_thres,
            conf: self.config.conf_thres,
            nms: self.config.nms_thres,
        };
        let model_valid = model.valid();

        for source in &self.eval_sources {
            info!("---- Evaluating Model on {} ----", source.subset);
            let metrics: EvalMetrics = evaluate(
                &model_valid,
                &source.loader,
                thresholds,
                &self.class_names,
                self.config.verbose,
            )
            .wrap_err_with(|| format!("Evaluation on {} failed", source.subset))?;

            for (suffix, value) in metrics.scalars() {
                self.hub.emit(&format!("{}.{suffix}", source.subset), value, step);
            }
            info!(
                "{}: precision {:.5} | recall {:.5} | mAP {:.5} | f1 {:.5}",
                source.subset, metrics.precision, metrics.recall, metrics.map, metrics.f1
            );

            if source.subset == VALIDATION_SUBSET && state.best.improve(metrics.map) {
                state.best_checkpoint = Some(self.checkpoints.save_best(model)?);
            }
        }
        Ok(())
    }
}
