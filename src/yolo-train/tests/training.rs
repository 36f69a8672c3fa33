use burn::backend::{Autodiff, NdArray};
use image::{Rgb, RgbImage};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tempfile::TempDir;
use yolo_train::{
    config::RunConfig,
    model::{load_model, train},
    sinks::{MetricEvent, MetricHub, RunOutcome, ScalarSink, SinkError},
};

type TestBackend = Autodiff<NdArray>;

#[derive(Clone, Default)]
struct RecordingSink {
    events: Arc<Mutex<Vec<MetricEvent>>>,
}

impl RecordingSink {
    fn steps(&self, name: &str) -> Vec<u64> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.name == name)
            .map(|e| e.step)
            .collect()
    }

    fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

impl ScalarSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    fn record(&mut self, event: &MetricEvent) -> Result<(), SinkError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

fn model_cfg(subdivisions: usize, optimizer: &str) -> String {
    format!(
        "
[net]
batch=2
subdivisions={subdivisions}
width=32
height=32
optimizer={optimizer}
learning_rate=0.001
burn_in=1

[convolutional]
batch_normalize=1
filters=8
size=3
stride=2
pad=1
activation=leaky

[convolutional]
filters=7
size=1
stride=1
pad=1
activation=linear

[yolo]
mask=0
anchors=8,8
classes=2
"
    )
}

fn write_image(path: &Path, shade: u8) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut img = RgbImage::from_pixel(40, 30, Rgb([shade, shade, shade]));
    for x in 10..20 {
        for y in 5..15 {
            img.put_pixel(x, y, Rgb([255, 0, 0]));
        }
    }
    img.save(path).unwrap();
}

fn write_label(image: &Path, line: &str) {
    let label = PathBuf::from(image.to_string_lossy().replace("images", "labels"))
        .with_extension("txt");
    fs::create_dir_all(label.parent().unwrap()).unwrap();
    fs::write(label, line).unwrap();
}

/// Two training images (one without labels) and one validation image.
struct Fixture {
    dir: TempDir,
    config: RunConfig,
}

impl Fixture {
    fn new(subdivisions: usize, optimizer: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        let train_a = root.join("data/images/train/a.png");
        let train_b = root.join("data/images/train/b.png");
        let valid_c = root.join("data/images/valid/c.png");
        write_image(&train_a, 20);
        write_image(&train_b, 120);
        write_image(&valid_c, 60);
        write_label(&train_a, "0 0.375 0.333 0.25 0.333\n");
        write_label(&valid_c, "1 0.375 0.333 0.25 0.333\n");

        let train_list = root.join("train.txt");
        let valid_list = root.join("valid.txt");
        fs::write(
            &train_list,
            format!("{}\n\n{}\n", train_a.display(), train_b.display()),
        )
        .unwrap();
        fs::write(&valid_list, format!("{}\n", valid_c.display())).unwrap();
        let names = root.join("classes.names");
        fs::write(&names, "square\nother\n").unwrap();
        let data = root.join("tiny.data");
        fs::write(
            &data,
            format!(
                "# tiny\nclasses=2\ntrain={}\nvalid={}\nnames={}\n",
                train_list.display(),
                valid_list.display(),
                names.display()
            ),
        )
        .unwrap();
        let model = root.join("tiny.cfg");
        fs::write(&model, model_cfg(subdivisions, optimizer)).unwrap();

        let path = |p: &str| root.join(p).to_string_lossy().into_owned();
        let config = RunConfig::new(
            model.to_string_lossy().into_owned(),
            data.to_string_lossy().into_owned(),
            path("logs"),
            path("checkpoints"),
            path("output"),
        )
        .with_epochs(1)
        .with_n_cpu(1)
        .with_seed(Some(7));
        Self { dir, config }
    }

    fn checkpoint(&self, name: &str) -> PathBuf {
        self.dir.path().join("checkpoints").join(name)
    }
}

fn run(config: &RunConfig) -> (color_eyre::Result<yolo_train::model::TrainingSummary>, RecordingSink) {
    let sink = RecordingSink::default();
    let mut hub = MetricHub::new();
    hub.register(sink.clone());
    let result = train::<TestBackend>(config, &hub, Default::default());
    hub.shutdown(RunOutcome::Finished);
    (result, sink)
}

#[test]
fn one_epoch_writes_checkpoints_and_evaluates_both_subsets() {
    let fixture = Fixture::new(2, "adam");
    let (result, sink) = run(&fixture.config);
    let summary = result.unwrap();

    // Mini-batch of one image: two batches, the first one steps.
    assert_eq!(summary.batches, 2);
    assert_eq!(summary.optimizer_steps, 1);
    assert_eq!(summary.seen, 2);
    assert_eq!(sink.steps("train/learning_rate"), [0]);
    for name in ["train/iou_loss", "train/obj_loss", "train/class_loss", "train/loss"] {
        assert_eq!(sink.steps(name), [0, 1], "{name}");
    }
    assert_eq!(sink.steps("train-loss"), [1]);

    for subset in ["training", "validation"] {
        for metric in ["precision", "recall", "mAP", "f1"] {
            assert_eq!(sink.steps(&format!("{subset}.{metric}")), [1]);
        }
    }

    assert!(fixture.checkpoint("yolov3_ckpt_0.mpk").is_file());
    assert!(!fixture.checkpoint("yolov3_ckpt_1.mpk").exists());
    assert!(fixture.checkpoint("best_ckpt.mpk").is_file());
    assert_eq!(
        summary.best_checkpoint,
        Some(fixture.checkpoint("best_ckpt.mpk"))
    );
    assert!(fixture.dir.path().join("output").is_dir());
}

#[test]
fn intervals_gate_checkpoints_and_evaluation() {
    let mut fixture = Fixture::new(1, "sgd");
    fixture.config = fixture
        .config
        .clone()
        .with_epochs(2)
        .with_checkpoint_interval(2)
        .with_evaluation_interval(2);
    let (result, sink) = run(&fixture.config);
    let summary = result.unwrap();

    // One step per two-image batch, two batches over two epochs.
    assert_eq!(summary.batches, 2);
    assert_eq!(summary.optimizer_steps, 2);
    assert_eq!(summary.seen, 4);
    assert_eq!(sink.steps("train/learning_rate"), [0, 1]);
    assert_eq!(sink.steps("train-loss"), [1, 2]);
    assert_eq!(sink.steps("validation.mAP"), [1]);
    assert!(fixture.checkpoint("yolov3_ckpt_0.mpk").is_file());
    assert!(!fixture.checkpoint("yolov3_ckpt_1.mpk").exists());
}

#[test]
fn unknown_optimizer_fails_before_any_batch() {
    let fixture = Fixture::new(1, "rmsprop");
    let (result, sink) = run(&fixture.config);
    let error = format!("{:?}", result.unwrap_err());
    assert!(error.contains("rmsprop"), "{error}");
    assert_eq!(sink.len(), 0);
}

#[test]
fn best_checkpoint_restores_into_the_same_architecture() {
    let fixture = Fixture::new(2, "adam");
    let (result, _) = run(&fixture.config);
    let best = result.unwrap().best_checkpoint.unwrap();

    let restored =
        load_model::<NdArray>(&fixture.config.model, Some(&best), &Default::default()).unwrap();
    assert_eq!(restored.num_classes(), 2);
}
