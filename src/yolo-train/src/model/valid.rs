use crate::{
    common::MAX_DETECTIONS,
    data::{BatchSource, BoxLabel},
    model::{Detector, HeadOutput},
    utils::metrics::{ClassMetrics, Detection, Scored, ap_per_class, match_detections, nms},
};

use burn::prelude::*;
use color_eyre::{Result, eyre::WrapErr};
use log::{info, warn};

/// Thresholds applied while evaluating one data source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalThresholds {
    /// IoU required for a detection to match a ground truth box.
    pub iou: f32,
    /// Minimum `objectness * class` score.
    pub conf: f32,
    pub nms: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalMetrics {
    pub precision: f64,
    pub recall: f64,
    pub map: f64,
    pub f1: f64,
    pub per_class: Vec<ClassMetrics>,
}

impl EvalMetrics {
    fn from_classes(per_class: Vec<ClassMetrics>) -> Self {
        if per_class.is_empty() {
            return Self::default();
        }
        let n = per_class.len() as f64;
        let mean = |f: fn(&ClassMetrics) -> f64| per_class.iter().map(f).sum::<f64>() / n;
        Self {
            precision: mean(|c| c.precision),
            recall: mean(|c| c.recall),
            map: mean(|c| c.ap),
            f1: mean(|c| c.f1),
            per_class,
        }
    }

    /// `(suffix, value)` pairs emitted as `<subset>.<suffix>`.
    pub fn scalars(&self) -> [(&'static str, f64); 4] {
        [
            ("precision", self.precision),
            ("recall", self.recall),
            ("mAP", self.map),
            ("f1", self.f1),
        ]
    }

    pub fn ap_table(&self, class_names: &[String]) -> String {
        let mut lines = vec![format!("{:>7} | {:<20} | {:>6}", "Index", "Class", "AP")];
        for c in &self.per_class {
            let name = class_names.get(c.class).map(String::as_str).unwrap_or("?");
            lines.push(format!("{:>7} | {:<20} | {:>6.5}", c.class, name, c.ap));
        }
        lines.push(format!("---- mAP {:.5} ----", self.map));
        lines.join("\n")
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Decodes every cell of one head into candidate boxes, per image.
///
/// Scores are `sigmoid(obj) * sigmoid(class)` of the best class; cells below
/// `conf` on either the objectness or the final score are dropped.
pub fn decode_head<B: Backend>(head: &HeadOutput<B>, conf: f32) -> Result<Vec<Vec<Detection>>> {
    let [n, a, gh, gw, outputs] = head.raw.dims();
    let values = head
        .raw
        .clone()
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| color_eyre::eyre::eyre!("reading head output: {e:?}"))?;

    let mut per_image = vec![Vec::new(); n];
    for (row, cell) in values.chunks_exact(outputs).enumerate() {
        let obj = sigmoid(cell[4]);
        if obj <= conf {
            continue;
        }
        let Some((class, cls)) = cell[5..]
            .iter()
            .copied()
            .map(sigmoid)
            .enumerate()
            .max_by(|x, y| x.1.total_cmp(&y.1))
        else {
            continue;
        };
        let score = obj * cls;
        if score <= conf {
            continue;
        }

        let x = row % gw;
        let y = (row / gw) % gh;
        let anchor = (row / (gw * gh)) % a;
        let image = row / (gw * gh * a);
        let (aw, ah) = head.spec.anchors[anchor];
        let cx = (sigmoid(cell[0]) + x as f32) * head.stride;
        let cy = (sigmoid(cell[1]) + y as f32) * head.stride;
        let w = cell[2].exp() * aw;
        let h = cell[3].exp() * ah;
        per_image[image].push(Detection {
            bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
            score,
            class,
        });
    }
    Ok(per_image)
}

fn targets_in_pixels(labels: &[BoxLabel], img_size: usize) -> Vec<(usize, [f32; 4])> {
    let scale = img_size as f32;
    labels
        .iter()
        .map(|l| {
            let [x1, y1, x2, y2] = l.to_xyxy();
            (l.class, [x1 * scale, y1 * scale, x2 * scale, y2 * scale])
        })
        .collect()
}

/// Runs the model over every batch of `loader` and scores its detections.
pub fn evaluate<B: Backend>(
    model: &Detector<B>,
    loader: &BatchSource<B>,
    thresholds: EvalThresholds,
    class_names: &[String],
    verbose: bool,
) -> Result<EvalMetrics> {
    let mut scored: Vec<Scored> = Vec::new();
    let mut target_classes: Vec<usize> = Vec::new();

    for batch in loader.iter() {
        let batch = batch.wrap_err("Failed to load evaluation batch")?;
        let img_size = batch.img_size();
        let heads = model.forward(batch.images);

        let mut candidates: Vec<Vec<Detection>> = vec![Vec::new(); batch.targets.len()];
        for head in &heads {
            for (image, found) in decode_head(head, thresholds.conf)?.into_iter().enumerate() {
                candidates[image].extend(found);
            }
        }

        for (detections, labels) in candidates.into_iter().zip(&batch.targets) {
            let targets = targets_in_pixels(labels, img_size);
            target_classes.extend(targets.iter().map(|(class, _)| *class));
            let kept = nms(detections, thresholds.nms, MAX_DETECTIONS);
            scored.extend(match_detections(&kept, &targets, thresholds.iou));
        }
    }

    if scored.is_empty() {
        warn!("---- No detections over whole validation set ----");
        return Ok(EvalMetrics::default());
    }

    let metrics = EvalMetrics::from_classes(ap_per_class(&scored, &target_classes));
    if verbose {
        info!("\n{}", metrics.ap_table(class_names));
    }
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HeadSpec;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn head(cells: Vec<f32>, grid: usize, classes: usize) -> HeadOutput<TestBackend> {
        let outputs = 5 + classes;
        HeadOutput {
            raw: Tensor::from_data(
                TensorData::new(cells, [1, 1, grid, grid, outputs]),
                &Default::default(),
            ),
            spec: HeadSpec {
                anchors: vec![(8.0, 8.0)],
                classes,
            },
            stride: 8.0,
        }
    }

    #[test]
    fn decodes_confident_cell_into_pixel_box() {
        let strong = 10.0;
        let weak = -10.0;
        // 2x2 grid, 2 classes; only cell (x=1, y=0) is confident, for class 1.
        let mut cells = vec![weak; 4 * 7];
        cells[7..14].copy_from_slice(&[0.0, 0.0, 0.0, 0.0, strong, weak, strong]);
        let found = decode_head(&head(cells, 2, 2), 0.5).unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].len(), 1);
        let det = found[0][0];
        assert_eq!(det.class, 1);
        assert!(det.score > 0.99);
        let expected = [8.0, 0.0, 16.0, 8.0];
        for (got, want) in det.bbox.iter().zip(expected) {
            assert!((got - want).abs() < 1e-4, "{:?}", det.bbox);
        }
    }

    #[test]
    fn means_cover_classes_present_in_ground_truth() {
        let metrics = EvalMetrics::from_classes(vec![
            ClassMetrics {
                class: 0,
                precision: 1.0,
                recall: 0.5,
                ap: 0.5,
                f1: 2.0 / 3.0,
            },
            ClassMetrics {
                class: 3,
                ..Default::default()
            },
        ]);
        assert!((metrics.map - 0.25).abs() < 1e-12);
        assert!((metrics.precision - 0.5).abs() < 1e-12);
        let names: Vec<&str> = metrics.scalars().iter().map(|(n, _)| *n).collect();
        assert_eq!(names, ["precision", "recall", "mAP", "f1"]);
    }
}
