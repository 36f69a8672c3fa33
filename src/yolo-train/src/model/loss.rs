//! YOLO training loss.
//!
//! Every ground truth box is assigned to the grid cell holding its centre, in
//! the head and anchor whose shape matches it best. Assigned cells regress
//! `sigmoid(tx, ty)` onto the centre offset and `tw, th` onto the log ratio
//! to the anchor, and learn their classes; every cell learns objectness.

use crate::{data::BoxLabel, model::ModelError, model::darknet::HeadOutput};

use burn::{
    prelude::*,
    tensor::activation::{log_sigmoid, sigmoid},
};

pub const BOX_GAIN: f32 = 0.05;
pub const OBJ_GAIN: f32 = 1.0;
pub const CLASS_GAIN: f32 = 0.5;

#[derive(Debug, Clone)]
pub struct LossComponents<B: Backend> {
    pub box_loss: Tensor<B, 1>,
    pub obj_loss: Tensor<B, 1>,
    pub class_loss: Tensor<B, 1>,
    pub total: Tensor<B, 1>,
}

/// Host-side scalars of [`LossComponents`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossValues {
    pub box_loss: f32,
    pub obj_loss: f32,
    pub class_loss: f32,
    pub total: f32,
}

impl<B: Backend> LossComponents<B> {
    pub fn values(&self) -> LossValues {
        let scalar = |t: &Tensor<B, 1>| t.clone().into_scalar().elem::<f32>();
        LossValues {
            box_loss: scalar(&self.box_loss),
            obj_loss: scalar(&self.obj_loss),
            class_loss: scalar(&self.class_loss),
            total: scalar(&self.total),
        }
    }
}

/// One ground truth box placed in a head.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub head: usize,
    /// Row in the head output flattened to `[N * A * H * W, 5 + C]`.
    pub row: usize,
    pub class: usize,
    /// Centre offset inside the cell.
    pub offset: [f32; 2],
    /// `ln(box / anchor)` for width and height.
    pub log_wh: [f32; 2],
}

fn shape_iou(a: (f32, f32), b: (f32, f32)) -> f32 {
    let inter = a.0.min(b.0) * a.1.min(b.1);
    inter / (a.0 * a.1 + b.0 * b.1 - inter + 1e-9)
}

/// `(anchors, classes, grid_h, grid_w)` of one head.
pub type HeadGrid = (Vec<(f32, f32)>, usize, usize, usize);

/// Places every target box of every image.
pub fn assign_targets(
    heads: &[HeadGrid],
    targets: &[Vec<BoxLabel>],
    img_size: f32,
) -> Result<Vec<Assignment>, ModelError> {
    let mut assignments = Vec::new();
    for (image, labels) in targets.iter().enumerate() {
        for label in labels {
            let wh = (label.w * img_size, label.h * img_size);
            if wh.0 <= 0.0 || wh.1 <= 0.0 {
                continue;
            }

            let mut best = None;
            let mut best_iou = -1.0f32;
            for (h, (anchors, ..)) in heads.iter().enumerate() {
                for (a, &anchor) in anchors.iter().enumerate() {
                    let iou = shape_iou(wh, anchor);
                    if iou > best_iou {
                        best_iou = iou;
                        best = Some((h, a));
                    }
                }
            }
            let Some((h, a)) = best else {
                continue;
            };

            let (anchors, classes, grid_h, grid_w) = &heads[h];
            if label.class >= *classes {
                return Err(ModelError::ClassOutOfRange {
                    class: label.class,
                    classes: *classes,
                });
            }
            let gx = label.cx * *grid_w as f32;
            let gy = label.cy * *grid_h as f32;
            let cx = (gx.max(0.0) as usize).min(grid_w - 1);
            let cy = (gy.max(0.0) as usize).min(grid_h - 1);
            let row = ((image * anchors.len() + a) * grid_h + cy) * grid_w + cx;
            let anchor = anchors[a];
            assignments.push(Assignment {
                head: h,
                row,
                class: label.class,
                offset: [
                    (gx - cx as f32).clamp(0.0, 1.0),
                    (gy - cy as f32).clamp(0.0, 1.0),
                ],
                log_wh: [(wh.0 / anchor.0).ln(), (wh.1 / anchor.1).ln()],
            });
        }
    }
    Ok(assignments)
}

/// Mean binary cross entropy on logits.
fn bce_with_logits<B: Backend, const D: usize>(
    logits: Tensor<B, D>,
    targets: Tensor<B, D>,
) -> Tensor<B, 1> {
    let positive = targets.clone() * log_sigmoid(logits.clone());
    let negative = (targets.neg() + 1.0) * log_sigmoid(logits.neg());
    (positive + negative).neg().mean()
}

pub fn compute_loss<B: Backend>(
    heads: &[HeadOutput<B>],
    targets: &[Vec<BoxLabel>],
    img_size: usize,
) -> Result<LossComponents<B>, ModelError> {
    let Some(first) = heads.first() else {
        return Err(ModelError::Architecture("model has no detection head".into()));
    };
    let device = first.raw.device();
    let dims: Vec<_> = heads
        .iter()
        .map(|h| {
            let [_, a, gh, gw, _] = h.raw.dims();
            debug_assert_eq!(a, h.spec.anchors.len());
            (h.spec.anchors.clone(), h.spec.classes, gh, gw)
        })
        .collect();
    let assignments = assign_targets(&dims, targets, img_size as f32)?;

    let zero = || Tensor::<B, 1>::zeros([1], &device);
    let mut box_loss = zero();
    let mut obj_loss = zero();
    let mut class_loss = zero();

    for (h, head) in heads.iter().enumerate() {
        let [n, a, gh, gw, outputs] = head.raw.dims();
        let rows = n * a * gh * gw;
        let flat = head.raw.clone().reshape([rows, outputs]);

        let mine: Vec<&Assignment> = assignments.iter().filter(|x| x.head == h).collect();
        let mut obj_target = vec![0f32; rows];
        for assignment in &mine {
            obj_target[assignment.row] = 1.0;
        }
        let obj_target = Tensor::<B, 1>::from_data(TensorData::new(obj_target, [rows]), &device);
        let obj_logits = flat.clone().narrow(1, 4, 1).reshape([rows]);
        obj_loss = obj_loss + bce_with_logits(obj_logits, obj_target);

        if mine.is_empty() {
            continue;
        }
        let k = mine.len();
        let index: Vec<i64> = mine.iter().map(|x| x.row as i64).collect();
        let index = Tensor::<B, 1, Int>::from_data(
            TensorData::new(index, [k]).convert::<B::IntElem>(),
            &device,
        );
        let picked = flat.select(0, index);

        let mut box_target = Vec::with_capacity(k * 4);
        for x in &mine {
            box_target.extend_from_slice(&x.offset);
            box_target.extend_from_slice(&x.log_wh);
        }
        let box_target = Tensor::<B, 2>::from_data(TensorData::new(box_target, [k, 4]), &device);
        let xy = sigmoid(picked.clone().narrow(1, 0, 2));
        let wh = picked.clone().narrow(1, 2, 2);
        let pred = Tensor::cat(vec![xy, wh], 1);
        box_loss = box_loss + (pred - box_target).powi_scalar(2).mean();

        let classes = head.spec.classes;
        if classes > 0 {
            let mut class_target = vec![0f32; k * classes];
            for (i, x) in mine.iter().enumerate() {
                class_target[i * classes + x.class] = 1.0;
            }
            let class_target =
                Tensor::<B, 2>::from_data(TensorData::new(class_target, [k, classes]), &device);
            let class_logits = picked.narrow(1, 5, classes);
            class_loss = class_loss + bce_with_logits(class_logits, class_target);
        }
    }

    let box_loss = box_loss * BOX_GAIN;
    let obj_loss = obj_loss * OBJ_GAIN;
    let class_loss = class_loss * CLASS_GAIN;
    let total = box_loss.clone() + obj_loss.clone() + class_loss.clone();
    Ok(LossComponents {
        box_loss,
        obj_loss,
        class_loss,
        total,
    })
}
