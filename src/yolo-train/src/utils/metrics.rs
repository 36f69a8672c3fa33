//! Detection metrics: box overlap, greedy NMS and VOC-style average precision.

use std::{cmp::Ordering, collections::BTreeMap};

/// One predicted box after decoding, in input pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub bbox: [f32; 4],
    pub score: f32,
    pub class: usize,
}

pub fn iou_xyxy(a: [f32; 4], b: [f32; 4]) -> f32 {
    let inter_w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let inter_h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter_area = inter_w * inter_h;

    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let denom = area_a + area_b - inter_area;
    if denom <= 0.0 {
        0.0
    } else {
        inter_area / denom
    }
}

fn by_score_desc(a: &Detection, b: &Detection) -> Ordering {
    b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal)
}

/// Greedy NMS per class; keeps at most `max_detections`, highest scores first.
pub fn nms(
    mut detections: Vec<Detection>,
    iou_thresh: f32,
    max_detections: usize,
) -> Vec<Detection> {
    detections.sort_by(by_score_desc);
    let mut keep: Vec<Detection> = Vec::new();
    for det in detections {
        if keep.len() >= max_detections {
            break;
        }
        let suppressed = keep
            .iter()
            .any(|k| k.class == det.class && iou_xyxy(k.bbox, det.bbox) > iou_thresh);
        if !suppressed {
            keep.push(det);
        }
    }
    keep
}

/// Per-detection outcome used by [`ap_per_class`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scored {
    pub score: f32,
    pub class: usize,
    pub true_positive: bool,
}

/// Marks detections of one image as true positives.
///
/// Detections are visited by descending score; each may claim the unclaimed
/// ground truth box of its class it overlaps most, if that overlap reaches
/// `iou_thresh`.
pub fn match_detections(
    detections: &[Detection],
    targets: &[(usize, [f32; 4])],
    iou_thresh: f32,
) -> Vec<Scored> {
    let mut order: Vec<&Detection> = detections.iter().collect();
    order.sort_by(|a, b| by_score_desc(a, b));

    let mut claimed = vec![false; targets.len()];
    order
        .into_iter()
        .map(|det| {
            let best = targets
                .iter()
                .enumerate()
                .filter(|(i, (class, _))| *class == det.class && !claimed[*i])
                .map(|(i, (_, bbox))| (i, iou_xyxy(det.bbox, *bbox)))
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
            let true_positive = match best {
                Some((i, iou)) if iou >= iou_thresh => {
                    claimed[i] = true;
                    true
                }
                _ => false,
            };
            Scored {
                score: det.score,
                class: det.class,
                true_positive,
            }
        })
        .collect()
}

/// All-point interpolated area under the precision/recall curve.
pub fn compute_ap(recall: &[f64], precision: &[f64]) -> f64 {
    let mut mrec = Vec::with_capacity(recall.len() + 2);
    mrec.push(0.0);
    mrec.extend_from_slice(recall);
    mrec.push(1.0);
    let mut mpre = Vec::with_capacity(precision.len() + 2);
    mpre.push(0.0);
    mpre.extend_from_slice(precision);
    mpre.push(0.0);

    for i in (1..mpre.len()).rev() {
        mpre[i - 1] = mpre[i - 1].max(mpre[i]);
    }
    (1..mrec.len())
        .filter(|&i| mrec[i] != mrec[i - 1])
        .map(|i| (mrec[i] - mrec[i - 1]) * mpre[i])
        .sum()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassMetrics {
    pub class: usize,
    pub precision: f64,
    pub recall: f64,
    pub ap: f64,
    pub f1: f64,
}

/// Precision, recall, AP and F1 for every class present in the ground truth.
pub fn ap_per_class(scored: &[Scored], target_classes: &[usize]) -> Vec<ClassMetrics> {
    let mut gt_counts: BTreeMap<usize, usize> = BTreeMap::new();
    for &class in target_classes {
        *gt_counts.entry(class).or_default() += 1;
    }

    let mut sorted: Vec<&Scored> = scored.iter().collect();
    sorted.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    gt_counts
        .into_iter()
        .map(|(class, n_gt)| {
            let hits: Vec<bool> = sorted
                .iter()
                .filter(|s| s.class == class)
                .map(|s| s.true_positive)
                .collect();
            if hits.is_empty() {
                return ClassMetrics {
                    class,
                    ..ClassMetrics::default()
                };
            }

            let mut tp = 0.0;
            let mut fp = 0.0;
            let mut recall = Vec::with_capacity(hits.len());
            let mut precision = Vec::with_capacity(hits.len());
            for hit in hits {
                if hit {
                    tp += 1.0;
                } else {
                    fp += 1.0;
                }
                recall.push(tp / (n_gt as f64 + 1e-16));
                precision.push(tp / (tp + fp));
            }

            let p = precision.last().copied().unwrap_or(0.0);
            let r = recall.last().copied().unwrap_or(0.0);
            ClassMetrics {
                class,
                precision: p,
                recall: r,
                ap: compute_ap(&recall, &precision),
                f1: 2.0 * p * r / (p + r + 1e-16),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(bbox: [f32; 4], score: f32, class: usize) -> Detection {
        Detection { bbox, score, class }
    }

    #[test]
    fn iou_of_overlapping_and_disjoint_boxes() {
        assert_eq!(iou_xyxy([0.0, 0.0, 2.0, 2.0], [0.0, 0.0, 2.0, 2.0]), 1.0);
        assert!((iou_xyxy([0.0, 0.0, 2.0, 2.0], [1.0, 0.0, 3.0, 2.0]) - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(iou_xyxy([0.0, 0.0, 1.0, 1.0], [2.0, 2.0, 3.0, 3.0]), 0.0);
    }

    #[test]
    fn nms_suppresses_within_a_class_only() {
        let kept = nms(
            vec![
                det([0.0, 0.0, 10.0, 10.0], 0.6, 0),
                det([1.0, 1.0, 10.0, 10.0], 0.9, 0),
                det([1.0, 1.0, 10.0, 10.0], 0.5, 1),
                det([50.0, 50.0, 60.0, 60.0], 0.4, 0),
            ],
            0.5,
            300,
        );
        let scores: Vec<f32> = kept.iter().map(|d| d.score).collect();
        assert_eq!(scores, vec![0.9, 0.5, 0.4]);

        let capped = nms(kept, 0.5, 2);
        assert_eq!(capped.len(), 2);
    }

    #[test]
    fn each_target_is_claimed_once() {
        let targets = [(0, [0.0, 0.0, 10.0, 10.0])];
        let scored = match_detections(
            &[
                det([0.0, 0.0, 10.0, 9.0], 0.7, 0),
                det([0.0, 0.0, 10.0, 10.0], 0.8, 0),
                det([0.0, 0.0, 10.0, 10.0], 0.9, 1),
            ],
            &targets,
            0.5,
        );
        let hits: Vec<(f32, bool)> = scored.iter().map(|s| (s.score, s.true_positive)).collect();
        assert_eq!(hits, vec![(0.9, false), (0.8, true), (0.7, false)]);
    }

    #[test]
    fn perfect_detections_have_unit_ap() {
        let scored = [
            Scored { score: 0.9, class: 0, true_positive: true },
            Scored { score: 0.8, class: 0, true_positive: true },
        ];
        let metrics = ap_per_class(&scored, &[0, 0]);
        assert_eq!(metrics.len(), 1);
        assert!((metrics[0].ap - 1.0).abs() < 1e-9);
        assert!((metrics[0].precision - 1.0).abs() < 1e-9);
        assert!((metrics[0].f1 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn missed_class_scores_zero_and_false_positives_lower_ap() {
        let scored = [
            Scored { score: 0.9, class: 0, true_positive: false },
            Scored { score: 0.8, class: 0, true_positive: true },
        ];
        let metrics = ap_per_class(&scored, &[0, 2]);
        assert_eq!(metrics.len(), 2);
        assert!((metrics[0].ap - 0.5).abs() < 1e-9);
        assert!((metrics[0].precision - 0.5).abs() < 1e-9);
        assert_eq!(metrics[1], ClassMetrics { class: 2, ..Default::default() });
    }
}
