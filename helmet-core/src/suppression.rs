//! Greedy non-maximum suppression over detector proposals.

use crate::detection::BBox;

/// Boxes scoring at or below this never survive suppression.
pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.5;
/// Boxes overlapping a kept box by more than this IoU are dropped.
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.4;

/// Greedy NMS: drop low scores, sort by confidence descending, suppress
/// boxes whose IoU with an already kept box exceeds `nms_threshold`.
///
/// Class-agnostic. Returns indices into `boxes`, highest score first. Equal
/// scores keep their input order.
pub fn non_max_suppression(
    boxes: &[BBox],
    scores: &[f32],
    score_threshold: f32,
    nms_threshold: f32,
) -> Vec<usize> {
    debug_assert_eq!(boxes.len(), scores.len());

    let mut order: Vec<usize> = (0..boxes.len().min(scores.len()))
        .filter(|&i| scores[i] > score_threshold)
        .collect();
    // Stable sort so equal scores resolve by position.
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut kept: Vec<usize> = Vec::with_capacity(order.len());
    for idx in order {
        if kept
            .iter()
            .all(|&k| boxes[k].iou(&boxes[idx]) <= nms_threshold)
        {
            kept.push(idx);
        }
    }
    kept
}
