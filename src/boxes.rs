use burn::tensor::{activation::sigmoid, backend::Backend, ElementConversion, Tensor};
use serde::{Deserialize, Serialize};

use crate::{
    anchors::ScaleAnchors,
    error::{YoloError, YoloResult},
    model::{ANCHORS_PER_SCALE, BOX_ATTRIBUTES},
};

const IOU_EPSILON: f32 = 1e-6;

/// How the four coordinates of a box are laid out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoxFormat {
    /// `(x_center, y_center, width, height)`
    #[default]
    Midpoint,
    /// `(x1, y1, x2, y2)`
    Corners,
}

impl BoxFormat {
    /// Converts a box in this format to `(x1, y1, x2, y2)`.
    pub fn to_corners(&self, bbox: &[f32; 4]) -> [f32; 4] {
        match self {
            BoxFormat::Midpoint => {
                let [x, y, w, h] = *bbox;
                [x - w / 2.0, y - h / 2.0, x + w / 2.0, y + h / 2.0]
            }
            BoxFormat::Corners => *bbox,
        }
    }
}

/// Intersection over union of two boxes.
pub fn intersection_over_union(a: &[f32; 4], b: &[f32; 4], format: BoxFormat) -> f32 {
    let [ax1, ay1, ax2, ay2] = format.to_corners(a);
    let [bx1, by1, bx2, by2] = format.to_corners(b);

    let width = (ax2.min(bx2) - ax1.max(bx1)).max(0.0);
    let height = (ay2.min(by2) - ay1.max(by1)).max(0.0);
    let intersection = width * height;

    let area_a = ((ax2 - ax1) * (ay2 - ay1)).abs();
    let area_b = ((bx2 - bx1) * (by2 - by1)).abs();

    intersection / (area_a + area_b - intersection + IOU_EPSILON)
}

/// Intersection over union of two midpoint boxes over the last axis.
///
/// # Shapes
///
/// - boxes: `[..., 4]`
/// - output: `[..., 1]`
pub fn intersection_over_union_tensor<B: Backend, const D: usize>(
    boxes_a: Tensor<B, D>,
    boxes_b: Tensor<B, D>,
) -> Tensor<B, D> {
    let axis = D - 1;
    let corners = |boxes: Tensor<B, D>| {
        let center = boxes.clone().narrow(axis, 0, 2);
        let half = boxes.narrow(axis, 2, 2).div_scalar(2.0);
        (center.clone() - half.clone(), center + half)
    };

    let (min_a, max_a) = corners(boxes_a);
    let (min_b, max_b) = corners(boxes_b);

    let extent = (max_a.clone().min_pair(max_b.clone()) - min_a.clone().max_pair(min_b.clone()))
        .clamp_min(0.0);
    let intersection = extent.clone().narrow(axis, 0, 1) * extent.narrow(axis, 1, 1);

    let area = |min: Tensor<B, D>, max: Tensor<B, D>| {
        let size = max - min;
        (size.clone().narrow(axis, 0, 1) * size.narrow(axis, 1, 1)).abs()
    };
    let union = area(min_a, max_a) + area(min_b, max_b) - intersection.clone();

    intersection / union.add_scalar(IOU_EPSILON)
}

/// IoU of two `(width, height)` boxes sharing the same center.
pub fn iou_width_height(a: &[f32; 2], b: &[f32; 2]) -> f32 {
    let intersection = a[0].min(b[0]) * a[1].min(b[1]);
    let union = a[0] * a[1] + b[0] * b[1] - intersection;

    intersection / union
}

/// A scored box in image-relative midpoint coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Index of the image the box belongs to within an evaluation run.
    pub image_idx: usize,
    pub class: usize,
    pub score: f32,
    pub bbox: [f32; 4],
}

/// Greedy per-class non-maximum suppression.
///
/// Boxes scoring at or below `score_threshold` are dropped. The remaining boxes are visited
/// from the highest score down; each kept box removes the same-class boxes overlapping it
/// with an IoU of at least `iou_threshold`.
pub fn non_max_suppression(
    detections: Vec<Detection>,
    iou_threshold: f32,
    score_threshold: f32,
    format: BoxFormat,
) -> Vec<Detection> {
    let mut candidates: Vec<Detection> = detections
        .into_iter()
        .filter(|detection| detection.score > score_threshold)
        .collect();
    // Ascending, so the best candidate is popped first.
    candidates.sort_by(|a, b| a.score.total_cmp(&b.score));

    let mut kept = Vec::new();

    while let Some(chosen) = candidates.pop() {
        candidates.retain(|candidate| {
            candidate.class != chosen.class
                || intersection_over_union(&candidate.bbox, &chosen.bbox, format) < iou_threshold
        });
        kept.push(chosen);
    }

    kept
}

/// What a `[batch, 3, S, S, attributes]` tensor holds.
#[derive(Clone, Copy, Debug)]
pub enum CellEncoding<'a> {
    /// Raw network outputs: logits for objectness, x, y and classes, log-scale w/h relative
    /// to the given image-relative anchors.
    Predictions(&'a ScaleAnchors),
    /// Training targets: `(objectness, x_cell, y_cell, w_cell, h_cell, class)`.
    Targets,
}

/// Decodes every anchor of every cell into an image-relative midpoint [detection](Detection).
///
/// The output holds `3 * S * S` boxes per image, with `image_idx` set to the position of the
/// image in the batch.
pub fn cells_to_bboxes<B: Backend>(
    cells: Tensor<B, 5>,
    encoding: CellEncoding<'_>,
) -> YoloResult<Vec<Vec<Detection>>> {
    let [batch_size, anchors, rows, cols, attributes] = cells.dims();
    if anchors != ANCHORS_PER_SCALE || rows != cols {
        return Err(YoloError::TensorData(format!(
            "expected [batch, {ANCHORS_PER_SCALE}, S, S, _] cells, got {:?}",
            cells.dims()
        )));
    }
    let grid_size = rows;

    let cells = match encoding {
        CellEncoding::Predictions(_) => {
            let objectness = sigmoid(cells.clone().narrow(4, 0, 1));
            let centers = sigmoid(cells.clone().narrow(4, 1, 2));
            let rest = cells.narrow(4, 3, attributes - 3);
            Tensor::cat(vec![objectness, centers, rest], 4)
        }
        CellEncoding::Targets => cells,
    };
    let values = tensor_to_vec(cells)?;

    let mut images = Vec::with_capacity(batch_size);
    let mut offset = 0;

    for image_idx in 0..batch_size {
        let mut detections = Vec::with_capacity(anchors * rows * cols);

        for anchor in 0..anchors {
            for row in 0..rows {
                for col in 0..cols {
                    let cell = &values[offset..offset + attributes];
                    offset += attributes;

                    let (class, width, height) = match encoding {
                        CellEncoding::Predictions(scale_anchors) => {
                            let [anchor_w, anchor_h] = scale_anchors[anchor];
                            let class = argmax(&cell[BOX_ATTRIBUTES..]);
                            (class, cell[3].exp() * anchor_w, cell[4].exp() * anchor_h)
                        }
                        CellEncoding::Targets => (
                            cell[5].max(0.0) as usize,
                            cell[3] / grid_size as f32,
                            cell[4] / grid_size as f32,
                        ),
                    };

                    detections.push(Detection {
                        image_idx,
                        class,
                        score: cell[0],
                        bbox: [
                            (cell[1] + col as f32) / grid_size as f32,
                            (cell[2] + row as f32) / grid_size as f32,
                            width,
                            height,
                        ],
                    });
                }
            }
        }

        images.push(detections);
    }

    Ok(images)
}

pub(crate) fn tensor_to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> YoloResult<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| YoloError::TensorData(format!("{err:?}")))
}

pub(crate) fn tensor_to_scalar<B: Backend>(tensor: Tensor<B, 1>) -> f32 {
    tensor.into_scalar().elem::<f32>()
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(index, _)| index)
        .unwrap_or_default()
}
