use serde::{Deserialize, Serialize};

use crate::{
    anchors::{Anchor, ScaleAnchors},
    boxes::iou_width_height,
    model::ANCHORS_PER_SCALE,
};

/// Values stored per anchor and cell: `(objectness, x_cell, y_cell, w_cell, h_cell, class)`.
pub const TARGET_ATTRIBUTES: usize = 6;

/// Objectness of anchors that overlap an object well but were not assigned to it.
/// The loss ignores them.
pub const IGNORED: f32 = -1.0;

/// A labelled object in image-relative midpoint coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LabelBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub class: usize,
}

/// Target grid of one scale, laid out as `[3, S, S, 6]`.
#[derive(Clone, Debug, PartialEq)]
pub struct ScaleTarget {
    pub grid_size: usize,
    pub values: Vec<f32>,
}

impl ScaleTarget {
    fn new(grid_size: usize) -> Self {
        Self {
            grid_size,
            values: vec![0.0; ANCHORS_PER_SCALE * grid_size * grid_size * TARGET_ATTRIBUTES],
        }
    }

    pub fn shape(&self) -> [usize; 4] {
        [
            ANCHORS_PER_SCALE,
            self.grid_size,
            self.grid_size,
            TARGET_ATTRIBUTES,
        ]
    }

    fn offset(&self, anchor: usize, row: usize, col: usize) -> usize {
        ((anchor * self.grid_size + row) * self.grid_size + col) * TARGET_ATTRIBUTES
    }

    /// The six target values of one anchor in one cell.
    pub fn cell(&self, anchor: usize, row: usize, col: usize) -> &[f32] {
        let offset = self.offset(anchor, row, col);
        &self.values[offset..offset + TARGET_ATTRIBUTES]
    }

    fn cell_mut(&mut self, anchor: usize, row: usize, col: usize) -> &mut [f32] {
        let offset = self.offset(anchor, row, col);
        &mut self.values[offset..offset + TARGET_ATTRIBUTES]
    }
}

/// Assigns labelled boxes to anchors on every prediction scale.
#[derive(Clone, Debug)]
pub struct TargetBuilder {
    anchors: Vec<Anchor>,
    grid_sizes: Vec<usize>,
    ignore_iou_threshold: f32,
}

impl TargetBuilder {
    pub fn new(anchors: &[ScaleAnchors], grid_sizes: &[usize]) -> Self {
        Self {
            anchors: anchors.iter().flatten().copied().collect(),
            grid_sizes: grid_sizes.to_vec(),
            ignore_iou_threshold: 0.5,
        }
    }

    pub fn with_ignore_iou_threshold(mut self, threshold: f32) -> Self {
        self.ignore_iou_threshold = threshold;
        self
    }

    /// Builds one target grid per scale.
    ///
    /// Each box is matched against all anchors by width/height IoU, best first. On every
    /// scale the best free anchor of the box's cell takes the box; other free anchors above
    /// the ignore threshold are marked [IGNORED].
    pub fn build(&self, boxes: &[LabelBox]) -> Vec<ScaleTarget> {
        let mut targets: Vec<ScaleTarget> = self
            .grid_sizes
            .iter()
            .map(|grid_size| ScaleTarget::new(*grid_size))
            .collect();

        for label in boxes {
            let ious: Vec<f32> = self
                .anchors
                .iter()
                .map(|anchor| iou_width_height(&[label.width, label.height], anchor))
                .collect();
            let mut order: Vec<usize> = (0..ious.len()).collect();
            order.sort_by(|a, b| ious[*b].total_cmp(&ious[*a]));

            let mut has_anchor = vec![false; targets.len()];

            for anchor_idx in order {
                let scale = anchor_idx / ANCHORS_PER_SCALE;
                let anchor = anchor_idx % ANCHORS_PER_SCALE;
                let Some(target) = targets.get_mut(scale) else {
                    continue;
                };

                let grid_size = target.grid_size as f32;
                let row = grid_cell(label.y, target.grid_size);
                let col = grid_cell(label.x, target.grid_size);
                let cell = target.cell_mut(anchor, row, col);
                let taken = cell[0] != 0.0;

                if !taken && !has_anchor[scale] {
                    cell.copy_from_slice(&[
                        1.0,
                        grid_size * label.x - col as f32,
                        grid_size * label.y - row as f32,
                        label.width * grid_size,
                        label.height * grid_size,
                        label.class as f32,
                    ]);
                    has_anchor[scale] = true;
                } else if !taken && ious[anchor_idx] > self.ignore_iou_threshold {
                    cell[0] = IGNORED;
                }
            }
        }

        targets
    }
}

/// Index of the cell containing a normalized coordinate; `1.0` lands in the last cell.
fn grid_cell(coordinate: f32, grid_size: usize) -> usize {
    ((grid_size as f32 * coordinate) as usize).min(grid_size - 1)
}
