use burn::tensor::{backend::Backend, Tensor, TensorData};

use crate::model::ANCHORS_PER_SCALE;

/// Anchor `(width, height)` relative to the image size.
pub type Anchor = [f32; 2];

/// Anchors of one prediction scale.
pub type ScaleAnchors = [Anchor; ANCHORS_PER_SCALE];

/// The YOLOv3 anchors, coarsest scale first.
pub fn default_anchors() -> Vec<ScaleAnchors> {
    vec![
        [[0.28, 0.22], [0.38, 0.48], [0.90, 0.78]],
        [[0.07, 0.15], [0.15, 0.11], [0.14, 0.29]],
        [[0.02, 0.03], [0.04, 0.07], [0.08, 0.06]],
    ]
}

/// Anchors of one scale expressed in grid cells rather than image units.
pub fn scaled_anchors<B: Backend>(
    anchors: &ScaleAnchors,
    grid_size: usize,
    device: &B::Device,
) -> Tensor<B, 2> {
    let values: Vec<f32> = anchors
        .iter()
        .flat_map(|[width, height]| [width * grid_size as f32, height * grid_size as f32])
        .collect();

    Tensor::from_data(TensorData::new(values, [ANCHORS_PER_SCALE, 2]), device)
}

/// [Scaled anchors](scaled_anchors) for every scale, one `[3, 2]` tensor each.
pub fn scaled_anchors_all<B: Backend>(
    anchors: &[ScaleAnchors],
    grid_sizes: &[usize],
    device: &B::Device,
) -> Vec<Tensor<B, 2>> {
    anchors
        .iter()
        .zip(grid_sizes)
        .map(|(anchors, grid_size)| scaled_anchors(anchors, *grid_size, device))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;

    #[test]
    fn anchors_are_scaled_by_grid_size() {
        let device = Default::default();
        let anchors = default_anchors();

        let scaled = scaled_anchors::<TestBackend>(&anchors[0], 13, &device);

        scaled.into_data().assert_approx_eq(
            &TensorData::from([[3.64f32, 2.86], [4.94, 6.24], [11.7, 10.14]]),
            4,
        );
    }

    #[test]
    fn one_tensor_per_scale() {
        let device = Default::default();
        let scaled = scaled_anchors_all::<TestBackend>(&default_anchors(), &[13, 26, 52], &device);

        assert_eq!(scaled.len(), 3);
        assert!(scaled.iter().all(|anchors| anchors.dims() == [3, 2]));
    }
}
