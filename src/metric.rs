use std::{collections::HashMap, fmt};

use burn::tensor::{activation::sigmoid, backend::Backend, Tensor};

use crate::{
    boxes::{
        cells_to_bboxes, intersection_over_union, non_max_suppression, tensor_to_scalar,
        BoxFormat, CellEncoding, Detection,
    },
    dataset::YoloBatch,
    error::{YoloError, YoloResult},
    model::{YoloV3, BOX_ATTRIBUTES},
};

const EPSILON: f32 = 1e-6;

/// Mean over classes of the area under the precision/recall curve.
///
/// Predictions are matched greedily, highest score first, against ground truth boxes of the
/// same image and class. A prediction is a true positive when its best overlap exceeds
/// `iou_threshold` and that ground truth box has not been matched yet. Classes without
/// ground truth are left out of the mean.
pub fn mean_average_precision(
    predictions: &[Detection],
    ground_truths: &[Detection],
    iou_threshold: f32,
    format: BoxFormat,
    num_classes: usize,
) -> f32 {
    let average_precisions: Vec<f32> = (0..num_classes)
        .filter_map(|class| {
            average_precision(predictions, ground_truths, class, iou_threshold, format)
        })
        .collect();

    if average_precisions.is_empty() {
        return 0.0;
    }

    average_precisions.iter().sum::<f32>() / average_precisions.len() as f32
}

fn average_precision(
    predictions: &[Detection],
    ground_truths: &[Detection],
    class: usize,
    iou_threshold: f32,
    format: BoxFormat,
) -> Option<f32> {
    let mut truths_per_image: HashMap<usize, Vec<(&Detection, bool)>> = HashMap::new();
    for truth in ground_truths.iter().filter(|truth| truth.class == class) {
        truths_per_image
            .entry(truth.image_idx)
            .or_default()
            .push((truth, false));
    }
    let total_truths: usize = truths_per_image.values().map(Vec::len).sum();
    if total_truths == 0 {
        return None;
    }

    let mut detections: Vec<&Detection> = predictions
        .iter()
        .filter(|detection| detection.class == class)
        .collect();
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut true_positives = 0.0;
    let mut false_positives = 0.0;
    let mut recalls = vec![0.0];
    let mut precisions = vec![1.0];

    for detection in detections {
        let best = truths_per_image.get_mut(&detection.image_idx).and_then(|truths| {
            truths
                .iter_mut()
                .map(|truth| {
                    let iou = intersection_over_union(&detection.bbox, &truth.0.bbox, format);
                    (iou, truth)
                })
                .max_by(|(a, _), (b, _)| a.total_cmp(b))
        });

        match best {
            Some((iou, (_, matched))) if iou > iou_threshold && !*matched => {
                *matched = true;
                true_positives += 1.0;
            }
            _ => false_positives += 1.0,
        }

        recalls.push(true_positives / (total_truths as f32 + EPSILON));
        precisions.push(true_positives / (true_positives + false_positives + EPSILON));
    }

    Some(trapezoid(&precisions, &recalls))
}

fn trapezoid(values: &[f32], positions: &[f32]) -> f32 {
    values
        .windows(2)
        .zip(positions.windows(2))
        .map(|(value, position)| (position[1] - position[0]) * (value[0] + value[1]) / 2.0)
        .sum()
}

/// Running counts behind [class accuracy](ClassAccuracyReport).
///
/// Only cells whose target objectness is exactly `1` (objects) or `0` (background) count;
/// ignored anchors are left out.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ClassAccuracy {
    correct_class: f64,
    correct_object: f64,
    correct_no_object: f64,
    total_object: f64,
    total_no_object: f64,
}

/// Accuracies in percent.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClassAccuracyReport {
    pub class: f32,
    pub no_object: f32,
    pub object: f32,
}

impl fmt::Display for ClassAccuracyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "class accuracy {:.2}%, no obj accuracy {:.2}%, obj accuracy {:.2}%",
            self.class, self.no_object, self.object
        )
    }
}

impl ClassAccuracy {
    /// Adds one batch of predictions, one tensor per scale.
    pub fn update<B: Backend>(
        &mut self,
        predictions: &[Tensor<B, 5>],
        targets: &[Tensor<B, 5>],
        threshold: f32,
    ) {
        for (prediction, target) in predictions.iter().zip(targets) {
            let num_classes = prediction.dims()[4] - BOX_ATTRIBUTES;
            let objectness = target.clone().narrow(4, 0, 1);
            let object = objectness.clone().equal_elem(1.0).float();
            let no_object = objectness.equal_elem(0.0).float();

            let predicted_class = prediction
                .clone()
                .narrow(4, BOX_ATTRIBUTES, num_classes)
                .argmax(4);
            let target_class = target.clone().narrow(4, BOX_ATTRIBUTES, 1).int();
            let correct_class = predicted_class.equal(target_class).float() * object.clone();

            let predicted_object = sigmoid(prediction.clone().narrow(4, 0, 1))
                .greater_elem(threshold)
                .float();
            let correct_object = predicted_object.clone() * object.clone();
            let correct_no_object = predicted_object.neg().add_scalar(1.0) * no_object.clone();

            let count = |tensor: Tensor<B, 5>| tensor_to_scalar(tensor.sum()) as f64;
            self.correct_class += count(correct_class);
            self.correct_object += count(correct_object);
            self.correct_no_object += count(correct_no_object);
            self.total_object += count(object);
            self.total_no_object += count(no_object);
        }
    }

    pub fn report(&self) -> ClassAccuracyReport {
        let percent = |correct: f64, total: f64| (correct / (total + 1e-16) * 100.0) as f32;

        ClassAccuracyReport {
            class: percent(self.correct_class, self.total_object),
            no_object: percent(self.correct_no_object, self.total_no_object),
            object: percent(self.correct_object, self.total_object),
        }
    }
}

/// Runs the model over every batch and reports its class and objectness accuracy.
pub fn check_class_accuracy<B: Backend>(
    model: &YoloV3<B>,
    batches: impl IntoIterator<Item = YoloBatch<B>>,
    threshold: f32,
) -> ClassAccuracyReport {
    let mut accuracy = ClassAccuracy::default();

    for batch in batches {
        let predictions = model.forward(batch.images);
        accuracy.update(&predictions, &batch.targets, threshold);
    }

    accuracy.report()
}

/// Decodes predictions and ground truth of every batch into image-relative detections.
///
/// Predictions of the three scales are merged and filtered per image with
/// [non-maximum suppression](non_max_suppression). Ground truth comes from the finest
/// scale, keeping cells whose objectness exceeds `threshold`. Images are numbered in the
/// order they are visited.
pub fn evaluation_boxes<B: Backend>(
    model: &YoloV3<B>,
    batches: impl IntoIterator<Item = YoloBatch<B>>,
    iou_threshold: f32,
    threshold: f32,
    format: BoxFormat,
) -> YoloResult<(Vec<Detection>, Vec<Detection>)> {
    let mut predicted = Vec::new();
    let mut ground_truth = Vec::new();
    let mut image_idx = 0;

    for batch in batches {
        let batch_size = batch.images.dims()[0];
        let predictions = model.forward(batch.images);

        let mut per_image = vec![Vec::new(); batch_size];
        for (scale, anchors) in predictions.into_iter().zip(model.anchors()) {
            let decoded = cells_to_bboxes(scale, CellEncoding::Predictions(anchors))?;
            for (detections, image) in per_image.iter_mut().zip(decoded) {
                detections.extend(image);
            }
        }

        let finest = batch.targets.into_iter().last().ok_or_else(|| {
            YoloError::TensorData("a batch without target grids cannot be evaluated".into())
        })?;
        let truths = cells_to_bboxes(finest, CellEncoding::Targets)?;

        for (detections, truths) in per_image.into_iter().zip(truths) {
            let kept = non_max_suppression(detections, iou_threshold, threshold, format);
            predicted.extend(kept.into_iter().map(|detection| Detection {
                image_idx,
                ..detection
            }));
            ground_truth.extend(
                truths
                    .into_iter()
                    .filter(|truth| truth.score > threshold)
                    .map(|truth| Detection { image_idx, ..truth }),
            );
            image_idx += 1;
        }
    }

    Ok((predicted, ground_truth))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        anchors::default_anchors,
        dataset::{YoloBatcher, YoloItem},
        model::{tiny_layers, YoloV3Config},
        targets::{LabelBox, TargetBuilder},
        TestBackend,
    };
    use burn::{data::dataloader::batcher::Batcher, tensor::TensorData};

    fn detection(image_idx: usize, class: usize, score: f32, bbox: [f32; 4]) -> Detection {
        Detection {
            image_idx,
            class,
            score,
            bbox,
        }
    }

    #[test]
    fn perfect_predictions_score_one() {
        let truths = vec![
            detection(0, 0, 1.0, [0.3, 0.3, 0.2, 0.2]),
            detection(1, 0, 1.0, [0.6, 0.6, 0.2, 0.2]),
            detection(1, 1, 1.0, [0.2, 0.7, 0.1, 0.3]),
        ];
        let predictions: Vec<_> = truths
            .iter()
            .map(|truth| Detection {
                score: 0.9,
                ..truth.clone()
            })
            .collect();

        let map = mean_average_precision(&predictions, &truths, 0.5, BoxFormat::Midpoint, 3);

        assert!((map - 1.0).abs() < 1e-4, "{map}");
    }

    #[test]
    fn duplicates_and_misses_lower_precision() {
        let truths = vec![
            detection(0, 0, 1.0, [0.5, 0.5, 0.2, 0.2]),
            detection(0, 0, 1.0, [0.1, 0.1, 0.1, 0.1]),
        ];
        let predictions = vec![
            detection(0, 0, 0.9, [0.5, 0.5, 0.2, 0.2]),
            detection(0, 0, 0.8, [0.5, 0.5, 0.2, 0.2]),
            detection(0, 0, 0.7, [0.1, 0.1, 0.1, 0.1]),
        ];

        let map = mean_average_precision(&predictions, &truths, 0.5, BoxFormat::Midpoint, 1);

        // Curve: (0, 1), (0.5, 1), (0.5, 0.5), (1, 2/3).
        let expected = 0.5 + 0.5 * (0.5 + 2.0 / 3.0) / 2.0;
        assert!((map - expected).abs() < 1e-4, "{map}");
    }

    #[test]
    fn predictions_on_other_images_do_not_match() {
        let truths = vec![detection(0, 0, 1.0, [0.5, 0.5, 0.2, 0.2])];
        let predictions = vec![detection(1, 0, 0.9, [0.5, 0.5, 0.2, 0.2])];

        let map = mean_average_precision(&predictions, &truths, 0.5, BoxFormat::Midpoint, 1);

        assert_eq!(map, 0.0);
    }

    #[test]
    fn classes_without_ground_truth_are_skipped() {
        let truths = vec![detection(0, 2, 1.0, [0.5, 0.5, 0.2, 0.2])];
        let predictions = vec![
            detection(0, 2, 0.9, [0.5, 0.5, 0.2, 0.2]),
            detection(0, 0, 0.9, [0.5, 0.5, 0.2, 0.2]),
        ];

        let map = mean_average_precision(&predictions, &truths, 0.5, BoxFormat::Midpoint, 3);

        assert!((map - 1.0).abs() < 1e-4);
        assert_eq!(
            mean_average_precision(&predictions, &[], 0.5, BoxFormat::Midpoint, 3),
            0.0
        );
    }

    #[test]
    fn accuracy_counts_only_labelled_cells() {
        let device = Default::default();
        // A 1x1 grid of two classes: anchor 0 holds class 1, anchor 1 is background and
        // anchor 2 is ignored.
        let targets = Tensor::<TestBackend, 5>::from_data(
            TensorData::new(
                vec![
                    1.0, 0.5, 0.5, 1.0, 1.0, 1.0, //
                    0.0, 0.0, 0.0, 0.0, 0.0, 0.0, //
                    -1.0, 0.0, 0.0, 0.0, 0.0, 0.0,
                ],
                [1, 3, 1, 1, 6],
            ),
            &device,
        );
        let predictions = Tensor::<TestBackend, 5>::from_data(
            TensorData::new(
                vec![
                    5.0, 0.0, 0.0, 0.0, 0.0, -1.0, 1.0, //
                    5.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, //
                    5.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
                ],
                [1, 3, 1, 1, 7],
            ),
            &device,
        );

        let mut accuracy = ClassAccuracy::default();
        accuracy.update(&[predictions], &[targets], 0.5);
        let report = accuracy.report();

        assert!((report.class - 100.0).abs() < 1e-3);
        assert!((report.object - 100.0).abs() < 1e-3);
        assert!(report.no_object.abs() < 1e-3);
    }

    #[test]
    fn evaluation_numbers_images_across_batches() {
        let device = Default::default();
        let model = YoloV3Config::new()
            .with_num_classes(2)
            .with_layers(tiny_layers())
            .init::<TestBackend>(&device)
            .unwrap();
        let builder = TargetBuilder::new(&default_anchors(), &[4, 8, 16]);
        let item = YoloItem::new(
            vec![0.5; 3 * 32 * 32],
            32,
            vec![LabelBox {
                x: 0.4,
                y: 0.6,
                width: 0.05,
                height: 0.06,
                class: 1,
            }],
            &builder,
        );
        let batcher = YoloBatcher::<TestBackend>::new(device);
        let batches = vec![
            batcher.batch(vec![item.clone(), item.clone()]),
            batcher.batch(vec![item]),
        ];

        let (predicted, truths) =
            evaluation_boxes(&model, batches, 0.45, 0.05, BoxFormat::Midpoint).unwrap();

        let images: Vec<usize> = truths.iter().map(|truth| truth.image_idx).collect();
        assert_eq!(images, vec![0, 1, 2]);
        assert!(truths.iter().all(|truth| truth.class == 1));
        assert!((truths[0].bbox[0] - 0.4).abs() < 1e-5);
        assert!((truths[0].bbox[2] - 0.05).abs() < 1e-5);
        assert!(predicted.iter().all(|detection| detection.image_idx < 3));
        assert!(predicted.iter().all(|detection| detection.score > 0.05));
    }
}
