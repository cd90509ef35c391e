use burn::{
    config::Config,
    module::Module,
    tensor::{
        activation::{log_softmax, relu, sigmoid},
        backend::Backend,
        Tensor,
    },
};

use crate::{
    boxes::intersection_over_union_tensor,
    model::{ANCHORS_PER_SCALE, BOX_ATTRIBUTES},
};

/// Configuration to create a [YOLO loss](YoloLoss).
#[derive(Config, Debug)]
pub struct YoloLossConfig {
    #[config(default = 1.0)]
    pub lambda_class: f32,
    #[config(default = 10.0)]
    pub lambda_no_object: f32,
    #[config(default = 1.0)]
    pub lambda_object: f32,
    #[config(default = 10.0)]
    pub lambda_box: f32,
}

impl YoloLossConfig {
    pub fn init(&self) -> YoloLoss {
        YoloLoss {
            lambda_class: self.lambda_class,
            lambda_no_object: self.lambda_no_object,
            lambda_object: self.lambda_object,
            lambda_box: self.lambda_box,
        }
    }
}

/// YOLOv3 detection loss for a single scale.
///
/// Targets hold `(objectness, x_cell, y_cell, w_cell, h_cell, class)` per anchor and cell.
/// Cells with objectness `1` contribute to the box, object and class terms, cells with `0`
/// to the no-object term, and ignored cells (`-1`) to none.
#[derive(Module, Clone, Debug)]
pub struct YoloLoss {
    lambda_class: f32,
    lambda_no_object: f32,
    lambda_object: f32,
    lambda_box: f32,
}

/// The unweighted terms of the [YOLO loss](YoloLoss) and their weighted sum.
#[derive(Clone, Debug)]
pub struct YoloLossOutput<B: Backend> {
    pub total: Tensor<B, 1>,
    pub box_loss: Tensor<B, 1>,
    pub object_loss: Tensor<B, 1>,
    pub no_object_loss: Tensor<B, 1>,
    pub class_loss: Tensor<B, 1>,
}

impl Default for YoloLoss {
    fn default() -> Self {
        YoloLossConfig::new().init()
    }
}

impl YoloLoss {
    /// Computes the weighted loss of one scale.
    ///
    /// # Shapes
    ///
    /// - predictions: `[batch_size, 3, S, S, num_classes + 5]`
    /// - targets: `[batch_size, 3, S, S, 6]`
    /// - anchors: `[3, 2]`, in grid cells
    /// - output: `[1]`
    pub fn forward<B: Backend>(
        &self,
        predictions: Tensor<B, 5>,
        targets: Tensor<B, 5>,
        anchors: Tensor<B, 2>,
    ) -> Tensor<B, 1> {
        self.forward_terms(predictions, targets, anchors).total
    }

    /// Sums the loss of every scale, each with its own anchors.
    pub fn forward_scales<B: Backend>(
        &self,
        predictions: Vec<Tensor<B, 5>>,
        targets: Vec<Tensor<B, 5>>,
        anchors: &[Tensor<B, 2>],
    ) -> Tensor<B, 1> {
        predictions
            .into_iter()
            .zip(targets)
            .zip(anchors)
            .map(|((predictions, targets), anchors)| {
                self.forward(predictions, targets, anchors.clone())
            })
            .reduce(|total, loss| total + loss)
            .expect("At least one scale should be provided")
    }

    /// Computes every loss term of one scale. See [forward](YoloLoss::forward) for shapes.
    pub fn forward_terms<B: Backend>(
        &self,
        predictions: Tensor<B, 5>,
        targets: Tensor<B, 5>,
        anchors: Tensor<B, 2>,
    ) -> YoloLossOutput<B> {
        let num_classes = predictions.dims()[4] - BOX_ATTRIBUTES;

        let target_objectness = targets.clone().narrow(4, 0, 1);
        let object = target_objectness.clone().equal_elem(1.0).float();
        let no_object = target_objectness.clone().equal_elem(0.0).float();
        // Empty selections average to zero instead of dividing by zero.
        let object_count = object.clone().sum().clamp_min(1.0);
        let no_object_count = no_object.clone().sum().clamp_min(1.0);

        let objectness = predictions.clone().narrow(4, 0, 1);

        let no_object_loss = (binary_cross_entropy_with_logits(
            objectness.clone(),
            target_objectness.clone(),
        ) * no_object)
            .sum()
            / no_object_count;

        let anchors = anchors.reshape([1, ANCHORS_PER_SCALE, 1, 1, 2]);
        let centers = sigmoid(predictions.clone().narrow(4, 1, 2));
        let log_sizes = predictions.clone().narrow(4, 3, 2);
        let box_predictions = Tensor::cat(
            vec![centers.clone(), log_sizes.clone().exp() * anchors.clone()],
            4,
        );
        let ious = intersection_over_union_tensor(box_predictions, targets.clone().narrow(4, 1, 4))
            .detach();
        let object_loss = ((sigmoid(objectness) - ious * target_objectness).powf_scalar(2.0)
            * object.clone())
        .sum()
            / object_count.clone();

        let target_centers = targets.clone().narrow(4, 1, 2);
        let target_log_sizes = (targets.clone().narrow(4, 3, 2) / anchors)
            .add_scalar(1e-16)
            .log();
        let box_error = Tensor::cat(vec![centers, log_sizes], 4)
            - Tensor::cat(vec![target_centers, target_log_sizes], 4);
        let box_loss = (box_error.powf_scalar(2.0) * object.clone()).sum()
            / object_count.clone().mul_scalar(4.0);

        let class_ids = targets
            .narrow(4, BOX_ATTRIBUTES, 1)
            .int()
            .clamp(0, num_classes as i32 - 1);
        let log_probs = log_softmax(predictions.narrow(4, BOX_ATTRIBUTES, num_classes), 4);
        let class_loss = (log_probs.gather(4, class_ids).neg() * object).sum() / object_count;

        let total = box_loss.clone().mul_scalar(self.lambda_box)
            + object_loss.clone().mul_scalar(self.lambda_object)
            + no_object_loss.clone().mul_scalar(self.lambda_no_object)
            + class_loss.clone().mul_scalar(self.lambda_class);

        YoloLossOutput {
            total,
            box_loss,
            object_loss,
            no_object_loss,
            class_loss,
        }
    }
}

/// Element-wise binary cross entropy on logits, in its numerically stable form.
fn binary_cross_entropy_with_logits<B: Backend, const D: usize>(
    logits: Tensor<B, D>,
    targets: Tensor<B, D>,
) -> Tensor<B, D> {
    relu(logits.clone()) - logits.clone() * targets + logits.abs().neg().exp().log1p()
}
