mod architecture;
mod block;

pub use architecture::*;
pub use block::*;

use burn::{
    config::Config,
    module::{Ignored, Module},
    tensor::{backend::Backend, Tensor},
};

use crate::{
    anchors::{default_anchors, scaled_anchors, ScaleAnchors},
    dataset::YoloBatch,
    error::{YoloError, YoloResult},
    loss::{YoloLoss, YoloLossConfig},
};

/// Configuration to create a [YOLOv3 model](YoloV3).
#[derive(Config, Debug)]
pub struct YoloV3Config {
    #[config(default = 3)]
    pub in_channels: usize,
    #[config(default = 20)]
    pub num_classes: usize,
    #[config(default = "darknet53()")]
    pub layers: Vec<LayerSpec>,
    /// Image-relative anchors of every scale, coarsest first.
    #[config(default = "default_anchors()")]
    pub anchors: Vec<ScaleAnchors>,
    #[config(default = "YoloLossConfig::new()")]
    pub loss: YoloLossConfig,
}

/// A built entry of the architecture list.
#[derive(Module, Debug)]
pub enum Layer<B: Backend> {
    Conv(CnnBlock<B>),
    Residual(ResidualBlock<B>),
    Prediction(ScalePrediction<B>),
    Upsample(Upsample),
}

/// YOLOv3 detector.
///
/// The forward pass returns one tensor per scale, coarsest grid first, each shaped
/// `[batch_size, 3, S, S, num_classes + 5]`.
#[derive(Module, Debug)]
pub struct YoloV3<B: Backend> {
    layers: Vec<Layer<B>>,
    num_classes: usize,
    anchors: Ignored<Vec<ScaleAnchors>>,
    loss: YoloLoss,
}

/// Loss of a batch together with what produced it.
#[derive(Clone, Debug)]
pub struct YoloOutput<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub predictions: Vec<Tensor<B, 5>>,
    pub targets: Vec<Tensor<B, 5>>,
}

impl YoloV3Config {
    /// Validates the layer list and summarizes its prediction scales.
    pub fn summary(&self) -> YoloResult<ArchitectureSummary> {
        let summary = summarize(self.in_channels, &self.layers)?;

        if self.anchors.len() != summary.scale_strides.len() {
            return Err(YoloError::Architecture(format!(
                "{} anchor sets for {} prediction scales",
                self.anchors.len(),
                summary.scale_strides.len()
            )));
        }

        Ok(summary)
    }

    /// Initializes a model, rejecting layer lists the forward pass could not run.
    pub fn init<B: Backend>(&self, device: &B::Device) -> YoloResult<YoloV3<B>> {
        self.summary()?;

        let mut layers = Vec::with_capacity(self.layers.len());
        let mut in_channels = self.in_channels;

        for spec in self.layers.iter() {
            match *spec {
                LayerSpec::Conv {
                    filters,
                    kernel,
                    stride,
                } => {
                    let block = CnnBlockConfig::same(in_channels, filters, kernel)
                        .with_stride(stride)
                        .init(device);
                    layers.push(Layer::Conv(block));
                    in_channels = filters;
                }
                LayerSpec::Residual { repeats } => {
                    let block = ResidualBlockConfig::new(in_channels)
                        .with_num_repeats(repeats)
                        .init(device);
                    layers.push(Layer::Residual(block));
                }
                LayerSpec::Scale => {
                    let block = ResidualBlockConfig::new(in_channels)
                        .with_use_residual(false)
                        .init(device);
                    let reduce = CnnBlockConfig::same(in_channels, in_channels / 2, 1).init(device);
                    let head = ScalePredictionConfig::new(in_channels / 2, self.num_classes)
                        .init(device);

                    layers.push(Layer::Residual(block));
                    layers.push(Layer::Conv(reduce));
                    layers.push(Layer::Prediction(head));
                    in_channels /= 2;
                }
                LayerSpec::Upsample => {
                    layers.push(Layer::Upsample(Upsample::new(2)));
                    in_channels *= 3;
                }
            }
        }

        Ok(YoloV3 {
            layers,
            num_classes: self.num_classes,
            anchors: Ignored(self.anchors.clone()),
            loss: self.loss.init(),
        })
    }
}

impl<B: Backend> YoloV3<B> {
    /// # Shapes
    ///
    /// - images: `[batch_size, in_channels, H, W]`
    /// - output: three tensors `[batch_size, 3, H / stride, W / stride, num_classes + 5]`
    pub fn forward(&self, images: Tensor<B, 4>) -> Vec<Tensor<B, 5>> {
        let mut outputs = Vec::with_capacity(NUM_SCALES);
        let mut routes = Vec::new();
        let mut x = images;

        for layer in self.layers.iter() {
            match layer {
                Layer::Prediction(head) => {
                    outputs.push(head.forward(x.clone()));
                }
                Layer::Conv(block) => {
                    x = block.forward(x);
                }
                Layer::Residual(block) => {
                    x = block.forward(x);
                    if block.num_repeats() == ROUTE_REPEATS {
                        routes.push(x.clone());
                    }
                }
                Layer::Upsample(upsample) => {
                    let route = routes
                        .pop()
                        .expect("Every upsample should have a route, checked at init");
                    x = Tensor::cat(vec![upsample.forward(x), route], 1);
                }
            }
        }

        outputs
    }

    /// Sums the loss of the three scales, with anchors scaled to each output's grid.
    pub fn forward_loss(&self, batch: YoloBatch<B>) -> YoloOutput<B> {
        let predictions = self.forward(batch.images);
        let anchors = self.scaled_anchors(&predictions);
        let loss = self
            .loss
            .forward_scales(predictions.clone(), batch.targets.clone(), &anchors);

        YoloOutput {
            loss,
            predictions,
            targets: batch.targets,
        }
    }

    /// Anchors of every scale in grid cells of the matching prediction.
    pub fn scaled_anchors(&self, predictions: &[Tensor<B, 5>]) -> Vec<Tensor<B, 2>> {
        predictions
            .iter()
            .zip(self.anchors.iter())
            .map(|(prediction, anchors)| {
                scaled_anchors(anchors, prediction.dims()[2], &prediction.device())
            })
            .collect()
    }

    /// Image-relative anchors of every scale, coarsest first.
    pub fn anchors(&self) -> &[ScaleAnchors] {
        &self.anchors
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }
}

/// A scaled-down list with the same routing shape as Darknet-53.
#[cfg(test)]
pub(crate) fn tiny_layers() -> Vec<LayerSpec> {
    vec![
        LayerSpec::Conv {
            filters: 4,
            kernel: 3,
            stride: 2,
        },
        LayerSpec::Residual { repeats: 8 },
        LayerSpec::Conv {
            filters: 8,
            kernel: 3,
            stride: 2,
        },
        LayerSpec::Residual { repeats: 8 },
        LayerSpec::Conv {
            filters: 16,
            kernel: 3,
            stride: 2,
        },
        LayerSpec::Scale,
        LayerSpec::Conv {
            filters: 4,
            kernel: 1,
            stride: 1,
        },
        LayerSpec::Upsample,
        LayerSpec::Scale,
        LayerSpec::Conv {
            filters: 2,
            kernel: 1,
            stride: 1,
        },
        LayerSpec::Upsample,
        LayerSpec::Scale,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use burn::tensor::Distribution;

    #[test]
    fn forward_emits_three_scales() {
        let device = Default::default();
        let config = YoloV3Config::new()
            .with_num_classes(2)
            .with_layers(tiny_layers());
        let model = config.init::<TestBackend>(&device).unwrap();

        let images = Tensor::<TestBackend, 4>::random([1, 3, 32, 32], Distribution::Default, &device);
        let outputs = model.forward(images);

        let dims: Vec<_> = outputs.iter().map(|output| output.dims()).collect();
        assert_eq!(dims, vec![[1, 3, 4, 4, 7], [1, 3, 8, 8, 7], [1, 3, 16, 16, 7]]);
    }

    #[test]
    fn init_rejects_broken_lists() {
        let device = Default::default();
        let config = YoloV3Config::new().with_layers(vec![LayerSpec::Upsample]);

        assert!(config.init::<TestBackend>(&device).is_err());
    }

    #[test]
    fn anchors_must_match_the_scales() {
        let config = YoloV3Config::new()
            .with_layers(tiny_layers())
            .with_anchors(default_anchors()[..2].to_vec());

        assert!(matches!(config.summary(), Err(YoloError::Architecture(_))));
    }

    #[test]
    fn scaled_anchors_follow_the_output_grids() {
        let device = Default::default();
        let model = YoloV3Config::new()
            .with_num_classes(2)
            .with_layers(tiny_layers())
            .init::<TestBackend>(&device)
            .unwrap();

        let images = Tensor::<TestBackend, 4>::zeros([1, 3, 32, 32], &device);
        let anchors = model.scaled_anchors(&model.forward(images));

        let largest: Vec<f32> = anchors
            .iter()
            .map(|anchors| anchors.clone().max().into_scalar())
            .collect();
        assert!((largest[0] - 0.9 * 4.0).abs() < 1e-5);
        assert!((largest[1] - 0.29 * 8.0).abs() < 1e-5);
        assert!((largest[2] - 0.08 * 16.0).abs() < 1e-5);
    }

    #[test]
    fn darknet53_is_the_default() {
        let config = YoloV3Config::new();

        assert_eq!(config.layers, darknet53());
        assert_eq!(config.summary().unwrap().grid_sizes(416).unwrap(), vec![13, 26, 52]);
    }
}
