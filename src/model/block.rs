use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, LeakyRelu, LeakyReluConfig, PaddingConfig2d,
    },
    tensor::{
        backend::Backend,
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
        Tensor,
    },
};

/// Number of values predicted per anchor besides the class logits:
/// objectness followed by the four box coordinates.
pub const BOX_ATTRIBUTES: usize = 5;

/// Number of anchors predicted at every grid cell of a scale.
pub const ANCHORS_PER_SCALE: usize = 3;

/// Configuration to create a [convolution block](CnnBlock).
#[derive(Config, Debug)]
pub struct CnnBlockConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    #[config(default = 1)]
    pub stride: usize,
    #[config(default = 0)]
    pub padding: usize,
    /// Apply batch normalization and a leaky ReLU after the convolution.
    /// When disabled the convolution carries its own bias.
    #[config(default = true)]
    pub bn_act: bool,
}

/// Convolution followed by batch normalization and a leaky ReLU (slope 0.1).
#[derive(Module, Debug)]
pub struct CnnBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: Option<BatchNorm<B, 2>>,
    activation: LeakyRelu,
}

impl CnnBlockConfig {
    /// A "same" convolution: padding 1 for 3x3 kernels, none otherwise.
    pub fn same(in_channels: usize, out_channels: usize, kernel_size: usize) -> Self {
        let padding = if kernel_size == 3 { 1 } else { 0 };
        Self::new(in_channels, out_channels, kernel_size).with_padding(padding)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> CnnBlock<B> {
        let conv = Conv2dConfig::new(
            [self.in_channels, self.out_channels],
            [self.kernel_size, self.kernel_size],
        )
        .with_stride([self.stride, self.stride])
        .with_padding(PaddingConfig2d::Explicit(self.padding, self.padding))
        .with_bias(!self.bn_act)
        .init(device);

        let norm = self
            .bn_act
            .then(|| BatchNormConfig::new(self.out_channels).init(device));

        CnnBlock {
            conv,
            norm,
            activation: LeakyReluConfig::new().with_negative_slope(0.1).init(),
        }
    }
}

impl<B: Backend> CnnBlock<B> {
    /// # Shapes
    ///
    /// - input: `[batch_size, in_channels, height, width]`
    /// - output: `[batch_size, out_channels, height / stride, width / stride]`
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(input);

        match &self.norm {
            Some(norm) => self.activation.forward(norm.forward(x)),
            None => x,
        }
    }
}

/// A 1x1 channel reduction followed by a 3x3 expansion back to the input width.
#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    reduce: CnnBlock<B>,
    expand: CnnBlock<B>,
}

impl<B: Backend> Bottleneck<B> {
    fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            reduce: CnnBlockConfig::same(channels, channels / 2, 1).init(device),
            expand: CnnBlockConfig::same(channels / 2, channels, 3).init(device),
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.expand.forward(self.reduce.forward(input))
    }
}

/// Configuration to create a [residual block](ResidualBlock).
#[derive(Config, Debug)]
pub struct ResidualBlockConfig {
    pub channels: usize,
    #[config(default = 1)]
    pub num_repeats: usize,
    #[config(default = true)]
    pub use_residual: bool,
}

/// A stack of [bottlenecks](Bottleneck), each added to its input when `use_residual` is set.
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    layers: Vec<Bottleneck<B>>,
    use_residual: bool,
    num_repeats: usize,
}

impl ResidualBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ResidualBlock<B> {
        let layers = (0..self.num_repeats)
            .map(|_| Bottleneck::new(self.channels, device))
            .collect();

        ResidualBlock {
            layers,
            use_residual: self.use_residual,
            num_repeats: self.num_repeats,
        }
    }
}

impl<B: Backend> ResidualBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = input;

        for layer in self.layers.iter() {
            x = match self.use_residual {
                true => x.clone() + layer.forward(x),
                false => layer.forward(x),
            };
        }

        x
    }

    pub fn num_repeats(&self) -> usize {
        self.num_repeats
    }
}

/// Configuration to create a [scale prediction head](ScalePrediction).
#[derive(Config, Debug)]
pub struct ScalePredictionConfig {
    pub in_channels: usize,
    pub num_classes: usize,
}

/// Detection head for one scale.
///
/// Produces, for every grid cell and each of the [ANCHORS_PER_SCALE] anchors,
/// `[objectness, x, y, w, h, class logits...]`.
#[derive(Module, Debug)]
pub struct ScalePrediction<B: Backend> {
    expand: CnnBlock<B>,
    predict: CnnBlock<B>,
    num_classes: usize,
}

impl ScalePredictionConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ScalePrediction<B> {
        let hidden = 2 * self.in_channels;
        let outputs = (self.num_classes + BOX_ATTRIBUTES) * ANCHORS_PER_SCALE;

        ScalePrediction {
            expand: CnnBlockConfig::same(self.in_channels, hidden, 3).init(device),
            predict: CnnBlockConfig::same(hidden, outputs, 1)
                .with_bn_act(false)
                .init(device),
            num_classes: self.num_classes,
        }
    }
}

impl<B: Backend> ScalePrediction<B> {
    /// # Shapes
    ///
    /// - input: `[batch_size, in_channels, S, S]`
    /// - output: `[batch_size, 3, S, S, num_classes + 5]`
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 5> {
        let [batch_size, _, height, width] = input.dims();
        let x = self.predict.forward(self.expand.forward(input));

        x.reshape([
            batch_size,
            ANCHORS_PER_SCALE,
            self.num_classes + BOX_ATTRIBUTES,
            height,
            width,
        ])
        .permute([0, 1, 3, 4, 2])
    }
}

/// Nearest-neighbour upsampling by an integer factor.
#[derive(Module, Clone, Debug)]
pub struct Upsample {
    scale_factor: usize,
}

impl Upsample {
    pub fn new(scale_factor: usize) -> Self {
        Self { scale_factor }
    }

    pub fn forward<B: Backend>(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, height, width] = input.dims();

        interpolate(
            input,
            [height * self.scale_factor, width * self.scale_factor],
            InterpolateOptions::new(InterpolateMode::Nearest),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use burn::tensor::{Distribution, TensorData};

    #[test]
    fn cnn_block_halves_resolution_with_stride_two() {
        let device = Default::default();
        let block = CnnBlockConfig::same(3, 8, 3)
            .with_stride(2)
            .init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 4>::random([2, 3, 16, 16], Distribution::Default, &device);
        let output = block.forward(input);

        assert_eq!(output.dims(), [2, 8, 8, 8]);
    }

    #[test]
    fn cnn_block_without_bn_act_is_a_plain_convolution() {
        let device = Default::default();
        let block = CnnBlockConfig::same(4, 6, 1)
            .with_bn_act(false)
            .init::<TestBackend>(&device);

        assert!(block.norm.is_none());
        assert!(block.conv.bias.is_some());
    }

    #[test]
    fn residual_block_keeps_shape() {
        let device = Default::default();
        let block = ResidualBlockConfig::new(8)
            .with_num_repeats(2)
            .init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 4>::random([1, 8, 6, 6], Distribution::Default, &device);

        assert_eq!(block.forward(input).dims(), [1, 8, 6, 6]);
        assert_eq!(block.num_repeats(), 2);
    }

    #[test]
    fn scale_prediction_layout() {
        let device = Default::default();
        let head = ScalePredictionConfig::new(8, 4).init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 4>::random([2, 8, 5, 5], Distribution::Default, &device);

        assert_eq!(head.forward(input).dims(), [2, 3, 5, 5, 9]);
    }

    #[test]
    fn upsample_repeats_each_pixel() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 4>::from_data(
            TensorData::from([[[[1.0f32, 2.0], [3.0, 4.0]]]]),
            &device,
        );

        let output = Upsample::new(2).forward(input);

        output.into_data().assert_eq(
            &TensorData::from([[[
                [1.0f32, 1.0, 2.0, 2.0],
                [1.0, 1.0, 2.0, 2.0],
                [3.0, 3.0, 4.0, 4.0],
                [3.0, 3.0, 4.0, 4.0],
            ]]]),
            false,
        );
    }
}
