use serde::{Deserialize, Serialize};

use crate::error::{YoloError, YoloResult};

/// Residual blocks with this many repeats feed the upsampling routes.
pub const ROUTE_REPEATS: usize = 8;

/// Number of detection scales a valid architecture produces.
pub const NUM_SCALES: usize = 3;

/// Number of upsampling steps between the coarsest and the finest scale.
pub const NUM_UPSAMPLES: usize = NUM_SCALES - 1;

/// One entry of the static architecture list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerSpec {
    /// A "same" convolution block.
    Conv {
        filters: usize,
        kernel: usize,
        stride: usize,
    },
    /// A residual block made of `repeats` bottlenecks.
    Residual { repeats: usize },
    /// A prediction branch emitting one detection scale.
    Scale,
    /// 2x upsampling concatenated with the most recent route.
    Upsample,
}

const fn conv(filters: usize, kernel: usize, stride: usize) -> LayerSpec {
    LayerSpec::Conv {
        filters,
        kernel,
        stride,
    }
}

const fn residual(repeats: usize) -> LayerSpec {
    LayerSpec::Residual { repeats }
}

const DARKNET53: [LayerSpec; 24] = [
    conv(32, 3, 1),
    conv(64, 3, 2),
    residual(1),
    conv(128, 3, 2),
    residual(2),
    conv(256, 3, 2),
    residual(8),
    conv(512, 3, 2),
    residual(8),
    conv(1024, 3, 2),
    residual(4),
    // End of the Darknet-53 backbone.
    conv(512, 1, 1),
    conv(1024, 3, 1),
    LayerSpec::Scale,
    conv(256, 1, 1),
    LayerSpec::Upsample,
    conv(256, 1, 1),
    conv(512, 3, 1),
    LayerSpec::Scale,
    conv(128, 1, 1),
    LayerSpec::Upsample,
    conv(128, 1, 1),
    conv(256, 3, 1),
    LayerSpec::Scale,
];

/// The YOLOv3 layer list: a Darknet-53 backbone followed by three prediction scales.
pub fn darknet53() -> Vec<LayerSpec> {
    DARKNET53.to_vec()
}

/// Static facts about an architecture list, checked before any weight is allocated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchitectureSummary {
    /// Total downsampling factor at each prediction scale, in output order.
    pub scale_strides: Vec<usize>,
    /// Channels entering each prediction branch.
    pub scale_channels: Vec<usize>,
}

impl ArchitectureSummary {
    /// Grid size of every scale for a square input.
    ///
    /// The input must be a non-zero multiple of every scale stride, otherwise an upsampled
    /// map would not line up with its route.
    pub fn grid_sizes(&self, image_size: usize) -> YoloResult<Vec<usize>> {
        self.scale_strides
            .iter()
            .map(|stride| match image_size {
                0 => Err(YoloError::Config("image size must be positive".into())),
                size if size % stride != 0 => Err(YoloError::Config(format!(
                    "image size {size} is not a multiple of the stride {stride}"
                ))),
                size => Ok(size / stride),
            })
            .collect()
    }
}

/// Walks the list the same way the model is built and rejects lists the forward pass
/// could not execute.
pub fn summarize(in_channels: usize, layers: &[LayerSpec]) -> YoloResult<ArchitectureSummary> {
    let mut channels = in_channels;
    let mut stride = 1;
    let mut routes = Vec::new();
    let mut upsamples = 0;
    let mut summary = ArchitectureSummary {
        scale_strides: Vec::new(),
        scale_channels: Vec::new(),
    };

    for (index, layer) in layers.iter().enumerate() {
        match *layer {
            LayerSpec::Conv {
                filters,
                kernel,
                stride: conv_stride,
            } => {
                if filters == 0 || kernel == 0 || conv_stride == 0 {
                    return Err(YoloError::Architecture(format!(
                        "layer {index}: convolution with a zero dimension"
                    )));
                }
                channels = filters;
                stride *= conv_stride;
            }
            LayerSpec::Residual { repeats } => {
                if channels < 2 {
                    return Err(YoloError::Architecture(format!(
                        "layer {index}: residual block on {channels} channel(s)"
                    )));
                }
                if repeats == ROUTE_REPEATS {
                    routes.push((channels, stride));
                }
            }
            LayerSpec::Scale => {
                if channels < 2 {
                    return Err(YoloError::Architecture(format!(
                        "layer {index}: prediction branch on {channels} channel(s)"
                    )));
                }
                channels /= 2;
                summary.scale_strides.push(stride);
                summary.scale_channels.push(channels);
            }
            LayerSpec::Upsample => {
                let (route_channels, route_stride) = routes.pop().ok_or_else(|| {
                    YoloError::Architecture(format!("layer {index}: upsample without a route"))
                })?;
                if stride % 2 != 0 || stride / 2 != route_stride {
                    return Err(YoloError::Architecture(format!(
                        "layer {index}: upsampled stride {} does not match route stride {route_stride}",
                        stride / 2
                    )));
                }
                if route_channels != 2 * channels {
                    return Err(YoloError::Architecture(format!(
                        "layer {index}: route has {route_channels} channels, expected {}",
                        2 * channels
                    )));
                }
                stride /= 2;
                channels *= 3;
                upsamples += 1;
            }
        }
    }

    if summary.scale_strides.len() != NUM_SCALES {
        return Err(YoloError::Architecture(format!(
            "expected {NUM_SCALES} prediction scales, found {}",
            summary.scale_strides.len()
        )));
    }

    if upsamples != NUM_UPSAMPLES {
        return Err(YoloError::Architecture(format!(
            "expected {NUM_UPSAMPLES} upsampling layers, found {upsamples}"
        )));
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn darknet53_has_three_scales() {
        let summary = summarize(3, &darknet53()).unwrap();

        assert_eq!(summary.scale_strides, vec![32, 16, 8]);
        assert_eq!(summary.scale_channels, vec![512, 256, 128]);
        assert_eq!(summary.grid_sizes(416).unwrap(), vec![13, 26, 52]);
    }

    #[test]
    fn image_size_must_divide_by_every_stride() {
        let summary = summarize(3, &darknet53()).unwrap();

        for size in [0, 36, 400, 420] {
            assert!(
                matches!(summary.grid_sizes(size), Err(YoloError::Config(_))),
                "{size}"
            );
        }
        assert_eq!(summary.grid_sizes(32).unwrap(), vec![1, 2, 4]);
    }

    #[test]
    fn upsample_requires_a_route() {
        let layers = vec![conv(32, 3, 2), LayerSpec::Upsample];

        assert!(matches!(
            summarize(3, &layers),
            Err(YoloError::Architecture(_))
        ));
    }

    #[test]
    fn missing_scales_are_rejected() {
        let layers = vec![conv(32, 3, 1), residual(1), LayerSpec::Scale];

        let err = summarize(3, &layers).unwrap_err();
        assert!(err.to_string().contains("expected 3 prediction scales"));
    }

    #[test]
    fn scales_without_upsampling_are_rejected() {
        let layers = vec![
            conv(16, 3, 1),
            LayerSpec::Scale,
            LayerSpec::Scale,
            LayerSpec::Scale,
        ];

        let err = summarize(3, &layers).unwrap_err();
        assert!(err.to_string().contains("expected 2 upsampling layers, found 0"));
    }
}
