#![recursion_limit = "256"]

pub mod anchors;
#[cfg(any(
    feature = "ndarray",
    feature = "wgpu",
    feature = "tch-cpu",
    feature = "tch-gpu"
))]
pub mod backend;
pub mod boxes;
pub mod dataset;
pub mod error;
pub mod logging;
pub mod loss;
pub mod metric;
pub mod model;
pub mod schedule;
pub mod targets;
pub mod training;

pub use error::{YoloError, YoloResult};

#[cfg(test)]
pub(crate) type TestBackend = burn::backend::NdArray<f32>;

#[cfg(test)]
pub(crate) type TestAutodiffBackend = burn::backend::Autodiff<TestBackend>;
