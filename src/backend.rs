//! Backend picked by the enabled cargo feature, for the binaries.
//!
//! When several backend features are enabled, `wgpu` wins over `tch-gpu`, then `tch-cpu`,
//! then `ndarray`.

use burn::backend::Autodiff;

#[cfg(feature = "wgpu")]
mod selected {
    use burn::backend::wgpu::{Wgpu, WgpuDevice};

    pub type Backend = Wgpu;

    pub fn device() -> WgpuDevice {
        WgpuDevice::default()
    }
}

#[cfg(all(feature = "tch-gpu", not(feature = "wgpu")))]
mod selected {
    use burn::backend::libtorch::{LibTorch, LibTorchDevice};

    pub type Backend = LibTorch<f32>;

    pub fn device() -> LibTorchDevice {
        #[cfg(not(target_os = "macos"))]
        return LibTorchDevice::Cuda(0);
        #[cfg(target_os = "macos")]
        return LibTorchDevice::Mps;
    }
}

#[cfg(all(feature = "tch-cpu", not(any(feature = "wgpu", feature = "tch-gpu"))))]
mod selected {
    use burn::backend::libtorch::{LibTorch, LibTorchDevice};

    pub type Backend = LibTorch<f32>;

    pub fn device() -> LibTorchDevice {
        LibTorchDevice::Cpu
    }
}

#[cfg(all(
    feature = "ndarray",
    not(any(feature = "wgpu", feature = "tch-gpu", feature = "tch-cpu"))
))]
mod selected {
    use burn::backend::ndarray::{NdArray, NdArrayDevice};

    pub type Backend = NdArray<f32>;

    pub fn device() -> NdArrayDevice {
        NdArrayDevice::Cpu
    }
}

pub use selected::device;

/// Backend used for evaluation.
pub type InferenceBackend = selected::Backend;

/// Backend used for training.
pub type TrainBackend = Autodiff<InferenceBackend>;
