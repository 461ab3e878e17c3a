//! Backend chosen by the crate features: `cuda` wins over `wgpu`, and
//! `ndarray` runs on the CPU when neither GPU feature is enabled.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(feature = "cuda")] {
        pub type SelectedBackend = burn::backend::Cuda;

        /// Name reported in the driver logs.
        pub const BACKEND_NAME: &str = "CUDA (NVIDIA GPU)";
    } else if #[cfg(feature = "wgpu")] {
        pub type SelectedBackend = burn::backend::Wgpu;

        /// Name reported in the driver logs.
        pub const BACKEND_NAME: &str = "WGPU (GPU)";
    } else {
        pub type SelectedBackend = burn::backend::NdArray;

        /// Name reported in the driver logs.
        pub const BACKEND_NAME: &str = "NdArray (CPU)";
    }
}

/// Device type of [`SelectedBackend`].
pub type SelectedDevice = burn::prelude::Device<SelectedBackend>;

/// The default device of the selected backend.
pub fn create_device() -> SelectedDevice {
    SelectedDevice::default()
}
