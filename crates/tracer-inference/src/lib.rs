//! Inference driver for TRACER.
//!
//! [`TracerInference`] resizes and normalises an RGB image, runs the network
//! and turns the saliency map into a grayscale mask and an RGBA cutout at
//! the original resolution.

pub mod backend;
mod inference;
pub mod postprocessing;

pub use inference::{InferenceConfig, InferenceOutput, TracerInference};

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    pub type TestBackend = NdArray;
}
