//! Utilities around the TRACER network: image conversion with ImageNet
//! normalisation, and reading checkpoints from disk.

pub mod image;
pub mod weights;

pub use self::image::{ImageError, ImageResult, ImageUtils, IMAGENET_MEAN, IMAGENET_STD};
pub use weights::*;

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    pub type TestBackend = NdArray;
}
