//! Image processing utilities: u8 images to normalised network input and
//! network output back to u8 buffers.

use std::path::Path;

use burn::tensor::{backend::Backend, DType, Tensor, TensorData};
use image::{GrayImage, RgbImage};
use thiserror::Error;
use tracer_extra_ops::resize_bilinear;

/// Per-channel mean of the ImageNet training set.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// Per-channel standard deviation of the ImageNet training set.
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// ImageError covers all possible errors in image processing operations
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("failed to open image at '{path}': {source}")]
    ImageLoadError {
        path: String,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to convert tensor to data: {reason}")]
    TensorConversionError { reason: String },

    #[error("failed to create image buffer: {reason}")]
    BufferCreationError { reason: String },

    #[error("batch size mismatch: expected 1, got {actual}")]
    InvalidBatchSize { actual: usize },

    #[error("invalid channel count: expected {expected}, got {actual}")]
    InvalidChannelCount { expected: usize, actual: usize },

    #[error("invalid target size {size}: must be positive")]
    InvalidSize { size: usize },
}

/// Result type alias for ImageError
pub type ImageResult<T> = Result<T, ImageError>;

/// Conversions between `image` buffers and `[batch, channels, height, width]` tensors.
pub struct ImageUtils;

impl ImageUtils {
    /// Opens an image file and converts it to 8-bit RGB.
    pub fn open_rgb<P: AsRef<Path>>(path: P) -> ImageResult<RgbImage> {
        let path_str = path.as_ref().display().to_string();
        let img = image::open(&path).map_err(|source| ImageError::ImageLoadError {
            path: path_str,
            source,
        })?;

        Ok(img.into_rgb8())
    }

    /// Converts an RGB image to a tensor with values in `[0, 1]`.
    ///
    /// # Shapes
    /// * output: `[1, 3, height, width]`
    pub fn rgb_to_tensor<B: Backend>(image: &RgbImage, device: &B::Device) -> Tensor<B, 4> {
        let (width, height) = image.dimensions();
        let buf: Vec<f32> = image.as_raw().iter().map(|&v| v as f32 / 255.0).collect();

        let data = TensorData::new(buf, [height as usize, width as usize, 3]);
        let tensor = Tensor::<B, 3>::from_data(data, device);

        tensor.permute([2, 0, 1]).unsqueeze::<4>()
    }

    /// Scales to `[0, 1]`, resizes to `size × size` and applies ImageNet
    /// normalisation.
    ///
    /// The resize is two-tap bilinear on half-pixel centres without
    /// antialiasing, the OpenCV `INTER_LINEAR` grid the checkpoints were
    /// trained with.
    ///
    /// # Shapes
    /// * output: `[1, 3, size, size]`
    pub fn preprocess<B: Backend>(
        image: &RgbImage,
        size: usize,
        device: &B::Device,
    ) -> ImageResult<Tensor<B, 4>> {
        if size == 0 {
            return Err(ImageError::InvalidSize { size });
        }
        let x = Self::rgb_to_tensor(image, device);

        Ok(Self::normalize(resize_bilinear(x, [size, size], false)))
    }

    /// `(x - mean) / std` per channel.
    pub fn normalize<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
        let (mean, std) = Self::statistics::<B>(&x.device());
        (x - mean) / std
    }

    /// Inverse of [`ImageUtils::normalize`].
    pub fn denormalize<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
        let (mean, std) = Self::statistics::<B>(&x.device());
        x * std + mean
    }

    fn statistics<B: Backend>(device: &B::Device) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let mean = Tensor::<B, 1>::from_floats(IMAGENET_MEAN, device).reshape([1, 3, 1, 1]);
        let std = Tensor::<B, 1>::from_floats(IMAGENET_STD, device).reshape([1, 3, 1, 1]);
        (mean, std)
    }

    /// Converts a single-channel map in `[0, 1]` to a grayscale image as
    /// `floor(255 · v)`. Values outside the range are clamped first.
    ///
    /// Truncation is intentional: it matches a plain `u8` cast of the scaled
    /// map, so do not round here.
    pub fn tensor_to_gray<B: Backend>(tensor: Tensor<B, 4>) -> ImageResult<GrayImage> {
        let (width, height, buf) = Self::tensor_to_bytes(tensor, 1)?;

        GrayImage::from_raw(width, height, buf).ok_or_else(|| ImageError::BufferCreationError {
            reason: "Failed to create grayscale image buffer".to_string(),
        })
    }

    /// Converts a three-channel tensor in `[0, 1]` to an RGB image, clamping
    /// and truncating like [`ImageUtils::tensor_to_gray`].
    pub fn tensor_to_rgb<B: Backend>(tensor: Tensor<B, 4>) -> ImageResult<RgbImage> {
        let (width, height, buf) = Self::tensor_to_bytes(tensor, 3)?;

        RgbImage::from_raw(width, height, buf).ok_or_else(|| ImageError::BufferCreationError {
            reason: "Failed to create RGB image buffer".to_string(),
        })
    }

    fn tensor_to_bytes<B: Backend>(
        tensor: Tensor<B, 4>,
        expected_channels: usize,
    ) -> ImageResult<(u32, u32, Vec<u8>)> {
        let [batch, channels, height, width] = tensor.dims();

        if batch != 1 {
            return Err(ImageError::InvalidBatchSize { actual: batch });
        }
        if channels != expected_channels {
            return Err(ImageError::InvalidChannelCount {
                expected: expected_channels,
                actual: channels,
            });
        }

        // Remove batch dimension and permute to HWC
        let data = tensor
            .squeeze::<3>(0)
            .permute([1, 2, 0])
            .into_data()
            .convert_dtype(DType::F32)
            .to_vec::<f32>()
            .map_err(|e| ImageError::TensorConversionError {
                reason: format!("{:?}", e),
            })?;

        let buf = data
            .into_iter()
            .map(|v| (v.clamp(0.0, 1.0) * 255.0).floor() as u8)
            .collect();

        Ok((width as u32, height as u32, buf))
    }
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;
    use crate::tests::TestBackend;

    #[test]
    fn preprocess_resizes_and_normalizes() {
        let device = Default::default();
        let mean = IMAGENET_MEAN.map(|v| (v * 255.0).round() as u8);
        let image = RgbImage::from_pixel(40, 24, Rgb(mean));

        let x = ImageUtils::preprocess::<TestBackend>(&image, 32, &device).unwrap();

        assert_eq!(x.dims(), [1, 3, 32, 32]);
        let values = x.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| v.abs() < 0.01));
    }

    #[test]
    fn downscale_samples_without_antialiasing() {
        let device = Default::default();
        let image = RgbImage::from_fn(8, 8, |x, _| {
            if x < 4 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });

        let x = ImageUtils::preprocess::<TestBackend>(&image, 2, &device).unwrap();
        let restored = ImageUtils::denormalize(x)
            .into_data()
            .to_vec::<f32>()
            .unwrap();

        let expected = [0.0, 1.0, 0.0, 1.0];
        for channel in restored.chunks_exact(4) {
            for (actual, expected) in channel.iter().zip(expected) {
                assert!(
                    (actual - expected).abs() < 1e-5,
                    "expected {expected}, got {channel:?}"
                );
            }
        }
    }

    #[test]
    fn zero_size_is_rejected() {
        let device = Default::default();
        let image = RgbImage::new(4, 4);

        let result = ImageUtils::preprocess::<TestBackend>(&image, 0, &device);

        assert!(matches!(result, Err(ImageError::InvalidSize { size: 0 })));
    }

    #[test]
    fn denormalize_inverts_normalize() {
        let device = Default::default();
        let image = RgbImage::from_fn(3, 2, |x, y| Rgb([x as u8 * 80, y as u8 * 200, 17]));
        let x = ImageUtils::rgb_to_tensor::<TestBackend>(&image, &device);

        let restored = ImageUtils::denormalize(ImageUtils::normalize(x.clone()));

        let a = x.into_data().to_vec::<f32>().unwrap();
        let b = restored.into_data().to_vec::<f32>().unwrap();
        for (a, b) in a.iter().zip(b.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn rgb_tensor_layout_is_channel_first() {
        let device = Default::default();
        let image = RgbImage::from_fn(2, 1, |x, _| {
            if x == 0 {
                Rgb([255, 0, 0])
            } else {
                Rgb([0, 0, 255])
            }
        });

        let x = ImageUtils::rgb_to_tensor::<TestBackend>(&image, &device);

        assert_eq!(x.dims(), [1, 3, 1, 2]);
        assert_eq!(
            x.into_data().to_vec::<f32>().unwrap(),
            vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0]
        );
    }

    #[test]
    fn gray_conversion_truncates_and_clamps() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::from_floats([[[[0.999, 0.5, -0.2, 1.7]]]], &device);

        let gray = ImageUtils::tensor_to_gray(x).unwrap();

        assert_eq!(gray.dimensions(), (4, 1));
        assert_eq!(gray.into_raw(), vec![254, 127, 0, 255]);
    }

    #[test]
    fn round_trip_through_rgb_image() {
        let device = Default::default();
        let image = RgbImage::from_fn(5, 3, |x, y| Rgb([x as u8 * 50, y as u8 * 100, 255]));

        let restored =
            ImageUtils::tensor_to_rgb(ImageUtils::rgb_to_tensor::<TestBackend>(&image, &device))
                .unwrap();

        // Truncation after division by 255 may lose one step.
        for (a, b) in image.as_raw().iter().zip(restored.as_raw().iter()) {
            assert!(a.abs_diff(*b) <= 1);
        }
    }

    #[test]
    fn conversion_rejects_batches_and_wrong_channels() {
        let device = Default::default();

        let batch = Tensor::<TestBackend, 4>::zeros([2, 1, 4, 4], &device);
        assert!(matches!(
            ImageUtils::tensor_to_gray(batch),
            Err(ImageError::InvalidBatchSize { actual: 2 })
        ));

        let rgb = Tensor::<TestBackend, 4>::zeros([1, 3, 4, 4], &device);
        assert!(matches!(
            ImageUtils::tensor_to_gray(rgb),
            Err(ImageError::InvalidChannelCount {
                expected: 1,
                actual: 3
            })
        ));
    }
}
