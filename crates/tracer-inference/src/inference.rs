use std::path::Path;

use anyhow::{ensure, Context, Result};
use burn::prelude::*;
use image::{GrayImage, RgbImage, RgbaImage};
use tracer_extra_ops::resize_bilinear;
use tracer_model::{ModelShape, Tracer, TracerConfig};
use tracer_util::{load_checkpoint, ImageUtils};
use tracing::{debug, info};

use crate::{
    backend::{create_device, SelectedBackend, BACKEND_NAME},
    postprocessing,
};

/// Network input sides must be multiples of the encoder stride.
const INPUT_MULTIPLE: usize = 32;

/// Options of the inference driver.
#[derive(Config, Debug)]
pub struct InferenceConfig {
    /// Architecture index in `0..=7`.
    #[config(default = "7")]
    pub arch: usize,
    #[config(default = "16.0")]
    pub frequency_radius: f64,
    #[config(default = "0.93")]
    pub denoise: f64,
    /// Confidence ratio of the union attention gates.
    #[config(default = "0.1")]
    pub gamma: f64,
    /// Square side the image is resized to before the forward pass. Defaults
    /// to the resolution the architecture was trained at.
    pub input_size: Option<usize>,
    /// Mask values at or below this become transparent in the cutout.
    #[config(default = "200")]
    pub cutout_threshold: u8,
}

impl InferenceConfig {
    pub fn tracer_config(&self) -> TracerConfig {
        TracerConfig::new()
            .with_arch(self.arch)
            .with_frequency_radius(self.frequency_radius)
            .with_denoise(self.denoise)
            .with_gamma(self.gamma)
    }

    /// The preprocessing resolution: the override if set, otherwise the
    /// architecture's own.
    pub fn resolved_input_size(&self) -> Result<usize> {
        match self.input_size {
            Some(size) => Ok(size),
            None => Ok(ModelShape::for_arch(self.arch)?.input_size),
        }
    }
}

/// Result of running the driver on one image, both at the image's own size.
#[derive(Debug, Clone)]
pub struct InferenceOutput {
    /// `floor(255 · saliency)`.
    pub mask: GrayImage,
    /// The image with alpha 0 wherever the mask is at or below the threshold.
    pub cutout: RgbaImage,
}

/// A TRACER network together with its preprocessing and post-processing.
pub struct TracerInference<B: Backend> {
    model: Tracer<B>,
    device: B::Device,
    input_size: usize,
    cutout_threshold: u8,
}

impl<B: Backend> TracerInference<B> {
    /// Builds the network with freshly initialised parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the input size is
    /// not a positive multiple of 32.
    pub fn new(config: &InferenceConfig, device: &B::Device) -> Result<Self> {
        let input_size = config.resolved_input_size()?;
        ensure!(
            input_size > 0 && input_size % INPUT_MULTIPLE == 0,
            "input size {input_size} must be a positive multiple of {INPUT_MULTIPLE}"
        );

        let model = config
            .tracer_config()
            .init(device)
            .context("failed to build TRACER")?;
        info!(arch = config.arch, input_size, "inference driver ready");

        Ok(Self {
            model,
            device: device.clone(),
            input_size,
            cutout_threshold: config.cutout_threshold,
        })
    }

    /// Builds the network and loads a checkpoint (`.pth`, `.pt`, `.bin`,
    /// `.safetensors` or `.mpk`).
    pub fn from_checkpoint(
        config: &InferenceConfig,
        path: impl AsRef<Path>,
        device: &B::Device,
    ) -> Result<Self> {
        let path = path.as_ref();
        let mut driver = Self::new(config, device)?;

        info!(path = %path.display(), "loading checkpoint");
        driver.model = load_checkpoint::<B, _>(driver.model, path, device)
            .with_context(|| format!("failed to load checkpoint {}", path.display()))?;

        Ok(driver)
    }

    pub const fn input_size(&self) -> usize {
        self.input_size
    }

    pub const fn model(&self) -> &Tracer<B> {
        &self.model
    }

    /// Produces the saliency mask and cutout for one image.
    pub fn run(&self, image: &RgbImage) -> Result<InferenceOutput> {
        let (width, height) = image.dimensions();
        ensure!(width > 0 && height > 0, "image is empty");
        let size = [height as usize, width as usize];

        let x = ImageUtils::preprocess::<B>(image, self.input_size, &self.device)?;
        let output = self.model.forward(x.clone())?;
        debug!(saliency = ?output.saliency.dims(), original = ?size, "forward done");

        let saliency = resize_bilinear(output.saliency, size, false);
        let mask = ImageUtils::tensor_to_gray(saliency)?;

        let restored = resize_bilinear(ImageUtils::denormalize(x), size, false);
        let rgb = ImageUtils::tensor_to_rgb(restored)?;
        let cutout = postprocessing::cutout(&rgb, &mask, self.cutout_threshold)?;

        Ok(InferenceOutput { mask, cutout })
    }

    /// Opens an image file and runs [`TracerInference::run`] on it.
    pub fn run_path(&self, path: impl AsRef<Path>) -> Result<InferenceOutput> {
        let path = path.as_ref();
        info!(path = %path.display(), "processing image");

        let image = ImageUtils::open_rgb(path)?;
        self.run(&image)
    }
}

impl TracerInference<SelectedBackend> {
    /// Builds the driver on the default device of the feature-selected backend.
    pub fn on_selected_backend(config: &InferenceConfig) -> Result<Self> {
        info!(backend = BACKEND_NAME, "selected backend");
        Self::new(config, &create_device())
    }
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;
    use crate::tests::TestBackend;

    fn small_config() -> InferenceConfig {
        InferenceConfig::new().with_arch(0).with_input_size(Some(64))
    }

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 3) as u8, (y * 5) as u8, ((x + y) * 2) as u8])
        })
    }

    #[test]
    fn default_input_size_follows_arch() {
        assert_eq!(InferenceConfig::new().resolved_input_size().unwrap(), 640);
        assert_eq!(
            InferenceConfig::new()
                .with_arch(2)
                .resolved_input_size()
                .unwrap(),
            352
        );
        assert!(InferenceConfig::new()
            .with_arch(9)
            .resolved_input_size()
            .is_err());
    }

    #[test]
    fn input_size_must_be_a_multiple_of_32() {
        let device = Default::default();
        let config = InferenceConfig::new().with_arch(0).with_input_size(Some(100));

        assert!(TracerInference::<TestBackend>::new(&config, &device).is_err());
    }

    #[test]
    fn outputs_have_original_resolution() {
        let device = Default::default();
        let driver = TracerInference::<TestBackend>::new(&small_config(), &device).unwrap();

        let output = driver.run(&gradient(70, 50)).unwrap();

        assert_eq!(output.mask.dimensions(), (70, 50));
        assert_eq!(output.cutout.dimensions(), (70, 50));
    }

    #[test]
    fn cutout_alpha_follows_mask() {
        let device = Default::default();
        let driver = TracerInference::<TestBackend>::new(&small_config(), &device).unwrap();

        let output = driver.run(&gradient(40, 30)).unwrap();

        for (mask, pixel) in output.mask.pixels().zip(output.cutout.pixels()) {
            let expected = if mask.0[0] <= 200 { 0 } else { 255 };
            assert_eq!(pixel.0[3], expected);
        }
    }

    #[test]
    fn runs_are_deterministic() {
        let device = Default::default();
        let driver = TracerInference::<TestBackend>::new(&small_config(), &device).unwrap();
        let image = gradient(64, 48);

        let a = driver.run(&image).unwrap();
        let b = driver.run(&image).unwrap();

        assert_eq!(a.mask, b.mask);
        assert_eq!(a.cutout, b.cutout);
    }

    #[test]
    fn cutout_colours_approximate_the_input() {
        let device = Default::default();
        let driver = TracerInference::<TestBackend>::new(&small_config(), &device).unwrap();
        let image = RgbImage::from_pixel(64, 64, Rgb([200, 100, 30]));

        let output = driver.run(&image).unwrap();

        for pixel in output.cutout.pixels() {
            let [r, g, b, _] = pixel.0;
            assert!(r.abs_diff(200) <= 1 && g.abs_diff(100) <= 1 && b.abs_diff(30) <= 1);
        }
    }

    #[test]
    fn selected_backend_builds_driver() {
        let driver = TracerInference::on_selected_backend(&small_config()).unwrap();

        assert_eq!(driver.input_size(), 64);
    }

    #[test]
    #[ignore = "runs b0 at its full 320 resolution"]
    fn uniform_gray_at_320_is_reproducible() {
        let device = Default::default();
        TestBackend::seed(7);
        let config = InferenceConfig::new().with_arch(0);
        let driver = TracerInference::<TestBackend>::new(&config, &device).unwrap();
        let image = RgbImage::from_pixel(320, 320, Rgb([128, 128, 128]));

        let first = driver.run(&image).unwrap();
        let second = driver.run(&image).unwrap();

        assert_eq!(driver.input_size(), 320);
        assert_eq!(first.mask.dimensions(), (320, 320));
        assert_eq!(first.mask.as_raw(), second.mask.as_raw());
        assert_eq!(first.cutout.as_raw(), second.cutout.as_raw());

        // At the network resolution the mask is the truncated saliency itself.
        let x = ImageUtils::preprocess::<TestBackend>(&image, 320, &device).unwrap();
        let saliency = driver.model().forward(x).unwrap().saliency;
        let expected = ImageUtils::tensor_to_gray(saliency).unwrap();
        assert_eq!(first.mask, expected);
    }

    #[test]
    #[ignore = "builds the largest architecture at full resolution"]
    fn full_size_arch_7() {
        let device = Default::default();
        let driver =
            TracerInference::<TestBackend>::new(&InferenceConfig::new(), &device).unwrap();

        let output = driver.run(&gradient(80, 60)).unwrap();

        assert_eq!(output.mask.dimensions(), (80, 60));
    }
}
