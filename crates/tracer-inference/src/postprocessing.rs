//! Turning the saliency mask into an alpha-matted cutout.

use anyhow::{ensure, Result};
use image::{GrayImage, Rgba, RgbaImage, RgbImage};

/// Alpha for one mask value: transparent at or below `threshold`, opaque above.
pub const fn cutout_alpha(mask: u8, threshold: u8) -> u8 {
    if mask <= threshold {
        0
    } else {
        u8::MAX
    }
}

/// Combines an RGB image with a mask of the same size into an RGBA cutout.
///
/// # Errors
///
/// Returns an error if the image and the mask differ in size.
pub fn cutout(image: &RgbImage, mask: &GrayImage, threshold: u8) -> Result<RgbaImage> {
    ensure!(
        image.dimensions() == mask.dimensions(),
        "image is {:?} but mask is {:?}",
        image.dimensions(),
        mask.dimensions()
    );

    Ok(RgbaImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b] = image.get_pixel(x, y).0;
        let alpha = cutout_alpha(mask.get_pixel(x, y).0[0], threshold);
        Rgba([r, g, b, alpha])
    }))
}
