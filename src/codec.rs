use std::fs;
use std::path::Path;

use image::RgbImage;
use ndarray::prelude::*;
use nshare::AsNdarray3;

use crate::errors::{HempSegError, Result};
use crate::sample::Sample;

/// Decodes an encoded image into an `[H, W, 3]` array scaled to `[0, 1]`.
///
/// Grayscale and alpha inputs are converted to three channels.
pub fn decode_image(bytes: &[u8]) -> Result<Array3<f32>> {
    decode_with_context(bytes, "<memory>")
}

fn decode_with_context(bytes: &[u8], origin: &str) -> Result<Array3<f32>> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| HempSegError::ImageProcessing {
            path: origin.to_string(),
            operation: "image decode".to_string(),
            source: Box::new(e),
        })?
        .into_rgb8();
    Ok(rgb_to_array(&image))
}

pub fn rgb_to_array(image: &RgbImage) -> Array3<f32> {
    image
        .as_ndarray3()
        .permuted_axes([1, 2, 0])
        .mapv(|v| f32::from(v) / 255.0)
        .as_standard_layout()
        .into_owned()
}

/// Reads and decodes an image/mask pair. The sample keeps the image path.
pub fn read_sample(image_path: &Path, mask_path: &Path) -> Result<Sample> {
    let image = read_image(image_path)?;
    let mask = read_image(mask_path)?;
    Sample::new(image, mask, image_path)
}

/// Reads and decodes one image file.
pub fn read_image(path: &Path) -> Result<Array3<f32>> {
    let bytes = fs::read(path).map_err(|e| HempSegError::FileSystem {
        path: path.to_path_buf(),
        operation: "read image file".to_string(),
        source: e,
    })?;
    decode_with_context(&bytes, &path.display().to_string())
}

/// Quantizes an `[H, W, 3]` array in `[0, 1]` back to 8-bit RGB.
pub fn to_rgb_image(array: ArrayView3<f32>) -> Result<RgbImage> {
    let (h, w, c) = array.dim();
    if c != 3 {
        return Err(HempSegError::validation(
            "array",
            format!("needs 3 channels to become RGB, got {c}"),
        ));
    }
    let raw: Vec<u8> = array
        .iter()
        .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
        .collect();
    RgbImage::from_raw(w as u32, h as u32, raw)
        .ok_or_else(|| HempSegError::validation("array", "does not fit an RGB buffer"))
}
