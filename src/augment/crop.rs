use ndarray::s;
use rand::Rng;

use crate::errors::{HempSegError, Result};
use crate::sample::Sample;

/// Crops image and mask to the same `height` x `width` window starting at `(y, x)`.
pub fn crop_window(sample: Sample, y: usize, x: usize, height: usize, width: usize) -> Sample {
    let window = s![y..y + height, x..x + width, ..];
    Sample {
        image: sample.image.slice(window).to_owned(),
        mask: sample.mask.slice(window).to_owned(),
        path: sample.path,
    }
}

/// Crops image and mask jointly; one offset is drawn and used for both.
pub fn random_crop<R: Rng + ?Sized>(
    sample: Sample,
    height: usize,
    width: usize,
    rng: &mut R,
) -> Result<Sample> {
    let (h, w) = sample.spatial_dims();
    if h < height || w < width {
        return Err(HempSegError::validation(
            "random_crop",
            format!(
                "window {height}x{width} does not fit {h}x{w} sample {}",
                sample.path.display()
            ),
        ));
    }
    let y = rng.random_range(0..=h - height);
    let x = rng.random_range(0..=w - width);
    Ok(crop_window(sample, y, x, height, width))
}

/// Removes `border` pixels from every edge of image and mask.
pub fn central_crop(sample: Sample, border: usize) -> Result<Sample> {
    let (h, w) = sample.spatial_dims();
    if h <= 2 * border || w <= 2 * border {
        return Err(HempSegError::validation(
            "central_crop",
            format!(
                "border {border} leaves nothing of {h}x{w} sample {}",
                sample.path.display()
            ),
        ));
    }
    Ok(crop_window(
        sample,
        border,
        border,
        h - 2 * border,
        w - 2 * border,
    ))
}
