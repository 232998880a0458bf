use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::errors::{HempSegError, Result};
use crate::sample::Sample;

/// Shifts every image value by one delta drawn from `[-max_delta, max_delta)`,
/// then clamps to `[0, 1]`. The mask is left alone.
pub fn random_brightness<R: Rng + ?Sized>(
    mut sample: Sample,
    max_delta: f32,
    rng: &mut R,
) -> Result<Sample> {
    if !max_delta.is_finite() || max_delta < 0.0 {
        return Err(HempSegError::validation(
            "brightness_delta",
            format!("must be finite and non-negative, got {max_delta}"),
        ));
    }
    if max_delta == 0.0 {
        return Ok(sample);
    }
    let delta = rng.random_range(-max_delta..max_delta);
    sample
        .image
        .mapv_inplace(|v| (v + delta).clamp(0.0, 1.0));
    Ok(sample)
}

/// With the given probability adds zero-mean gaussian noise to the image only,
/// then clamps to `[0, 1]`.
pub fn gaussian_noise<R: Rng + ?Sized>(
    mut sample: Sample,
    probability: f64,
    std_dev: f32,
    rng: &mut R,
) -> Result<Sample> {
    if !std_dev.is_finite() || std_dev < 0.0 {
        return Err(HempSegError::validation(
            "noise_std",
            format!("must be finite and non-negative, got {std_dev}"),
        ));
    }
    if !(0.0..=1.0).contains(&probability) {
        return Err(HempSegError::validation(
            "noise_probability",
            format!("must lie in [0, 1], got {probability}"),
        ));
    }
    if !rng.random_bool(probability) {
        return Ok(sample);
    }
    let normal = Normal::new(0.0f32, std_dev).map_err(|e| {
        HempSegError::validation("noise_std", format!("invalid std dev {std_dev}: {e}"))
    })?;
    sample
        .image
        .mapv_inplace(|v| (v + normal.sample(rng)).clamp(0.0, 1.0));
    Ok(sample)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use rand::{rngs::StdRng, SeedableRng};

    fn flat(value: f32) -> Sample {
        Sample::new(
            Array3::from_elem((6, 6, 3), value),
            Array3::from_elem((6, 6, 3), 0.5),
            "a.png",
        )
        .unwrap()
    }

    #[test]
    fn test_brightness_is_uniform_shift() {
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..20 {
            let out = random_brightness(flat(0.5), 0.2, &mut rng).unwrap();
            let first = out.image[[0, 0, 0]];
            assert!((0.3..0.7).contains(&first));
            assert!(out.image.iter().all(|&v| v == first));
            assert!(out.mask.iter().all(|&v| v == 0.5));
        }
    }

    #[test]
    fn test_brightness_clamps() {
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..20 {
            let bright = random_brightness(flat(1.0), 0.2, &mut rng).unwrap();
            assert!(bright.image.iter().all(|v| (0.8..=1.0).contains(v)));
            let dark = random_brightness(flat(0.0), 0.2, &mut rng).unwrap();
            assert!(dark.image.iter().all(|v| (0.0..=0.2).contains(v)));
        }
    }

    #[test]
    fn test_noise_only_touches_image() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(2);
        let out = gaussian_noise(flat(0.5), 1.0, 10.0 / 255.0, &mut rng)?;
        assert!(out.image.iter().any(|&v| v != 0.5));
        assert!(out.image.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(out.mask.iter().all(|&v| v == 0.5));
        Ok(())
    }

    #[test]
    fn test_noise_skipped_with_zero_probability() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(2);
        let out = gaussian_noise(flat(0.5), 0.0, 10.0 / 255.0, &mut rng)?;
        assert_eq!(out, flat(0.5));
        Ok(())
    }

    #[test]
    fn test_noise_rejects_bad_parameters() {
        let mut rng = StdRng::seed_from_u64(2);
        assert!(gaussian_noise(flat(0.5), 1.0, -1.0, &mut rng).is_err());
        assert!(gaussian_noise(flat(0.5), 1.0, f32::NAN, &mut rng).is_err());
        // checked even when the draw would skip the noise
        assert!(gaussian_noise(flat(0.5), 0.0, -1.0, &mut rng).is_err());
        assert!(gaussian_noise(flat(0.5), 1.5, 0.1, &mut rng).is_err());
    }

    #[test]
    fn test_brightness_rejects_bad_delta() {
        let mut rng = StdRng::seed_from_u64(2);
        assert!(random_brightness(flat(0.5), f32::NAN, &mut rng).is_err());
        assert!(random_brightness(flat(0.5), -0.2, &mut rng).is_err());
        assert_eq!(random_brightness(flat(0.5), 0.0, &mut rng).unwrap(), flat(0.5));
    }
}
