//! Per-sample augmentation.
//!
//! Every transform is a pure function of the incoming sample and the RNG it is
//! handed, so samples can be processed on any worker thread in any order.

mod color;
mod crop;
mod flip;

pub use color::{gaussian_noise, random_brightness};
pub use crop::{central_crop, crop_window, random_crop};
pub use flip::random_flip;

use rand::RngCore;

use crate::config::Config;
use crate::errors::Result;
use crate::sample::Sample;

#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    /// Joint crop of image and mask to a fixed window at a random offset.
    RandomCrop { height: usize, width: usize },
    /// Additive jitter in `[-max_delta, max_delta)` on the image only.
    RandomBrightness { max_delta: f32 },
    /// Independent left-right and up-down flips, each with probability 0.5.
    RandomFlip,
    GaussianNoise { probability: f64, std_dev: f32 },
    /// Deterministic removal of `border` pixels on every side.
    CentralCrop { border: usize },
}

impl Transform {
    pub fn apply(&self, sample: Sample, rng: &mut dyn RngCore) -> Result<Sample> {
        match *self {
            Transform::RandomCrop { height, width } => random_crop(sample, height, width, rng),
            Transform::RandomBrightness { max_delta } => random_brightness(sample, max_delta, rng),
            Transform::RandomFlip => Ok(random_flip(sample, rng)),
            Transform::GaussianNoise {
                probability,
                std_dev,
            } => gaussian_noise(sample, probability, std_dev, rng),
            Transform::CentralCrop { border } => central_crop(sample, border),
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Transform::RandomCrop { .. } => "random_crop",
            Transform::RandomBrightness { .. } => "random_brightness",
            Transform::RandomFlip => "random_flip",
            Transform::GaussianNoise { .. } => "gaussian_noise",
            Transform::CentralCrop { .. } => "central_crop",
        }
    }
}

/// Ordered transform list applied after decoding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformPipeline {
    steps: Vec<Transform>,
}

impl TransformPipeline {
    pub fn new(steps: Vec<Transform>) -> Self {
        Self { steps }
    }

    /// crop → brightness → flip → noise
    pub fn train(config: &Config) -> Self {
        Self::new(vec![
            Transform::RandomCrop {
                height: config.image_height,
                width: config.image_width,
            },
            Transform::RandomBrightness {
                max_delta: config.brightness_delta,
            },
            Transform::RandomFlip,
            Transform::GaussianNoise {
                probability: config.noise_probability,
                std_dev: config.noise_std,
            },
        ])
    }

    pub fn validation(config: &Config) -> Self {
        Self::new(vec![Transform::CentralCrop {
            border: config.central_crop_border,
        }])
    }

    pub fn test() -> Self {
        Self::default()
    }

    pub fn steps(&self) -> &[Transform] {
        &self.steps
    }

    pub fn apply(&self, sample: Sample, rng: &mut dyn RngCore) -> Result<Sample> {
        self.steps
            .iter()
            .try_fold(sample, |sample, step| step.apply(sample, rng))
    }

    pub fn describe(&self) -> String {
        if self.steps.is_empty() {
            return "decode".to_string();
        }
        let names: Vec<_> = self.steps.iter().map(Transform::name).collect();
        format!("decode -> {}", names.join(" -> "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_split_orders() {
        let config = Config::default();
        assert_eq!(
            TransformPipeline::train(&config).describe(),
            "decode -> random_crop -> random_brightness -> random_flip -> gaussian_noise"
        );
        assert_eq!(
            TransformPipeline::validation(&config).describe(),
            "decode -> central_crop"
        );
        assert_eq!(TransformPipeline::test().describe(), "decode");
    }

    #[test]
    fn test_train_pipeline_output_size() -> Result<()> {
        let config = Config::default().with_image_size(16, 12);
        let sample = Sample::new(
            Array3::from_elem((40, 30, 3), 0.5),
            Array3::from_elem((40, 30, 3), 1.0),
            "field.png",
        )?;
        let mut rng = StdRng::seed_from_u64(3);
        let out = TransformPipeline::train(&config).apply(sample, &mut rng)?;
        assert_eq!(out.image.dim(), (16, 12, 3));
        assert_eq!(out.mask.dim(), (16, 12, 3));
        assert!(out.image.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(out.mask.iter().all(|&v| v == 1.0));
        Ok(())
    }

    #[test]
    fn test_empty_pipeline_is_identity() -> Result<()> {
        let sample = Sample::new(
            Array3::from_elem((4, 4, 3), 0.3),
            Array3::zeros((4, 4, 3)),
            "a.png",
        )?;
        let mut rng = StdRng::seed_from_u64(0);
        let out = TransformPipeline::test().apply(sample.clone(), &mut rng)?;
        assert_eq!(out, sample);
        Ok(())
    }
}
