use crate::backbone::BackboneCatalog;
use crate::errors::{HempSegError, Result};
use crate::losses::FScoreConfig;

/// Pipeline-wide settings.
///
/// Built once and handed to the dataset, model and metric builders. Nothing in the
/// crate reads these values from global state.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub image_height: usize,
    pub image_width: usize,
    pub batch_size: usize,
    pub epochs: usize,
    /// Worker threads used to decode and augment samples.
    pub parallel_calls: usize,
    /// Capacity of the training shuffle buffer.
    pub buffer_size: usize,
    pub smooth: f64,
    /// Channel holding the background class in the masks.
    pub background_channel: usize,
    pub train_fraction: f64,
    pub seed: u64,
    pub brightness_delta: f32,
    pub noise_probability: f64,
    pub noise_std: f32,
    pub central_crop_border: usize,
    pub backbones: BackboneCatalog,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            image_height: 384,
            image_width: 384,
            batch_size: 4,
            epochs: 50,
            parallel_calls: 4,
            buffer_size: 400,
            smooth: 1e-5,
            background_channel: 2,
            train_fraction: 0.8,
            seed: 1,
            brightness_delta: 0.2,
            noise_probability: 0.5,
            noise_std: 10.0 / 255.0,
            central_crop_border: 64,
            backbones: BackboneCatalog::default(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image_size(mut self, height: usize, width: usize) -> Self {
        self.image_height = height;
        self.image_width = width;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_parallel_calls(mut self, parallel_calls: usize) -> Self {
        self.parallel_calls = parallel_calls;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_train_fraction(mut self, train_fraction: f64) -> Self {
        self.train_fraction = train_fraction;
        self
    }

    pub fn with_brightness_delta(mut self, delta: f32) -> Self {
        self.brightness_delta = delta;
        self
    }

    pub fn with_noise_std(mut self, std_dev: f32) -> Self {
        self.noise_std = std_dev;
        self
    }

    /// F-score settings carrying this run's smoothing constant.
    pub fn fscore(&self) -> FScoreConfig {
        FScoreConfig::new().with_smooth(self.smooth)
    }

    pub fn with_central_crop_border(mut self, border: usize) -> Self {
        self.central_crop_border = border;
        self
    }

    /// Rejects values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.image_height == 0 || self.image_width == 0 {
            return Err(HempSegError::validation(
                "image_size",
                "must be non-zero in both dimensions",
            ));
        }
        if self.batch_size == 0 {
            return Err(HempSegError::validation("batch_size", "must be at least 1"));
        }
        if self.parallel_calls == 0 {
            return Err(HempSegError::validation(
                "parallel_calls",
                "must be at least 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.train_fraction) {
            return Err(HempSegError::validation(
                "train_fraction",
                format!("must lie in [0, 1], got {}", self.train_fraction),
            ));
        }
        if !(0.0..=1.0).contains(&self.noise_probability) {
            return Err(HempSegError::validation(
                "noise_probability",
                format!("must lie in [0, 1], got {}", self.noise_probability),
            ));
        }
        for (field, value) in [
            ("brightness_delta", self.brightness_delta),
            ("noise_std", self.noise_std),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(HempSegError::validation(
                    field,
                    format!("must be finite and non-negative, got {value}"),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_training_setup() {
        let config = Config::default();
        assert_eq!((config.image_height, config.image_width), (384, 384));
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.epochs, 50);
        assert_eq!(config.parallel_calls, 4);
        assert_eq!(config.buffer_size, 400);
        assert_eq!(config.smooth, 1e-5);
        assert_eq!(config.backbones.names().len(), 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_augmentation_values_rejected() {
        assert!(Config::default().with_brightness_delta(f32::NAN).validate().is_err());
        assert!(Config::default().with_noise_std(-0.1).validate().is_err());
        assert!(Config::default().with_train_fraction(1.5).validate().is_err());
    }

    #[test]
    fn test_fscore_uses_configured_smoothing() {
        let mut config = Config::default();
        assert_eq!(config.fscore().smooth, 1e-5);
        config.smooth = 1.0;
        assert_eq!(config.fscore().smooth, 1.0);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let config = Config::default().with_batch_size(0);
        assert!(matches!(
            config.validate(),
            Err(HempSegError::Validation { .. })
        ));
    }
}
