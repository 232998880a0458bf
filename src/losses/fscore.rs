use burn::prelude::*;

use super::{
    average, check_shapes, gather_channels, reduce_sum, round_if_needed, CategoricalCrossEntropy,
    CategoricalCrossEntropyConfig,
};
use crate::errors;

#[derive(Config, Debug)]
pub struct FScoreConfig {
    /// Weight of recall against precision.
    #[config(default = 1.0)]
    pub beta: f64,
    #[config(default = 1e-5)]
    pub smooth: f64,
    #[config(default = false)]
    pub per_image: bool,
    /// Binarise predictions at this value before scoring.
    pub threshold: Option<f64>,
    pub class_weights: Option<Vec<f32>>,
    pub class_indexes: Option<Vec<usize>>,
}

impl FScoreConfig {
    pub fn init(&self) -> FScore {
        FScore {
            config: self.clone(),
        }
    }
}

/// F-beta score between ground truth and predicted probabilities, in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct FScore {
    config: FScoreConfig,
}

impl FScore {
    pub fn forward<B: Backend>(
        &self,
        gt: Tensor<B, 4>,
        pr: Tensor<B, 4>,
    ) -> errors::Result<Tensor<B, 1>> {
        check_shapes(&gt, &pr)?;
        let config = &self.config;
        let gt = gather_channels(gt, config.class_indexes.as_deref())?;
        let pr = gather_channels(pr, config.class_indexes.as_deref())?;
        let pr = round_if_needed(pr, config.threshold);

        let tp = reduce_sum(gt.clone() * pr.clone(), config.per_image);
        let fp = reduce_sum(pr, config.per_image) - tp.clone();
        let fn_ = reduce_sum(gt, config.per_image) - tp.clone();

        let beta2 = config.beta * config.beta;
        let numerator = tp.clone().mul_scalar(1.0 + beta2).add_scalar(config.smooth);
        let denominator = tp
            .mul_scalar(1.0 + beta2)
            .add(fn_.mul_scalar(beta2))
            .add(fp)
            .add_scalar(config.smooth);

        average(
            numerator / denominator,
            config.per_image,
            config.class_weights.as_deref(),
        )
    }
}

/// `1 - F1` with the background class weighted double.
#[derive(Debug, Clone)]
pub struct DiceLoss {
    score: FScore,
}

impl Default for DiceLoss {
    fn default() -> Self {
        Self::new(Some(vec![0.5, 0.5, 1.0]))
    }
}

impl DiceLoss {
    pub fn new(class_weights: Option<Vec<f32>>) -> Self {
        let score = FScoreConfig::new()
            .with_smooth(1.0)
            .with_class_weights(class_weights)
            .init();
        Self { score }
    }

    pub fn forward<B: Backend>(
        &self,
        gt: Tensor<B, 4>,
        pr: Tensor<B, 4>,
    ) -> errors::Result<Tensor<B, 1>> {
        Ok(self.score.forward(gt, pr)?.neg().add_scalar(1.0))
    }
}

#[derive(Config, Debug)]
pub struct DiceCceLossConfig {
    #[config(default = 1.0)]
    pub dice_weight: f64,
    #[config(default = 1.0)]
    pub cce_weight: f64,
}

impl DiceCceLossConfig {
    pub fn init(&self) -> DiceCceLoss {
        DiceCceLoss {
            dice: DiceLoss::default(),
            cce: CategoricalCrossEntropyConfig::new().init(),
            dice_weight: self.dice_weight,
            cce_weight: self.cce_weight,
        }
    }
}

/// Weighted sum of [`DiceLoss`] and [`CategoricalCrossEntropy`].
#[derive(Debug, Clone)]
pub struct DiceCceLoss {
    dice: DiceLoss,
    cce: CategoricalCrossEntropy,
    dice_weight: f64,
    cce_weight: f64,
}

impl DiceCceLoss {
    pub fn forward<B: Backend>(
        &self,
        gt: Tensor<B, 4>,
        pr: Tensor<B, 4>,
    ) -> errors::Result<Tensor<B, 1>> {
        let dice = self.dice.forward(gt.clone(), pr.clone())?;
        let cce = self.cce.forward(gt, pr)?;
        Ok(dice.mul_scalar(self.dice_weight) + cce.mul_scalar(self.cce_weight))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::*;
    use crate::errors::Result;

    #[test]
    fn test_perfect_prediction_scores_one() -> Result<()> {
        let gt = maps(&[&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0], &[0.0, 0.0, 1.0]]);
        let score = scalar(FScoreConfig::new().init().forward(gt.clone(), gt.clone())?);
        assert!((score - 1.0).abs() < 1e-4);
        let loss = scalar(DiceLoss::new(None).forward(gt.clone(), gt)?);
        assert!(loss.abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_invariant_to_channel_permutation() -> Result<()> {
        let gt = maps(&[&[1.0, 0.0, 0.0, 1.0], &[0.0, 1.0, 0.0, 0.0], &[0.0, 0.0, 1.0, 0.0]]);
        let pr = maps(&[&[0.7, 0.2, 0.1, 0.4], &[0.2, 0.5, 0.3, 0.5], &[0.1, 0.3, 0.6, 0.1]]);
        let gt_perm = maps(&[&[0.0, 0.0, 1.0, 0.0], &[1.0, 0.0, 0.0, 1.0], &[0.0, 1.0, 0.0, 0.0]]);
        let pr_perm = maps(&[&[0.1, 0.3, 0.6, 0.1], &[0.7, 0.2, 0.1, 0.4], &[0.2, 0.5, 0.3, 0.5]]);

        let score = FScoreConfig::new().init();
        let a = scalar(score.forward(gt.clone(), pr.clone())?);
        let b = scalar(score.forward(gt_perm.clone(), pr_perm.clone())?);
        assert!((a - b).abs() < 1e-6);

        let dice = DiceLoss::new(None);
        let a = scalar(dice.forward(gt, pr)?);
        let b = scalar(dice.forward(gt_perm, pr_perm)?);
        assert!((a - b).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_threshold_binarises() -> Result<()> {
        let gt = maps(&[&[1.0, 0.0]]);
        let pr = maps(&[&[0.9, 0.1]]);
        let score = FScoreConfig::new().with_threshold(Some(0.5)).init();
        assert!((scalar(score.forward(gt, pr)?) - 1.0).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_config_json_keeps_optional_fields() {
        let config = FScoreConfig::new()
            .with_threshold(Some(0.5))
            .with_class_weights(Some(vec![1.0, 2.0]));
        let json = burn::config::config_to_json(&config);
        let loaded = FScoreConfig::load_binary(json.as_bytes()).unwrap();
        assert_eq!(loaded.threshold, Some(0.5));
        assert_eq!(loaded.class_weights, Some(vec![1.0, 2.0]));
        assert_eq!(loaded.class_indexes, None);
    }

    #[test]
    fn test_class_weight_count_checked() {
        let gt = maps(&[&[1.0], &[0.0]]);
        // default dice weights expect three classes
        assert!(DiceLoss::default().forward(gt.clone(), gt).is_err());
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let gt = maps(&[&[1.0, 0.0]]);
        let pr = maps(&[&[1.0], &[0.0]]);
        assert!(FScoreConfig::new().init().forward(gt, pr).is_err());
    }

    #[test]
    fn test_dice_cce_is_weighted_sum() -> Result<()> {
        let gt = maps(&[&[1.0, 0.0], &[0.0, 1.0], &[0.0, 0.0]]);
        let pr = maps(&[&[0.6, 0.3], &[0.3, 0.5], &[0.1, 0.2]]);
        let dice = scalar(DiceLoss::default().forward(gt.clone(), pr.clone())?);
        let cce = scalar(CategoricalCrossEntropyConfig::new().init().forward(gt.clone(), pr.clone())?);
        let combined = DiceCceLossConfig::new()
            .with_cce_weight(2.0)
            .init()
            .forward(gt, pr)?;
        assert!((scalar(combined) - (dice + 2.0 * cce)).abs() < 1e-5);
        Ok(())
    }
}
