use burn::prelude::*;

use super::{check_shapes, gather_channels};
use crate::errors;

const EPSILON: f64 = 1e-7;

#[derive(Config, Debug)]
pub struct CategoricalCrossEntropyConfig {
    /// Mass moved from the true class to a uniform distribution over classes.
    #[config(default = 0.3)]
    pub label_smoothing: f64,
    pub class_indexes: Option<Vec<usize>>,
}

impl CategoricalCrossEntropyConfig {
    pub fn init(&self) -> CategoricalCrossEntropy {
        CategoricalCrossEntropy {
            config: self.clone(),
        }
    }
}

/// Cross entropy with label smoothing over the channel axis.
#[derive(Debug, Clone)]
pub struct CategoricalCrossEntropy {
    config: CategoricalCrossEntropyConfig,
}

impl CategoricalCrossEntropy {
    pub fn forward<B: Backend>(
        &self,
        gt: Tensor<B, 4>,
        pr: Tensor<B, 4>,
    ) -> errors::Result<Tensor<B, 1>> {
        check_shapes(&gt, &pr)?;
        let gt = gather_channels(gt, self.config.class_indexes.as_deref())?;
        let pr = gather_channels(pr, self.config.class_indexes.as_deref())?;

        let classes = gt.dims()[1] as f64;
        let smoothing = self.config.label_smoothing;
        let gt = gt
            .mul_scalar(1.0 - smoothing)
            .add_scalar(smoothing / classes);

        let pr = pr.clone() / pr.sum_dim(1).clamp_min(EPSILON);
        let pr = pr.clamp(EPSILON, 1.0 - EPSILON);

        let per_pixel = gt.mul(pr.log()).sum_dim(1).neg();
        Ok(per_pixel.mean())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::*;
    use crate::errors::Result;

    fn loss_for(confidence: f32, smoothing: f64) -> Result<f32> {
        let gt = maps(&[&[0.0, 1.0], &[1.0, 0.0], &[0.0, 0.0]]);
        let rest = (1.0 - confidence) / 2.0;
        let pr = maps(&[&[rest, confidence], &[confidence, rest], &[rest, rest]]);
        let loss = CategoricalCrossEntropyConfig::new()
            .with_label_smoothing(smoothing)
            .init();
        Ok(scalar(loss.forward(gt, pr)?))
    }

    #[test]
    fn test_non_negative_and_monotonic() -> Result<()> {
        // with smoothing the minimum sits below full confidence, so start there
        let mut previous = 0.0;
        for confidence in [0.7, 0.4, 0.1] {
            let loss = loss_for(confidence, 0.3)?;
            assert!(loss >= 0.0);
            assert!(loss > previous);
            previous = loss;
        }
        Ok(())
    }

    #[test]
    fn test_plain_cross_entropy_value() -> Result<()> {
        let loss = loss_for(0.5, 0.0)?;
        assert!((loss - 0.5f32.ln().abs()).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_unnormalised_predictions_are_rescaled() -> Result<()> {
        let gt = maps(&[&[1.0], &[0.0]]);
        let loss = CategoricalCrossEntropyConfig::new()
            .with_label_smoothing(0.0)
            .init();
        let scaled = scalar(loss.forward(gt.clone(), maps(&[&[2.0], &[2.0]]))?);
        let unit = scalar(loss.forward(gt, maps(&[&[0.5], &[0.5]]))?);
        assert!((scaled - unit).abs() < 1e-6);
        Ok(())
    }
}
