use burn::prelude::*;

use super::{check_shapes, gather_channels};
use crate::errors;

const EPSILON: f64 = 1e-7;

#[derive(Config, Debug)]
pub struct FocalLossConfig {
    #[config(default = 2.0)]
    pub gamma: f64,
    #[config(default = 0.25)]
    pub alpha: f64,
    pub class_indexes: Option<Vec<usize>>,
}

impl FocalLossConfig {
    pub fn init(&self) -> FocalLoss {
        FocalLoss {
            config: self.clone(),
        }
    }
}

/// Categorical focal loss: cross entropy down-weighted on confident pixels.
#[derive(Debug, Clone)]
pub struct FocalLoss {
    config: FocalLossConfig,
}

impl FocalLoss {
    pub fn forward<B: Backend>(
        &self,
        gt: Tensor<B, 4>,
        pr: Tensor<B, 4>,
    ) -> errors::Result<Tensor<B, 1>> {
        check_shapes(&gt, &pr)?;
        let gt = gather_channels(gt, self.config.class_indexes.as_deref())?;
        let pr = gather_channels(pr, self.config.class_indexes.as_deref())?;
        let pr = pr.clamp(EPSILON, 1.0 - EPSILON);

        let modulation = pr.clone().neg().add_scalar(1.0).powf_scalar(self.config.gamma);
        let loss = gt
            .mul(modulation)
            .mul(pr.log())
            .mul_scalar(-self.config.alpha);
        Ok(loss.mean())
    }
}
