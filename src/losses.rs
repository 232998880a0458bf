//! Differentiable losses over channels-first probability maps `[B, C, H, W]`.
//!
//! Ground truth and prediction must share a shape. Every loss returns a
//! one-element tensor so it can be fed straight to `backward()`.

mod cross_entropy;
mod focal;
mod fscore;

pub use cross_entropy::{CategoricalCrossEntropy, CategoricalCrossEntropyConfig};
pub use focal::{FocalLoss, FocalLossConfig};
pub use fscore::{DiceCceLoss, DiceCceLossConfig, DiceLoss, FScore, FScoreConfig};

use burn::tensor::{backend::Backend, Int, Tensor, TensorData};

use crate::errors::{HempSegError, Result};

/// Keeps only the listed channels, in the listed order.
pub fn gather_channels<B: Backend>(x: Tensor<B, 4>, indexes: Option<&[usize]>) -> Result<Tensor<B, 4>> {
    let Some(indexes) = indexes else {
        return Ok(x);
    };
    let channels = x.dims()[1];
    if let Some(&bad) = indexes.iter().find(|&&i| i >= channels) {
        return Err(HempSegError::validation(
            "class_indexes",
            format!("channel {bad} is out of range for {channels} channels"),
        ));
    }
    let values: Vec<i64> = indexes.iter().map(|&i| i as i64).collect();
    let index = Tensor::<B, 1, Int>::from_data(TensorData::new(values, [indexes.len()]), &x.device());
    Ok(x.select(1, index))
}

/// Binarises `x` at `threshold` when one is given.
pub fn round_if_needed<B: Backend>(x: Tensor<B, 4>, threshold: Option<f64>) -> Tensor<B, 4> {
    match threshold {
        Some(threshold) => x.greater_elem(threshold).float(),
        None => x,
    }
}

/// Sums over height and width, and over the batch too unless `per_image`.
///
/// Returns `[B, C]` per image, otherwise `[1, C]`.
pub fn reduce_sum<B: Backend>(x: Tensor<B, 4>, per_image: bool) -> Tensor<B, 2> {
    let [batch, channels, _, _] = x.dims();
    let x = x.sum_dim(3).sum_dim(2);
    if per_image {
        x.reshape([batch, channels])
    } else {
        x.sum_dim(0).reshape([1, channels])
    }
}

/// Averages per-class scores into one value, weighting classes if asked.
pub fn average<B: Backend>(
    x: Tensor<B, 2>,
    per_image: bool,
    class_weights: Option<&[f32]>,
) -> Result<Tensor<B, 1>> {
    let x = if per_image { x.mean_dim(0) } else { x };
    let x = match class_weights {
        Some(weights) => {
            let channels = x.dims()[1];
            if weights.len() != channels {
                return Err(HempSegError::validation(
                    "class_weights",
                    format!("has {} entries for {channels} channels", weights.len()),
                ));
            }
            let weights =
                Tensor::<B, 2>::from_data(TensorData::new(weights.to_vec(), [1, channels]), &x.device());
            x * weights
        }
        None => x,
    };
    Ok(x.mean())
}

pub(crate) fn check_shapes<B: Backend>(gt: &Tensor<B, 4>, pr: &Tensor<B, 4>) -> Result<()> {
    if gt.dims() != pr.dims() {
        return Err(HempSegError::validation(
            "prediction",
            format!("shape {:?} differs from ground truth {:?}", pr.dims(), gt.dims()),
        ));
    }
    Ok(())
}
