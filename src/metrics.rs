//! Evaluation metrics on binarised masks.

use ndarray::prelude::*;

use crate::errors::{HempSegError, Result};

/// Probability above which a pixel counts as belonging to a class.
pub const THRESHOLD: f32 = 0.5;

/// Mean Dice coefficient over the batch.
///
/// Masks are `[B, C, H, W]`. For each sample the intersection and sizes are
/// pooled over every channel except `background`. An empty union scores 0.
pub fn dice_score(
    msk: ArrayView4<bool>,
    pred: ArrayView4<bool>,
    background: Option<usize>,
) -> Result<f64> {
    if msk.shape() != pred.shape() {
        return Err(HempSegError::validation(
            "prediction",
            format!("shape {:?} differs from mask {:?}", pred.shape(), msk.shape()),
        ));
    }
    let (batch, channels, _, _) = msk.dim();
    if batch == 0 {
        return Err(HempSegError::validation("batch", "is empty"));
    }
    if let Some(bg) = background {
        if bg >= channels {
            return Err(HempSegError::validation(
                "background",
                format!("channel {bg} is out of range for {channels} channels"),
            ));
        }
    }

    let total: f64 = msk
        .outer_iter()
        .zip(pred.outer_iter())
        .map(|(m, p)| {
            let (mut intersection, mut sizes) = (0usize, 0usize);
            for c in (0..channels).filter(|&c| Some(c) != background) {
                for (&a, &b) in m.index_axis(Axis(0), c).iter().zip(p.index_axis(Axis(0), c)) {
                    intersection += usize::from(a && b);
                    sizes += usize::from(a) + usize::from(b);
                }
            }
            let denominator = if sizes == 0 {
                f64::EPSILON
            } else {
                sizes as f64
            };
            2.0 * intersection as f64 / denominator
        })
        .sum();
    Ok(total / batch as f64)
}

fn binarise(x: ArrayView4<f32>) -> Array4<bool> {
    x.mapv(|v| v > THRESHOLD)
}

/// Dice over the plant classes, leaving out `background_channel`.
pub fn dice_metric_hemp(
    label: ArrayView4<f32>,
    pred: ArrayView4<f32>,
    background_channel: usize,
) -> Result<f64> {
    dice_score(
        binarise(label).view(),
        binarise(pred).view(),
        Some(background_channel),
    )
}

/// Dice over every channel, background included.
pub fn dice_metric_all(label: ArrayView4<f32>, pred: ArrayView4<f32>) -> Result<f64> {
    dice_score(binarise(label).view(), binarise(pred).view(), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask(f: impl Fn(usize, usize, usize, usize) -> bool) -> Array4<bool> {
        Array4::from_shape_fn((2, 3, 4, 4), |(b, c, y, x)| f(b, c, y, x))
    }

    #[test]
    fn test_self_is_one() -> Result<()> {
        let m = mask(|_, c, y, x| (y + x + c) % 3 == 0);
        assert!((dice_score(m.view(), m.view(), None)? - 1.0).abs() < 1e-12);
        assert!((dice_score(m.view(), m.view(), Some(2))? - 1.0).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_disjoint_is_zero() -> Result<()> {
        let a = mask(|_, _, y, _| y < 2);
        let b = mask(|_, _, y, _| y >= 2);
        assert_eq!(dice_score(a.view(), b.view(), None)?, 0.0);
        Ok(())
    }

    #[test]
    fn test_empty_is_zero_not_nan() -> Result<()> {
        let empty = mask(|_, _, _, _| false);
        let score = dice_score(empty.view(), empty.view(), None)?;
        assert!(!score.is_nan());
        assert!(score.abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_background_is_ignored() -> Result<()> {
        // only the background channel disagrees
        let a = mask(|_, c, _, _| c != 2);
        let b = mask(|_, _, _, _| true);
        assert!((dice_score(a.view(), b.view(), Some(2))? - 1.0).abs() < 1e-12);
        assert!(dice_score(a.view(), b.view(), None)? < 1.0);
        Ok(())
    }

    #[test]
    fn test_half_overlap() -> Result<()> {
        // |A| = 8, |B| = 4, |A∩B| = 4 per sample and channel
        let a = mask(|_, _, y, _| y < 2);
        let b = mask(|_, _, y, _| y < 1);
        let score = dice_score(a.view(), b.view(), None)?;
        assert!((score - 2.0 * 4.0 / 12.0).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_float_metrics_threshold() -> Result<()> {
        let label = Array4::from_shape_fn((1, 3, 2, 2), |(_, c, _, _)| if c == 0 { 1.0 } else { 0.0 });
        let pred = label.mapv(|v| if v > 0.0 { 0.8 } else { 0.3 });
        assert!((dice_metric_hemp(label.view(), pred.view(), 2)? - 1.0).abs() < 1e-12);
        assert!((dice_metric_all(label.view(), pred.view())? - 1.0).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_shape_mismatch() {
        let a = Array4::<bool>::default((1, 3, 2, 2));
        let b = Array4::<bool>::default((1, 2, 2, 2));
        assert!(dice_score(a.view(), b.view(), None).is_err());
    }
}
