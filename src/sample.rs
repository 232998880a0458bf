use std::path::PathBuf;

use burn::tensor::{backend::Backend, Tensor};
use ndarray::prelude::*;

use crate::errors::{HempSegError, Result};
use crate::tensor::array_to_tensor;

/// One decoded image/mask pair.
///
/// Arrays are `[H, W, C]`; the image always has three channels in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub image: Array3<f32>,
    pub mask: Array3<f32>,
    /// Source path of the image file.
    pub path: PathBuf,
}

impl Sample {
    pub fn new(image: Array3<f32>, mask: Array3<f32>, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if image.dim().2 != 3 {
            return Err(HempSegError::validation(
                "image",
                format!("must have 3 channels, got {}", image.dim().2),
            ));
        }
        if image.dim().0 != mask.dim().0 || image.dim().1 != mask.dim().1 {
            return Err(HempSegError::validation(
                "mask",
                format!(
                    "is {:?} but image {} is {:?}",
                    mask.shape(),
                    path.display(),
                    image.shape()
                ),
            ));
        }
        Ok(Self { image, mask, path })
    }

    /// `(height, width)` shared by image and mask.
    pub fn spatial_dims(&self) -> (usize, usize) {
        let (h, w, _) = self.image.dim();
        (h, w)
    }
}

/// Samples stacked along a leading batch axis, channels-first.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// `[B, 3, H, W]`
    pub images: Array4<f32>,
    /// `[B, C, H, W]`
    pub masks: Array4<f32>,
    pub paths: Vec<PathBuf>,
}

impl Batch {
    pub fn from_samples(samples: Vec<Sample>) -> Result<Self> {
        if samples.is_empty() {
            return Err(HempSegError::validation("batch", "needs at least one sample"));
        }
        let images: Vec<_> = samples
            .iter()
            .map(|s| s.image.view().permuted_axes([2, 0, 1]))
            .collect();
        let masks: Vec<_> = samples
            .iter()
            .map(|s| s.mask.view().permuted_axes([2, 0, 1]))
            .collect();
        let images = ndarray::stack(Axis(0), &images)?;
        let masks = ndarray::stack(Axis(0), &masks)?;
        let paths = samples.into_iter().map(|s| s.path).collect();
        Ok(Self {
            images,
            masks,
            paths,
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// The `index`-th entry back in `[H, W, C]` form.
    pub fn sample(&self, index: usize) -> Option<Sample> {
        let path = self.paths.get(index)?.clone();
        let image = self
            .images
            .index_axis(Axis(0), index)
            .permuted_axes([1, 2, 0])
            .to_owned();
        let mask = self
            .masks
            .index_axis(Axis(0), index)
            .permuted_axes([1, 2, 0])
            .to_owned();
        Some(Sample { image, mask, path })
    }

    /// Images and masks as burn tensors on `device`.
    pub fn to_tensors<B: Backend>(&self, device: &B::Device) -> (Tensor<B, 4>, Tensor<B, 4>) {
        (
            array_to_tensor(self.images.view(), device),
            array_to_tensor(self.masks.view(), device),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(value: f32, h: usize, w: usize) -> Sample {
        Sample::new(
            Array3::from_elem((h, w, 3), value),
            Array3::from_elem((h, w, 3), 1.0 - value),
            format!("{value}.png"),
        )
        .unwrap()
    }

    #[test]
    fn test_mismatched_mask_rejected() {
        let result = Sample::new(
            Array3::zeros((8, 8, 3)),
            Array3::zeros((8, 6, 3)),
            "a.png",
        );
        assert!(matches!(result, Err(HempSegError::Validation { .. })));
    }

    #[test]
    fn test_batch_is_channels_first() -> Result<()> {
        let batch = Batch::from_samples(vec![sample(0.25, 4, 6), sample(0.75, 4, 6)])?;
        assert_eq!(batch.images.shape(), &[2, 3, 4, 6]);
        assert_eq!(batch.masks.shape(), &[2, 3, 4, 6]);
        assert_eq!(batch.images[[1, 2, 3, 5]], 0.75);
        assert_eq!(batch.paths[0], PathBuf::from("0.25.png"));

        let second = batch.sample(1).unwrap();
        assert_eq!(second.image.dim(), (4, 6, 3));
        assert_eq!(second.mask[[0, 0, 0]], 0.25);
        Ok(())
    }

    #[test]
    fn test_batch_rejects_ragged_samples() {
        let result = Batch::from_samples(vec![sample(0.1, 4, 4), sample(0.2, 6, 6)]);
        assert!(result.is_err());
    }
}
