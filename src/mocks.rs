use crate::backbone::{Backbone, BackboneSpec};
use crate::errors::{HempSegError, Result};
use crate::traits::{ActivationSource, FeatureExtractor};
use ndarray::prelude::*;

/// Stand-in backbone for tests.
///
/// Produces skip maps with the right shapes for its spec. Each map is filled with
/// the mean of the matching input image, offset by the channel index so that
/// channels are distinguishable.
#[derive(Debug, Clone)]
pub struct MockFeatureExtractor {
    spec: BackboneSpec,
    input_size: (usize, usize),
}

impl MockFeatureExtractor {
    pub fn new(backbone: Backbone, input_size: (usize, usize)) -> Self {
        Self {
            spec: BackboneSpec::new(backbone),
            input_size,
        }
    }

    /// Shrinks every skip to `channels` feature maps, keeping tests fast.
    pub fn with_channels(mut self, channels: usize) -> Self {
        self.spec.channels = vec![channels; self.spec.layers.len()];
        self
    }

    fn feature_map(&self, images: ArrayView4<f32>, index: usize) -> Array4<f32> {
        let (batch, _, h, w) = images.dim();
        let stride = BackboneSpec::stride(index);
        let channels = self.spec.channels[index];
        let mut features = Array4::<f32>::zeros((batch, channels, h / stride, w / stride));
        for (b, mut sample) in features.outer_iter_mut().enumerate() {
            let mean = images.index_axis(Axis(0), b).mean().unwrap_or(0.0);
            for (c, mut channel) in sample.outer_iter_mut().enumerate() {
                channel.fill(mean + c as f32 * 0.01);
            }
        }
        features
    }
}

impl FeatureExtractor for MockFeatureExtractor {
    fn spec(&self) -> &BackboneSpec {
        &self.spec
    }

    fn input_size(&self) -> (usize, usize) {
        self.input_size
    }

    fn is_trainable(&self) -> bool {
        false
    }

    fn extract(&self, images: ArrayView4<f32>) -> Result<Vec<Array4<f32>>> {
        Ok((0..self.spec.layers.len())
            .map(|index| self.feature_map(images, index))
            .collect())
    }
}

impl ActivationSource for MockFeatureExtractor {
    fn layer_activation(&self, images: ArrayView4<f32>, layer: &str) -> Result<Array4<f32>> {
        let index = self
            .spec
            .layers
            .iter()
            .position(|l| l == layer)
            .ok_or_else(|| HempSegError::validation(layer, "is not a mock skip layer"))?;
        Ok(self.feature_map(images, index))
    }
}
