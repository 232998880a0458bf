use crate::backbone::BackboneSpec;
use crate::errors::Result;
use ndarray::prelude::*;

/// Pretrained network that feeds skip connections into the decoder.
///
/// Images go in as `[B, 3, H, W]` in `[0, 1]`. Feature maps come back
/// channels-first, one per skip layer, in the order of [`BackboneSpec::layers`].
pub trait FeatureExtractor: Send + Sync {
    fn spec(&self) -> &BackboneSpec;

    /// Spatial input size `(height, width)` the network was built for.
    fn input_size(&self) -> (usize, usize);

    fn is_trainable(&self) -> bool;

    fn extract(&self, images: ArrayView4<f32>) -> Result<Vec<Array4<f32>>>;
}

/// Anything that can run an image up to a named layer and report its output.
///
/// Used by the activation-map viewer.
pub trait ActivationSource {
    fn layer_activation(&self, images: ArrayView4<f32>, layer: &str) -> Result<Array4<f32>>;
}
