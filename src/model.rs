use std::path::Path;

use burn::tensor::{backend::Backend, Tensor};
use ndarray::prelude::*;
use tracing::info;

use crate::backbone::OnnxBackbone;
use crate::config::Config;
use crate::decoder::{UNetDecoder, UNetDecoderConfig};
use crate::errors::{HempSegError, Result};
use crate::tensor::{array_to_tensor, tensor_to_array};
use crate::traits::{ActivationSource, FeatureExtractor};

/// Pretrained backbone feeding a trainable U-Net decoder.
///
/// The backbone runs outside the autodiff graph; only the decoder's parameters
/// receive gradients.
pub struct Segmenter<B: Backend, F: FeatureExtractor> {
    backbone: F,
    decoder: UNetDecoder<B>,
    device: B::Device,
}

impl<B: Backend, F: FeatureExtractor> Segmenter<B, F> {
    /// Attaches a freshly initialised decoder sized to the backbone's skips.
    pub fn new(backbone: F, output_channels: usize, device: &B::Device) -> Result<Self> {
        let config = UNetDecoderConfig::new(backbone.spec().channels.clone(), output_channels);
        Self::with_decoder_config(backbone, &config, device)
    }

    pub fn with_decoder_config(
        backbone: F,
        config: &UNetDecoderConfig,
        device: &B::Device,
    ) -> Result<Self> {
        if config.skip_channels != backbone.spec().channels {
            return Err(HempSegError::validation(
                "skip_channels",
                format!(
                    "{:?} do not match backbone {} ({:?})",
                    config.skip_channels,
                    backbone.spec().name(),
                    backbone.spec().channels
                ),
            ));
        }
        let decoder = config.init(device)?;
        Ok(Self {
            backbone,
            decoder,
            device: device.clone(),
        })
    }

    pub fn backbone(&self) -> &F {
        &self.backbone
    }

    pub fn decoder(&self) -> &UNetDecoder<B> {
        &self.decoder
    }

    /// Swaps in a decoder, e.g. after an optimizer step.
    pub fn set_decoder(&mut self, decoder: UNetDecoder<B>) {
        self.decoder = decoder;
    }

    pub fn into_decoder(self) -> UNetDecoder<B> {
        self.decoder
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    fn check_input(&self, images: &ArrayView4<f32>) -> Result<()> {
        let (_, channels, h, w) = images.dim();
        if channels != 3 {
            return Err(HempSegError::validation(
                "images",
                format!("must have 3 channels, got {channels}"),
            ));
        }
        if (h, w) != self.backbone.input_size() {
            return Err(HempSegError::validation(
                "images",
                format!(
                    "are {h}x{w} but the model expects {:?}",
                    self.backbone.input_size()
                ),
            ));
        }
        Ok(())
    }

    fn skips(&self, images: ArrayView4<f32>) -> Result<Vec<Tensor<B, 4>>> {
        self.check_input(&images)?;
        let features = self.backbone.extract(images)?;
        Ok(features
            .iter()
            .map(|f| array_to_tensor::<B>(f.view(), &self.device))
            .collect())
    }

    /// Class probabilities `[B, C, H, W]` for images `[B, 3, H, W]`.
    pub fn forward(&self, images: ArrayView4<f32>) -> Result<Tensor<B, 4>> {
        let skips = self.skips(images)?;
        self.decoder.forward(skips)
    }

    pub fn predict(&self, images: ArrayView4<f32>) -> Result<Array4<f32>> {
        tensor_to_array(self.forward(images)?)
    }
}

impl<B: Backend, F: FeatureExtractor> ActivationSource for Segmenter<B, F> {
    /// Resolves backbone skip layers first, then decoder stages.
    fn layer_activation(&self, images: ArrayView4<f32>, layer: &str) -> Result<Array4<f32>> {
        if let Some(index) = self.backbone.spec().layers.iter().position(|l| l == layer) {
            self.check_input(&images)?;
            let mut features = self.backbone.extract(images)?;
            if index < features.len() {
                return Ok(features.swap_remove(index));
            }
            return Err(HempSegError::validation(layer, "missing from backbone output"));
        }

        let skips = self.skips(images)?;
        match self.decoder.forward_to(skips, layer)? {
            Some(stage) => tensor_to_array(stage),
            None => Err(HempSegError::validation(
                layer,
                format!(
                    "is neither a {} skip layer nor a decoder stage",
                    self.backbone.spec().name()
                ),
            )),
        }
    }
}

/// Loads the named ONNX backbone from `model_dir` and attaches a new decoder.
pub fn build_segmentation_model<B: Backend>(
    config: &Config,
    backbone_name: &str,
    output_channels: usize,
    trainable: bool,
    model_dir: &Path,
    device_id: i32,
    device: &B::Device,
) -> Result<Segmenter<B, OnnxBackbone>> {
    let backbone = OnnxBackbone::from_catalog(config, backbone_name, trainable, model_dir, device_id)?;
    let model = Segmenter::new(backbone, output_channels, device)?;
    info!(
        backbone = backbone_name,
        output_channels,
        stages = model.decoder.stage_names().len(),
        "segmentation model ready"
    );
    Ok(model)
}
