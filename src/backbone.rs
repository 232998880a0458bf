use std::{fmt, path::Path, str::FromStr};

use ndarray::prelude::*;
use ort::value::TensorRef;
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::SessionBuilder, Session},
};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    config::Config,
    errors::{HempSegError, Result},
    traits::{ActivationSource, FeatureExtractor},
};

/// Pretrained feature extractors the decoder can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backbone {
    Vgg19,
    ResNet50,
    ResNet50V2,
    ResNet101,
    MobileNetV2,
}

impl Backbone {
    pub const ALL: [Backbone; 5] = [
        Backbone::Vgg19,
        Backbone::ResNet50,
        Backbone::ResNet50V2,
        Backbone::ResNet101,
        Backbone::MobileNetV2,
    ];

    pub const fn name(&self) -> &'static str {
        match self {
            Backbone::Vgg19 => "vgg19",
            Backbone::ResNet50 => "resnet50",
            Backbone::ResNet50V2 => "resnet50v2",
            Backbone::ResNet101 => "resnet101",
            Backbone::MobileNetV2 => "mobilenetv2",
        }
    }

    /// Skip endpoints, shallow to deep, with their channel counts.
    const fn layers(&self) -> [(&'static str, usize); 5] {
        match self {
            Backbone::Vgg19 => [
                ("block2_conv2", 128),
                ("block3_conv4", 256),
                ("block4_conv4", 512),
                ("block5_conv4", 512),
                ("block5_pool", 512),
            ],
            Backbone::ResNet50 | Backbone::ResNet101 => [
                ("conv1_relu", 64),
                ("conv2_block3_out", 256),
                ("conv3_block4_out", 512),
                ("conv4_block6_out", 1024),
                ("conv5_block3_out", 2048),
            ],
            Backbone::ResNet50V2 => [
                ("conv1_conv", 64),
                ("conv2_block3_1_relu", 64),
                ("conv3_block4_1_relu", 128),
                ("conv4_block6_1_relu", 256),
                ("post_relu", 2048),
            ],
            Backbone::MobileNetV2 => [
                ("block_1_expand_relu", 96),
                ("block_3_expand_relu", 144),
                ("block_6_expand_relu", 192),
                ("block_13_expand_relu", 576),
                ("block_16_project", 320),
            ],
        }
    }

    fn valid_names() -> Vec<String> {
        Self::ALL.iter().map(|b| b.name().to_string()).collect()
    }
}

impl fmt::Display for Backbone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Backbone {
    type Err = HempSegError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|b| b.name() == s)
            .ok_or_else(|| HempSegError::UnknownBackbone {
                name: s.to_string(),
                valid: Self::valid_names(),
            })
    }
}

/// Layer table of one backbone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackboneSpec {
    pub backbone: Backbone,
    /// Skip layer identifiers ordered shallow to deep. The last one seeds the decoder.
    pub layers: Vec<String>,
    pub channels: Vec<usize>,
}

impl BackboneSpec {
    pub fn new(backbone: Backbone) -> Self {
        let (layers, channels) = backbone
            .layers()
            .into_iter()
            .map(|(name, channels)| (name.to_string(), channels))
            .unzip();
        Self {
            backbone,
            layers,
            channels,
        }
    }

    pub fn name(&self) -> &'static str {
        self.backbone.name()
    }

    pub fn seed_layer(&self) -> &str {
        self.layers.last().map(String::as_str).unwrap_or_default()
    }

    pub fn contains_layer(&self, layer: &str) -> bool {
        self.layers.iter().any(|l| l == layer)
    }

    /// Downsampling factor of the skip at `index` relative to the network input.
    pub const fn stride(index: usize) -> usize {
        1 << (index + 1)
    }
}

/// The backbone to layer-table mapping, passed around as part of [`Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackboneCatalog {
    entries: Vec<BackboneSpec>,
}

impl Default for BackboneCatalog {
    fn default() -> Self {
        Self {
            entries: Backbone::ALL.into_iter().map(BackboneSpec::new).collect(),
        }
    }
}

impl BackboneCatalog {
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(BackboneSpec::name).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BackboneSpec> {
        self.entries.iter()
    }

    /// Looks up a backbone by identifier.
    pub fn get(&self, name: &str) -> Result<&BackboneSpec> {
        let unknown = || HempSegError::UnknownBackbone {
            name: name.to_string(),
            valid: self.names().iter().map(|n| n.to_string()).collect(),
        };
        let backbone = name.parse::<Backbone>().map_err(|_| unknown())?;
        self.entries
            .iter()
            .find(|spec| spec.backbone == backbone)
            .ok_or_else(unknown)
    }
}

/// Memory layout of the tensors an exported backbone consumes and produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TensorLayout {
    /// `[B, H, W, C]`, the layout of networks exported from Keras.
    #[default]
    ChannelsLast,
    /// `[B, C, H, W]`
    ChannelsFirst,
}

/// Pretrained backbone executed through ONNX Runtime.
///
/// The exported graph must take one image input and expose one output per skip
/// layer, named after the layer.
pub struct OnnxBackbone {
    spec: BackboneSpec,
    input_size: (usize, usize),
    layout: TensorLayout,
    trainable: bool,
    input_name: String,
    session: Mutex<Session>,
}

impl OnnxBackbone {
    /// Resolves `name` in the catalog and loads `<model_dir>/<name>.onnx`.
    pub fn from_catalog(
        config: &Config,
        name: &str,
        trainable: bool,
        model_dir: &Path,
        device_id: i32,
    ) -> Result<Self> {
        let spec = config.backbones.get(name)?.clone();
        let model_path = model_dir.join(format!("{}.onnx", spec.name()));
        Self::new(
            spec,
            &model_path,
            trainable,
            (config.image_height, config.image_width),
            TensorLayout::default(),
            device_id,
        )
    }

    pub fn new(
        spec: BackboneSpec,
        model_path: &Path,
        trainable: bool,
        input_size: (usize, usize),
        layout: TensorLayout,
        device_id: i32,
    ) -> Result<Self> {
        let mut session = SessionBuilder::new()
            .map_err(|e| HempSegError::Model {
                operation: "session builder initialization".to_string(),
                source: Box::new(e),
            })?
            .with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
            ])
            .map_err(|e| HempSegError::Model {
                operation: "execution provider registration".to_string(),
                source: Box::new(e),
            })?
            .with_memory_pattern(true)
            .map_err(|e| HempSegError::Model {
                operation: "memory pattern setup".to_string(),
                source: Box::new(e),
            })?
            .commit_from_file(model_path)
            .map_err(|e| HempSegError::Model {
                operation: format!("loading backbone file {}", model_path.display()),
                source: Box::new(e),
            })?;

        let input = session.inputs.first().ok_or_else(|| {
            HempSegError::validation(spec.name(), "exported backbone has no inputs")
        })?;
        let input_name = input.name.clone();
        let shape = input
            .input_type
            .tensor_shape()
            .ok_or_else(|| HempSegError::validation(spec.name(), "input is not a tensor"))?;
        if shape.len() != 4 {
            return Err(HempSegError::validation(
                spec.name(),
                format!("expected a 4-d image input, found {} dims", shape.len()),
            ));
        }
        let (h, w) = match layout {
            TensorLayout::ChannelsLast => (shape[1], shape[2]),
            TensorLayout::ChannelsFirst => (shape[2], shape[3]),
        };
        // Negative extents are dynamic axes and accept any size.
        if (h > 0 && h as usize != input_size.0) || (w > 0 && w as usize != input_size.1) {
            return Err(HempSegError::validation(
                spec.name(),
                format!(
                    "is exported for {}x{} inputs but the pipeline uses {}x{}",
                    h, w, input_size.0, input_size.1
                ),
            ));
        }

        let missing: Vec<&str> = spec
            .layers
            .iter()
            .filter(|layer| !session.outputs.iter().any(|o| &o.name == *layer))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(HempSegError::validation(
                spec.name(),
                format!("exported graph lacks skip outputs: {}", missing.join(", ")),
            ));
        }

        if trainable {
            warn!(
                backbone = spec.name(),
                "ONNX backbone weights cannot be fine-tuned, running it frozen"
            );
        }

        // warmup
        let zeros = Array4::<f32>::zeros((1, 3, input_size.0, input_size.1));
        let warmup = to_layout(zeros.view(), layout);
        session
            .run(ort::inputs![input_name.as_str() => TensorRef::from_array_view(&warmup.as_standard_layout()).map_err(|e| HempSegError::Model {
                operation: "warmup tensor creation".to_string(),
                source: Box::new(e),
            })?])
            .map_err(|e| HempSegError::Model {
                operation: "backbone warmup run".to_string(),
                source: Box::new(e),
            })?;

        debug!(backbone = spec.name(), path = %model_path.display(), "backbone loaded");

        Ok(Self {
            spec,
            input_size,
            layout,
            trainable,
            input_name,
            session: Mutex::new(session),
        })
    }

    fn run_layers(&self, images: ArrayView4<f32>, layers: &[&str]) -> Result<Vec<Array4<f32>>> {
        let (_, channels, h, w) = images.dim();
        if channels != 3 || (h, w) != self.input_size {
            return Err(HempSegError::validation(
                "images",
                format!(
                    "expected [B, 3, {}, {}], got {:?}",
                    self.input_size.0,
                    self.input_size.1,
                    images.shape()
                ),
            ));
        }

        let input = to_layout(images, self.layout);
        let mut binding = self.session.lock();
        let outputs = binding.run(ort::inputs![
            self.input_name.as_str() => TensorRef::from_array_view(&input.as_standard_layout())?
        ])?;

        let features: Result<Vec<_>> = layers
            .iter()
            .map(|layer| {
                let features = outputs[*layer]
                    .try_extract_array::<f32>()?
                    .into_dimensionality::<Ix4>()?;
                let features = match self.layout {
                    TensorLayout::ChannelsLast => features.permuted_axes([0, 3, 1, 2]),
                    TensorLayout::ChannelsFirst => features,
                };
                Ok(features.as_standard_layout().into_owned())
            })
            .collect();
        features
    }
}

fn to_layout(images: ArrayView4<f32>, layout: TensorLayout) -> ArrayView4<f32> {
    match layout {
        TensorLayout::ChannelsLast => images.permuted_axes([0, 2, 3, 1]),
        TensorLayout::ChannelsFirst => images,
    }
}

impl FeatureExtractor for OnnxBackbone {
    fn spec(&self) -> &BackboneSpec {
        &self.spec
    }

    fn input_size(&self) -> (usize, usize) {
        self.input_size
    }

    fn is_trainable(&self) -> bool {
        self.trainable
    }

    fn extract(&self, images: ArrayView4<f32>) -> Result<Vec<Array4<f32>>> {
        let layers: Vec<&str> = self.spec.layers.iter().map(String::as_str).collect();
        self.run_layers(images, &layers)
    }
}

impl ActivationSource for OnnxBackbone {
    fn layer_activation(&self, images: ArrayView4<f32>, layer: &str) -> Result<Array4<f32>> {
        if !self.spec.contains_layer(layer) {
            return Err(HempSegError::validation(
                layer,
                format!("is not exported by backbone {}", self.spec.name()),
            ));
        }
        self.run_layers(images, &[layer])?
            .pop()
            .ok_or_else(|| HempSegError::validation(layer, "produced no output"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_names() -> Result<()> {
        for backbone in Backbone::ALL {
            assert_eq!(backbone.name().parse::<Backbone>()?, backbone);
        }
        Ok(())
    }

    #[test]
    fn test_unknown_name_lists_valid_names() {
        let err = Config::default().backbones.get("inception").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("inception"));
        for name in ["vgg19", "resnet50", "resnet50v2", "resnet101", "mobilenetv2"] {
            assert!(message.contains(name), "{name} missing from: {message}");
        }
    }

    #[test]
    fn test_layer_tables() -> Result<()> {
        let catalog = BackboneCatalog::default();
        let vgg = catalog.get("vgg19")?;
        assert_eq!(vgg.seed_layer(), "block5_pool");
        assert_eq!(vgg.layers[0], "block2_conv2");

        let mobilenet = catalog.get("mobilenetv2")?;
        assert_eq!(
            mobilenet.layers,
            [
                "block_1_expand_relu",
                "block_3_expand_relu",
                "block_6_expand_relu",
                "block_13_expand_relu",
                "block_16_project",
            ]
        );

        assert_eq!(
            catalog.get("resnet50")?.layers,
            catalog.get("resnet101")?.layers
        );
        for spec in catalog.iter() {
            assert_eq!(spec.layers.len(), 5);
            assert_eq!(spec.channels.len(), 5);
        }
        Ok(())
    }

    #[test]
    fn test_missing_model_file_is_model_error() {
        let config = Config::default();
        let result = OnnxBackbone::from_catalog(
            &config,
            "vgg19",
            false,
            Path::new("/nonexistent/backbones"),
            0,
        );
        assert!(matches!(result, Err(HempSegError::Model { .. })));
    }
}
