pub mod augment;
pub mod backbone;
pub mod codec;
pub mod config;
pub mod dataset;
pub mod decoder;
pub mod errors;
pub mod losses;
pub mod metrics;
pub mod model;
pub mod sample;
pub mod schedule;
pub mod tensor;
pub mod traits;
pub mod visualize;

pub mod mocks;

pub use augment::{Transform, TransformPipeline};
pub use backbone::{Backbone, BackboneCatalog, BackboneSpec, OnnxBackbone, TensorLayout};
pub use config::Config;
pub use dataset::{create_datasets, split_datasets, Datasets, SegmentationDataset, SplitSource};
pub use decoder::{UNetDecoder, UNetDecoderConfig};
pub use errors::{HempSegError, Result};
pub use metrics::{dice_metric_all, dice_metric_hemp, dice_score};
pub use model::{build_segmentation_model, Segmenter};
pub use sample::{Batch, Sample};
pub use schedule::StepDecay;
pub use traits::*;
