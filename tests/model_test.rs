use burn::backend::{Autodiff, NdArray};
use burn::module::{Module, ModuleVisitor, ParamId};
use burn::tensor::{backend::AutodiffBackend, Tensor};
use ndarray::{Array3, Array4};

use hemp_seg_rs::{
    dice_metric_all,
    losses::{DiceCceLossConfig, FocalLossConfig},
    mocks::MockFeatureExtractor,
    visualize::activation_maps,
    Backbone, Batch, Config, Result, Sample, Segmenter, UNetDecoderConfig,
};

type TrainBackend = Autodiff<NdArray>;
type Gradients = <TrainBackend as AutodiffBackend>::Gradients;

/// Sum of absolute gradient values, one entry per parameter that has one.
struct GradientMagnitudes<'a> {
    grads: &'a Gradients,
    sums: Vec<f32>,
}

impl ModuleVisitor<TrainBackend> for GradientMagnitudes<'_> {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<TrainBackend, D>) {
        if let Some(grad) = tensor.grad(self.grads) {
            self.sums.push(grad.abs().sum().into_scalar());
        }
    }
}

fn small_segmenter() -> Result<Segmenter<TrainBackend, MockFeatureExtractor>> {
    let backbone = MockFeatureExtractor::new(Backbone::ResNet50, (32, 32)).with_channels(3);
    let config = UNetDecoderConfig::new(vec![3; 5], 3)
        .with_filters(vec![8, 8, 4, 4])
        .with_head_channels(4);
    Segmenter::with_decoder_config(backbone, &config, &Default::default())
}

fn batch() -> Result<Batch> {
    let samples = (0..2)
        .map(|i| {
            let image = Array3::from_shape_fn((32, 32, 3), |(y, x, c)| {
                ((y + x + c + i) % 7) as f32 / 7.0
            });
            let mask = Array3::from_shape_fn((32, 32, 3), |(y, _, c)| {
                let class = if y < 10 { 0 } else if y < 20 { 1 } else { 2 };
                if c == class {
                    1.0
                } else {
                    0.0
                }
            });
            Sample::new(image, mask, format!("{i}.png"))
        })
        .collect::<Result<Vec<_>>>()?;
    Batch::from_samples(samples)
}

#[test]
fn test_training_step_produces_finite_loss() -> Result<()> {
    let model = small_segmenter()?;
    let batch = batch()?;
    let (_, masks) = batch.to_tensors::<TrainBackend>(model.device());

    let prediction = model.forward(batch.images.view())?;
    assert_eq!(prediction.dims(), [2, 3, 32, 32]);

    let loss = DiceCceLossConfig::new().init().forward(masks.clone(), prediction.clone())?;
    let score = Config::default().fscore().init().forward(masks.clone(), prediction.clone())?;
    let score = score.into_data().to_vec::<f32>().unwrap()[0];
    assert!((0.0..=1.0).contains(&score));
    let focal = FocalLossConfig::new().init().forward(masks, prediction)?;
    let total = loss + focal;
    let value = total.clone().into_data().to_vec::<f32>().unwrap()[0];
    assert!(value.is_finite());
    assert!(value > 0.0);

    let grads = total.backward();
    let mut magnitudes = GradientMagnitudes {
        grads: &grads,
        sums: Vec::new(),
    };
    model.decoder().visit(&mut magnitudes);
    assert!(!magnitudes.sums.is_empty());
    assert!(magnitudes.sums.iter().all(|s| s.is_finite()));
    assert!(magnitudes.sums.iter().any(|&s| s > 0.0));
    Ok(())
}

#[test]
fn test_predictions_score_against_masks() -> Result<()> {
    let model = small_segmenter()?;
    let batch = batch()?;
    let prediction = model.predict(batch.images.view())?;

    let score = dice_metric_all(batch.masks.view(), prediction.view())?;
    assert!((0.0..=1.0).contains(&score));

    let perfect = dice_metric_all(batch.masks.view(), batch.masks.view())?;
    assert!((perfect - 1.0).abs() < 1e-12);
    Ok(())
}

#[test]
fn test_activation_viewer_over_whole_model() -> Result<()> {
    let model = small_segmenter()?;
    let batch = batch()?;
    let sample = batch.sample(0).unwrap();

    let report = activation_maps(
        &model,
        sample.image.view(),
        sample.mask.view(),
        &["conv2_block3_out", "up_stack8", "final_conv"],
        0,
    )?;
    let shapes: Vec<_> = report.rows.iter().map(|r| r.maps[0].dim()).collect();
    assert_eq!(shapes, vec![(8, 8), (2, 2), (32, 32)]);
    // the first decoder stage is the deepest skip upsampled, so 3 channels
    assert_eq!(report.rows[1].maps.len(), 3);
    assert_eq!(report.rows[2].maps.len(), 4);

    let images = Array4::<f32>::zeros((1, 3, 32, 32));
    assert!(model.predict(images.view()).is_ok());
    Ok(())
}
