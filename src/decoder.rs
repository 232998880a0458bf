//! U-Net style decoder on top of backbone skip connections.

use burn::module::Ignored;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Dropout, DropoutConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::{relu, softmax};
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};

use crate::errors::{self, HempSegError};

fn upsample2x<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [_, _, h, w] = x.dims();
    interpolate(
        x,
        [h * 2, w * 2],
        InterpolateOptions::new(InterpolateMode::Nearest),
    )
}

/// Two conv/batch-norm/relu rounds at a fixed filter count, run on the ×2
/// upsampled input. The block's name labels that upsampled input.
#[derive(Module, Debug)]
pub struct UpBlock<B: Backend> {
    conv1: Conv2d<B>,
    norm1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    norm2: BatchNorm<B, 2>,
    dropout: Option<Dropout>,
    filters: Ignored<usize>,
}

impl<B: Backend> UpBlock<B> {
    fn new(
        in_channels: usize,
        filters: usize,
        kernel_size: usize,
        dropout: Option<f64>,
        device: &B::Device,
    ) -> Self {
        let conv = |input: usize| {
            Conv2dConfig::new([input, filters], [kernel_size, kernel_size])
                .with_padding(PaddingConfig2d::Same)
                .init(device)
        };
        Self {
            conv1: conv(in_channels),
            norm1: BatchNormConfig::new(filters).init(device),
            conv2: conv(filters),
            norm2: BatchNormConfig::new(filters).init(device),
            dropout: dropout.map(|prob| DropoutConfig::new(prob).init()),
            filters: Ignored(filters),
        }
    }

    pub fn filters(&self) -> usize {
        *self.filters
    }

    pub fn name(&self) -> String {
        format!("up_stack{}", self.filters())
    }

    /// Expects input already upsampled ×2.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = relu(self.norm1.forward(self.conv1.forward(x)));
        let x = relu(self.norm2.forward(self.conv2.forward(x)));
        match &self.dropout {
            Some(dropout) => dropout.forward(x),
            None => x,
        }
    }
}

#[derive(Config, Debug)]
pub struct UNetDecoderConfig {
    /// Channel count of every skip layer, shallow to deep.
    pub skip_channels: Vec<usize>,
    pub output_channels: usize,
    /// Filters of the upsampling blocks, deep to shallow.
    #[config(default = "vec![512, 256, 128, 64]")]
    pub filters: Vec<usize>,
    #[config(default = 3)]
    pub kernel_size: usize,
    #[config(default = 32)]
    pub head_channels: usize,
    #[config(default = false)]
    pub apply_dropout: bool,
    #[config(default = 0.3)]
    pub dropout: f64,
}

impl UNetDecoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> errors::Result<UNetDecoder<B>> {
        if self.filters.is_empty() {
            return Err(HempSegError::validation("filters", "needs at least one block"));
        }
        if self.skip_channels.len() != self.filters.len() + 1 {
            return Err(HempSegError::validation(
                "skip_channels",
                format!(
                    "expected {} skip layers for {} blocks, got {}",
                    self.filters.len() + 1,
                    self.filters.len(),
                    self.skip_channels.len()
                ),
            ));
        }
        if self.output_channels == 0 {
            return Err(HempSegError::validation("output_channels", "must be at least 1"));
        }

        let dropout = self.apply_dropout.then_some(self.dropout);
        let deepest = self.skip_channels.len() - 1;
        let mut in_channels = self.skip_channels[deepest];
        let mut blocks = Vec::with_capacity(self.filters.len());
        for (i, &filters) in self.filters.iter().enumerate() {
            blocks.push(UpBlock::new(
                in_channels,
                filters,
                self.kernel_size,
                dropout,
                device,
            ));
            in_channels = filters + self.skip_channels[deepest - 1 - i];
        }

        let head = Conv2dConfig::new(
            [in_channels, self.head_channels],
            [self.kernel_size, self.kernel_size],
        )
        .with_padding(PaddingConfig2d::Same)
        .init(device);
        let classifier = Conv2dConfig::new([self.head_channels, self.output_channels], [1, 1])
            .with_padding(PaddingConfig2d::Valid)
            .init(device);

        Ok(UNetDecoder {
            blocks,
            head,
            classifier,
        })
    }
}

#[derive(Module, Debug)]
pub struct UNetDecoder<B: Backend> {
    blocks: Vec<UpBlock<B>>,
    head: Conv2d<B>,
    classifier: Conv2d<B>,
}

impl<B: Backend> UNetDecoder<B> {
    /// Inspectable intermediate outputs, in execution order.
    pub fn stage_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.blocks.iter().map(UpBlock::name).collect();
        names.extend(
            ["final_upsample", "final_conv", "final_output"]
                .into_iter()
                .map(String::from),
        );
        names
    }

    pub fn num_skips(&self) -> usize {
        self.blocks.len() + 1
    }

    /// Per-pixel class probabilities `[B, output_channels, H, W]` from skips
    /// ordered shallow to deep.
    pub fn forward(&self, skips: Vec<Tensor<B, 4>>) -> errors::Result<Tensor<B, 4>> {
        self.check_skips(&skips)?;
        self.run(skips, None)
            .ok_or_else(|| HempSegError::validation("skips", "decoder produced no output"))
    }

    /// Output of the named stage, or `None` if the decoder has no such stage.
    pub fn forward_to(
        &self,
        skips: Vec<Tensor<B, 4>>,
        stage: &str,
    ) -> errors::Result<Option<Tensor<B, 4>>> {
        self.check_skips(&skips)?;
        Ok(self.run(skips, Some(stage)))
    }

    fn check_skips(&self, skips: &[Tensor<B, 4>]) -> errors::Result<()> {
        if skips.len() != self.num_skips() {
            return Err(HempSegError::validation(
                "skips",
                format!("expected {} feature maps, got {}", self.num_skips(), skips.len()),
            ));
        }
        Ok(())
    }

    /// Runs until `stop` (or to the end when `None`) and returns that stage.
    fn run(&self, mut skips: Vec<Tensor<B, 4>>, stop: Option<&str>) -> Option<Tensor<B, 4>> {
        let mut x = skips.pop()?;
        for block in &self.blocks {
            x = upsample2x(x);
            if stop == Some(block.name().as_str()) {
                return Some(x);
            }
            x = block.forward(x);
            if let Some(skip) = skips.pop() {
                x = Tensor::cat(vec![x, skip], 1);
            }
        }

        let x = upsample2x(x);
        if stop == Some("final_upsample") {
            return Some(x);
        }
        let x = relu(self.head.forward(x));
        if stop == Some("final_conv") {
            return Some(x);
        }
        let x = softmax(self.classifier.forward(x), 1);
        match stop {
            None | Some("final_output") => Some(x),
            Some(_) => None,
        }
    }
}
