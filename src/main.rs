use std::{
    fs,
    path::{Path, PathBuf},
    thread,
};

use anyhow::{ensure, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use image::ImageFormat;
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use ndarray::{Array4, Axis};
use rayon::prelude::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hemp_seg_rs::{
    codec::read_image,
    dataset::{list_files, worker_pool},
    metrics::{dice_metric_all, dice_metric_hemp},
    visualize::{preview, render_panels},
    Config, SegmentationDataset, SplitSource, StepDecay, TransformPipeline,
};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write image / mask / overlay panels for the first samples of a split.
    Preview(PreviewArgs),
    /// Score a folder of predicted masks against ground truth.
    Evaluate(EvaluateArgs),
    /// Print the step-decay learning rate for each epoch.
    Schedule(ScheduleArgs),
}

#[derive(Clone, Copy, ValueEnum)]
enum Split {
    Train,
    Validation,
    Test,
}

#[derive(clap::Args)]
struct PreviewArgs {
    /// Image directory or glob pattern
    #[arg(short, long)]
    images: PathBuf,

    /// Mask directory or glob pattern
    #[arg(short, long)]
    masks: PathBuf,

    #[arg(short, long)]
    output_dir: PathBuf,

    #[arg(long, value_enum, default_value_t = Split::Train)]
    split: Split,

    #[arg(short = 'n', long, default_value_t = 4)]
    count: usize,

    #[arg(long, default_value_t = 384)]
    height: usize,

    #[arg(long, default_value_t = 384)]
    width: usize,

    #[arg(long, default_value_t = 1)]
    seed: u64,

    #[arg(short, long, default_value_t = String::from("png"), value_parser = check_format)]
    format: String,

    #[arg(
        short = 'j', long, default_value_t = thread::available_parallelism().map_or(4, |n| n.get())
    )]
    num_threads: usize,
}

#[derive(clap::Args)]
struct EvaluateArgs {
    #[arg(short, long)]
    predictions: PathBuf,

    #[arg(short, long)]
    masks: PathBuf,

    /// Defaults to the configured background channel
    #[arg(short, long)]
    background_channel: Option<usize>,
}

#[derive(clap::Args)]
struct ScheduleArgs {
    /// Defaults to the configured epoch count
    #[arg(short, long)]
    epochs: Option<usize>,

    #[arg(long, default_value_t = 0.01)]
    init_alpha: f64,

    #[arg(long, default_value_t = 0.25)]
    factor: f64,

    #[arg(long, default_value_t = 10)]
    drop_every: usize,
}

fn check_format(s: &str) -> Result<String> {
    ensure!(
        ImageFormat::from_extension(s).is_some(),
        "Unsupported output format: {s}"
    );
    Ok(s.to_string())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Preview(args) => run_preview(args),
        Command::Evaluate(args) => run_evaluate(args),
        Command::Schedule(args) => run_schedule(args),
    }
}

fn run_preview(args: PreviewArgs) -> Result<()> {
    let config = Config::new()
        .with_image_size(args.height, args.width)
        .with_parallel_calls(args.num_threads)
        .with_seed(args.seed);
    config.validate()?;

    let pairs = SplitSource::new(&args.images, &args.masks).pairs()?;
    let transforms = match args.split {
        Split::Train => TransformPipeline::train(&config),
        Split::Validation => TransformPipeline::validation(&config),
        Split::Test => TransformPipeline::test(),
    };
    info!(pipeline = %transforms.describe(), samples = pairs.len(), "previewing split");

    let mut dataset = SegmentationDataset::new(
        pairs,
        transforms,
        config.batch_size,
        worker_pool(config.parallel_calls)?,
    )
    .with_seed(config.seed);
    if matches!(args.split, Split::Train) {
        dataset = dataset.with_shuffle(config.buffer_size);
    }

    fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("Failed to create {}", args.output_dir.display()))?;

    let mut written = 0;
    'batches: for batch in dataset.iter() {
        let batch = batch?;
        for index in 0..batch.len() {
            if written == args.count {
                break 'batches;
            }
            let Some(sample) = batch.sample(index) else {
                continue;
            };
            let canvas = render_panels(&preview(&sample, None, 0.5)?)?;
            let stem = sample
                .path
                .file_stem()
                .map_or_else(|| format!("sample_{written}"), |s| s.to_string_lossy().into_owned());
            let output_path = args.output_dir.join(stem).with_extension(&args.format);
            canvas
                .save(&output_path)
                .with_context(|| format!("Failed to save image: {}", output_path.display()))?;
            written += 1;
        }
    }

    info!(written, output_dir = %args.output_dir.display(), "preview done");
    Ok(())
}

fn channels_first(path: &Path) -> Result<Array4<f32>> {
    let array = read_image(path)?;
    Ok(array.permuted_axes([2, 0, 1]).insert_axis(Axis(0)))
}

fn run_evaluate(args: EvaluateArgs) -> Result<()> {
    let config = Config::new();
    let background_channel = args.background_channel.unwrap_or(config.background_channel);

    let predictions = list_files(&args.predictions)?;
    let masks = list_files(&args.masks)?;
    ensure!(
        predictions.len() == masks.len(),
        "Found {} predictions but {} masks",
        predictions.len(),
        masks.len()
    );
    ensure!(!masks.is_empty(), "No masks found in {}", args.masks.display());

    let progress_bar = ProgressBar::new(masks.len() as u64);
    progress_bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec} {eta})",
        )?
        .progress_chars("#>-"),
    );

    let scores = predictions
        .par_iter()
        .zip(masks.par_iter())
        .progress_with(progress_bar.clone())
        .map(|(prediction_path, mask_path)| -> Result<(f64, f64)> {
            let prediction = channels_first(prediction_path)?;
            let mask = channels_first(mask_path)?;
            let hemp = dice_metric_hemp(mask.view(), prediction.view(), background_channel)
                .with_context(|| format!("Failed to score {}", prediction_path.display()))?;
            let all = dice_metric_all(mask.view(), prediction.view())?;
            Ok((hemp, all))
        })
        .collect::<Result<Vec<_>>>()?;
    progress_bar.finish();

    let (hemp, all) = scores
        .iter()
        .fold((0.0, 0.0), |(h, a), (hemp, all)| (h + hemp, a + all));
    let count = scores.len() as f64;
    println!("dice (hemp): {:.4}", hemp / count);
    println!("dice (all):  {:.4}", all / count);
    Ok(())
}

fn run_schedule(args: ScheduleArgs) -> Result<()> {
    let epochs = args.epochs.unwrap_or(Config::new().epochs);
    let decay = StepDecay::new(args.init_alpha, args.factor, args.drop_every)?;
    for epoch in 1..=epochs {
        let rate = decay.learning_rate_for_epoch(epoch);
        println!("epoch {epoch:>4}: {rate:.6}");
    }
    Ok(())
}
