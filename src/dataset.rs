//! Building lazy, batched train/validation/test pipelines from image folders.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::ImageFormat;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::augment::TransformPipeline;
use crate::codec::read_sample;
use crate::config::Config;
use crate::errors::{HempSegError, Result};
use crate::sample::{Batch, Sample};

const SHUFFLE_STREAM: u64 = 0x7368_7566_666c_6500;
const SAMPLE_STREAM: u64 = 0x7361_6d70_6c65_0000;

/// Lists the files named by `source`, sorted by path.
///
/// A source containing `*`, `?` or `[` is matched as a glob pattern and must
/// match at least one file. Anything else is a directory whose image files are
/// collected recursively.
pub fn list_files(source: &Path) -> Result<Vec<PathBuf>> {
    let text = source.to_string_lossy();
    if text.contains(['*', '?', '[']) {
        return list_matches(&text);
    }

    if !source.is_dir() {
        return Err(HempSegError::FileSystem {
            path: source.to_path_buf(),
            operation: "list image files".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "directory does not exist"),
        });
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry.map_err(|e| HempSegError::FileSystem {
            path: source.to_path_buf(),
            operation: "walk directory".to_string(),
            source: e.into(),
        })?;
        if entry.file_type().is_file() && ImageFormat::from_path(entry.path()).is_ok() {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

fn list_matches(pattern: &str) -> Result<Vec<PathBuf>> {
    let matches = glob::glob(pattern)
        .map_err(|e| HempSegError::validation("pattern", format!("{pattern}: {e}")))?;

    let mut files = Vec::new();
    for entry in matches {
        let path = entry.map_err(|e| HempSegError::FileSystem {
            path: e.path().to_path_buf(),
            operation: "match pattern".to_string(),
            source: e.into_error(),
        })?;
        if path.is_file() {
            files.push(path);
        }
    }
    if files.is_empty() {
        return Err(HempSegError::validation(
            "pattern",
            format!("no files matched {pattern}"),
        ));
    }
    files.sort();
    Ok(files)
}

pub type PathPair = (PathBuf, PathBuf);

/// Image and mask sources of one split, each a directory or a glob pattern.
///
/// Files are paired by sorted position only; the caller is responsible for
/// naming them so that both listings line up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitSource {
    pub images: PathBuf,
    pub masks: PathBuf,
}

impl SplitSource {
    pub fn new(images: impl Into<PathBuf>, masks: impl Into<PathBuf>) -> Self {
        Self {
            images: images.into(),
            masks: masks.into(),
        }
    }

    pub fn pairs(&self) -> Result<Vec<PathPair>> {
        let images = list_files(&self.images)?;
        let masks = list_files(&self.masks)?;
        if images.len() != masks.len() {
            return Err(HempSegError::validation(
                "split",
                format!(
                    "{} has {} images but {} has {} masks",
                    self.images.display(),
                    images.len(),
                    self.masks.display(),
                    masks.len()
                ),
            ));
        }
        Ok(images.into_iter().zip(masks).collect())
    }
}

/// Shuffles `pairs` with `seed` and cuts them at `train_fraction`.
pub fn train_val_split(
    mut pairs: Vec<PathPair>,
    train_fraction: f64,
    seed: u64,
) -> (Vec<PathPair>, Vec<PathPair>) {
    let mut rng = StdRng::seed_from_u64(seed);
    pairs.shuffle(&mut rng);
    let cut = ((pairs.len() as f64) * train_fraction.clamp(0.0, 1.0)).round() as usize;
    let validation = pairs.split_off(cut.min(pairs.len()));
    (pairs, validation)
}

/// Yields items in random order while holding at most `capacity` of them.
pub struct ShuffleBuffer<I: Iterator> {
    source: I,
    buffer: Vec<I::Item>,
    capacity: usize,
    rng: StdRng,
}

impl<I: Iterator> ShuffleBuffer<I> {
    pub fn new(source: I, capacity: usize, rng: StdRng) -> Self {
        let capacity = capacity.max(1);
        Self {
            source,
            buffer: Vec::with_capacity(capacity),
            capacity,
            rng,
        }
    }
}

impl<I: Iterator> Iterator for ShuffleBuffer<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        while self.buffer.len() < self.capacity {
            match self.source.next() {
                Some(item) => self.buffer.push(item),
                None => break,
            }
        }
        if self.buffer.is_empty() {
            return None;
        }
        let index = self.rng.random_range(0..self.buffer.len());
        Some(self.buffer.swap_remove(index))
    }
}

/// One split: path pairs plus the transforms and batching applied to them.
pub struct SegmentationDataset {
    pairs: Vec<PathPair>,
    transforms: TransformPipeline,
    batch_size: usize,
    shuffle_buffer: Option<usize>,
    seed: Option<u64>,
    pool: Arc<ThreadPool>,
}

impl SegmentationDataset {
    pub fn new(
        pairs: Vec<PathPair>,
        transforms: TransformPipeline,
        batch_size: usize,
        pool: Arc<ThreadPool>,
    ) -> Self {
        Self {
            pairs,
            transforms,
            batch_size: batch_size.max(1),
            shuffle_buffer: None,
            seed: None,
            pool,
        }
    }

    pub fn with_shuffle(mut self, buffer_size: usize) -> Self {
        self.shuffle_buffer = Some(buffer_size);
        self
    }

    /// Makes shuffling and augmentation reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn pairs(&self) -> &[PathPair] {
        &self.pairs
    }

    pub fn transforms(&self) -> &TransformPipeline {
        &self.transforms
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn num_batches(&self) -> usize {
        self.pairs.len().div_ceil(self.batch_size)
    }

    /// Batches of the first epoch.
    pub fn iter(&self) -> BatchIter<'_> {
        self.epoch(0)
    }

    /// Batches of the given epoch. Each epoch reshuffles.
    pub fn epoch(&self, epoch: u64) -> BatchIter<'_> {
        let order: Box<dyn Iterator<Item = (usize, &PathPair)> + '_> = match self.shuffle_buffer {
            Some(capacity) => {
                let rng = self.rng(SHUFFLE_STREAM, epoch, 0);
                Box::new(ShuffleBuffer::new(self.pairs.iter().enumerate(), capacity, rng))
            }
            None => Box::new(self.pairs.iter().enumerate()),
        };
        BatchIter {
            dataset: self,
            order,
            epoch,
            batch_index: 0,
        }
    }

    fn rng(&self, stream: u64, epoch: u64, position: u64) -> StdRng {
        match self.seed {
            Some(seed) => {
                let key = [seed, stream, epoch, position].into_iter().fold(0u64, |h, v| {
                    (h ^ v).wrapping_mul(0x9E37_79B9_7F4A_7C15).rotate_left(29)
                });
                StdRng::seed_from_u64(key)
            }
            None => StdRng::from_rng(&mut rand::rng()),
        }
    }

    fn load(&self, epoch: u64, position: usize, pair: &PathPair) -> Result<Sample> {
        let (image_path, mask_path) = pair;
        let sample = read_sample(image_path, mask_path)?;
        let mut rng = self.rng(SAMPLE_STREAM, epoch, position as u64);
        self.transforms.apply(sample, &mut rng)
    }
}

/// Lazily decodes, augments and stacks one batch per call to `next`.
pub struct BatchIter<'a> {
    dataset: &'a SegmentationDataset,
    order: Box<dyn Iterator<Item = (usize, &'a PathPair)> + 'a>,
    epoch: u64,
    batch_index: usize,
}

impl Iterator for BatchIter<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk: Vec<(usize, &PathPair)> =
            self.order.by_ref().take(self.dataset.batch_size).collect();
        if chunk.is_empty() {
            return None;
        }

        let dataset = self.dataset;
        let epoch = self.epoch;
        let samples = dataset.pool.install(|| {
            chunk
                .par_iter()
                .map(|(position, pair)| dataset.load(epoch, *position, pair))
                .collect::<Result<Vec<_>>>()
        });

        debug!(
            batch = self.batch_index,
            size = chunk.len(),
            "assembled batch"
        );
        self.batch_index += 1;
        Some(samples.and_then(Batch::from_samples))
    }
}

/// The three pipelines used for a training run.
pub struct Datasets {
    pub train: SegmentationDataset,
    pub validation: SegmentationDataset,
    pub test: SegmentationDataset,
}

pub fn worker_pool(parallel_calls: usize) -> Result<Arc<ThreadPool>> {
    ThreadPoolBuilder::new()
        .num_threads(parallel_calls)
        .thread_name(|i| format!("hemp-seg-worker-{i}"))
        .build()
        .map(Arc::new)
        .map_err(|e| HempSegError::Configuration {
            message: format!("failed to start worker pool: {e}"),
        })
}

/// Builds the train (shuffled, augmented), validation (central crop) and test
/// (decode only) pipelines, seeded from `config.seed`.
pub fn create_datasets(
    train: &SplitSource,
    validation: &SplitSource,
    test: &SplitSource,
    buffer_size: usize,
    batch_size: usize,
    config: &Config,
) -> Result<Datasets> {
    assemble(
        train.pairs()?,
        validation.pairs()?,
        test.pairs()?,
        buffer_size,
        batch_size,
        config,
    )
}

/// Like [`create_datasets`], but carves the validation split out of `labelled`
/// by `config.train_fraction` and takes buffer and batch sizes from `config`.
pub fn split_datasets(
    labelled: &SplitSource,
    test: &SplitSource,
    config: &Config,
) -> Result<Datasets> {
    let (train, validation) =
        train_val_split(labelled.pairs()?, config.train_fraction, config.seed);
    assemble(
        train,
        validation,
        test.pairs()?,
        config.buffer_size,
        config.batch_size,
        config,
    )
}

fn assemble(
    train: Vec<PathPair>,
    validation: Vec<PathPair>,
    test: Vec<PathPair>,
    buffer_size: usize,
    batch_size: usize,
    config: &Config,
) -> Result<Datasets> {
    config.validate()?;
    let pool = worker_pool(config.parallel_calls)?;

    let train = SegmentationDataset::new(
        train,
        TransformPipeline::train(config),
        batch_size,
        Arc::clone(&pool),
    )
    .with_shuffle(buffer_size)
    .with_seed(config.seed);
    let validation = SegmentationDataset::new(
        validation,
        TransformPipeline::validation(config),
        batch_size,
        Arc::clone(&pool),
    )
    .with_seed(config.seed);
    let test = SegmentationDataset::new(test, TransformPipeline::test(), batch_size, pool);

    info!(
        train = train.len(),
        validation = validation.len(),
        test = test.len(),
        batch_size,
        seed = config.seed,
        "datasets ready"
    );

    Ok(Datasets {
        train,
        validation,
        test,
    })
}
