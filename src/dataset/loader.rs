//! Batch loader.
//!
//! Walks a sampler's permutation of an [`AlignedDataset`] in fixed-size
//! batches, assembling `prefetch_batches` batches at a time on a rayon pool.
//! Results are collected in batch order, so the worker count never changes
//! which samples land in which batch.

use crate::dataset::aligned::AlignedDataset;
use crate::dataset::collate::collate_full;
use crate::dataset::config::LoaderConfig;
use crate::dataset::record::Record;
use crate::dataset::sample::Sample;
use crate::dataset::sampler::Sampler;
use anyhow::{Context, Result};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Per-sample tensor dimensions, read from the first sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderShape {
    pub channels: usize,
    pub past_len: usize,
    pub future_len: usize,
    pub feature_dim: usize,
}

pub struct BatchLoader<'a, R: Record> {
    dataset: &'a AlignedDataset<R>,
    sampler: Sampler,
    config: LoaderConfig,
    pool: ThreadPool,
    order: Vec<usize>,
    shape: LoaderShape,
}

impl<'a, R: Record> BatchLoader<'a, R> {
    pub fn new(
        dataset: &'a AlignedDataset<R>,
        sampler: Sampler,
        config: &LoaderConfig,
    ) -> Result<Self> {
        config.validate()?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .build()
            .context("building loader thread pool")?;

        let shape = first_sample_shape(dataset)?;
        if shape.channels > config.channel_warn_threshold {
            warn!(
                channels = shape.channels,
                threshold = config.channel_warn_threshold,
                "unusually high channel count; batches will be large"
            );
        }

        let order = sampler.indices(dataset.size());
        debug!(
            samples = order.len(),
            batch_size = config.batch_size,
            workers = config.workers,
            random = sampler.is_random(),
            "loader ready"
        );
        Ok(Self {
            dataset,
            sampler,
            config: config.clone(),
            pool,
            order,
            shape,
        })
    }

    /// Loader whose ordering comes from `config.shuffle` / `config.seed`.
    pub fn from_config(dataset: &'a AlignedDataset<R>, config: &LoaderConfig) -> Result<Self> {
        let sampler = if config.shuffle {
            Sampler::random(config.seed)
        } else {
            Sampler::sequential()
        };
        Self::new(dataset, sampler, config)
    }

    pub fn shape(&self) -> LoaderShape {
        self.shape
    }

    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    pub fn drop_last(&self) -> bool {
        self.config.drop_last
    }

    /// Batches per epoch.
    pub fn len(&self) -> usize {
        let n = self.order.len();
        let bs = self.config.batch_size;
        if self.config.drop_last {
            n / bs
        } else {
            n.div_ceil(bs)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start a new epoch; random samplers move to their next permutation.
    pub fn reset(&mut self) {
        self.sampler.advance_epoch();
        self.order = self.sampler.indices(self.dataset.size());
    }

    /// Restart a random ordering from epoch 0 under `seed`.
    pub fn reseed(&mut self, seed: u64) {
        self.sampler.reseed(seed);
        self.order = self.sampler.indices(self.dataset.size());
        debug!(seed, random = self.sampler.is_random(), "loader reseeded");
    }

    /// Iterate the current epoch. Iteration stops after the first error.
    pub fn iter(&self) -> Batches<'_, 'a, R> {
        Batches {
            loader: self,
            next_batch: 0,
            ready: VecDeque::new(),
            failed: false,
        }
    }

    fn batch_indices(&self, batch: usize) -> &[usize] {
        let bs = self.config.batch_size;
        let start = batch * bs;
        let end = (start + bs).min(self.order.len());
        &self.order[start..end]
    }

    fn assemble(&self, batch: usize) -> Result<Sample> {
        let samples = self
            .batch_indices(batch)
            .iter()
            .map(|&i| {
                self.dataset
                    .get(i)
                    .with_context(|| format!("loading sample {}", i))
            })
            .collect::<Result<Vec<_>>>()?;
        collate_full(&samples).with_context(|| format!("collating batch {}", batch))
    }
}

impl<'l, 'a, R: Record> IntoIterator for &'l BatchLoader<'a, R> {
    type Item = Result<Sample>;
    type IntoIter = Batches<'l, 'a, R>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

fn first_sample_shape<R: Record>(dataset: &AlignedDataset<R>) -> Result<LoaderShape> {
    if dataset.is_empty() {
        return Ok(LoaderShape::default());
    }
    let first = dataset.get(0).context("reading loader shape")?;
    let past = first.past.as_ref();
    let past_len = past.map(|w| w.len()).unwrap_or(0);
    let future_len = first.future.as_ref().map(|w| w.len()).unwrap_or(0);
    let feature_dim = past
        .and_then(|w| w.features.shape().last().copied())
        .unwrap_or(0);
    Ok(LoaderShape {
        channels: first.channels(),
        past_len,
        future_len,
        feature_dim,
    })
}

/// Iterator over one epoch of batches.
pub struct Batches<'l, 'a, R: Record> {
    loader: &'l BatchLoader<'a, R>,
    next_batch: usize,
    ready: VecDeque<Result<Sample>>,
    failed: bool,
}

impl<R: Record> Batches<'_, '_, R> {
    fn prefetch(&mut self) {
        let loader = self.loader;
        let end = (self.next_batch + loader.config.prefetch_batches).min(loader.len());
        let batches: Vec<usize> = (self.next_batch..end).collect();
        self.next_batch = end;
        let built: Vec<Result<Sample>> = loader
            .pool
            .install(|| batches.par_iter().map(|&b| loader.assemble(b)).collect());
        self.ready.extend(built);
    }
}

impl<R: Record> Iterator for Batches<'_, '_, R> {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.ready.is_empty() {
            self.prefetch();
        }
        let item = self.ready.pop_front()?;
        if item.is_err() {
            self.failed = true;
            self.ready.clear();
        }
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.loader.len().saturating_sub(self.next_batch) + self.ready.len();
        (0, Some(left))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::config::{DatasetConfig, SanitizeConfig};
    use crate::dataset::record::Scalar;
    use crate::dataset::sanitize::write_records;
    use tempfile::tempdir;

    fn dataset(dir: &std::path::Path, n: usize) -> AlignedDataset<Scalar> {
        let path = dir.join("s.bin");
        let records: Vec<Scalar> = (0..n)
            .map(|i| Scalar::new(i as f64, i as f64 * 10.0))
            .collect();
        write_records(&path, &records).unwrap();
        let mut ds = AlignedDataset::new(SanitizeConfig::default(), DatasetConfig::default());
        ds.add_dataset(&path, 2, 1, 0, false).unwrap();
        ds
    }

    fn anchors(batch: &Sample) -> Vec<f64> {
        batch.anchor_key.as_ref().unwrap().iter().copied().collect()
    }

    #[test]
    fn test_sequential_batches_cover_dataset() {
        let dir = tempdir().unwrap();
        let ds = dataset(dir.path(), 12);
        // anchors 1..=10
        assert_eq!(ds.size(), 10);
        let cfg = LoaderConfig {
            batch_size: 4,
            ..LoaderConfig::default()
        };
        let loader = BatchLoader::new(&ds, Sampler::sequential(), &cfg).unwrap();
        assert_eq!(loader.len(), 3);
        let batches: Vec<Sample> = loader.iter().map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].batch_len(), 2);
        let keys: Vec<f64> = batches.iter().flat_map(anchors).collect();
        assert_eq!(keys, (1..=10).map(|k| k as f64).collect::<Vec<_>>());
    }

    #[test]
    fn test_drop_last() {
        let dir = tempdir().unwrap();
        let ds = dataset(dir.path(), 12);
        let cfg = LoaderConfig {
            batch_size: 4,
            drop_last: true,
            ..LoaderConfig::default()
        };
        let loader = BatchLoader::new(&ds, Sampler::sequential(), &cfg).unwrap();
        assert_eq!(loader.len(), 2);
        assert!(loader.iter().all(|b| b.unwrap().batch_len() == 4));
    }

    #[test]
    fn test_worker_count_does_not_change_content() {
        let dir = tempdir().unwrap();
        let ds = dataset(dir.path(), 40);
        let run = |workers: usize| -> Vec<f64> {
            let cfg = LoaderConfig {
                batch_size: 5,
                workers,
                prefetch_batches: 3,
                ..LoaderConfig::default()
            };
            let loader = BatchLoader::new(&ds, Sampler::random(9), &cfg).unwrap();
            loader.iter().flat_map(|b| anchors(&b.unwrap())).collect()
        };
        assert_eq!(run(1), run(4));
    }

    #[test]
    fn test_reset_reshuffles_random_order() {
        let dir = tempdir().unwrap();
        let ds = dataset(dir.path(), 40);
        let cfg = LoaderConfig {
            batch_size: 64,
            ..LoaderConfig::default()
        };
        let mut loader = BatchLoader::new(&ds, Sampler::random(3), &cfg).unwrap();
        let first: Vec<f64> = loader.iter().flat_map(|b| anchors(&b.unwrap())).collect();
        loader.reset();
        let second: Vec<f64> = loader.iter().flat_map(|b| anchors(&b.unwrap())).collect();
        assert_ne!(first, second);

        let (mut a, mut b) = (first.clone(), second.clone());
        a.sort_by(f64::total_cmp);
        b.sort_by(f64::total_cmp);
        assert_eq!(a, b);
    }

    #[test]
    fn test_reseed_matches_fresh_loader() {
        let dir = tempdir().unwrap();
        let ds = dataset(dir.path(), 40);
        let cfg = LoaderConfig {
            batch_size: 8,
            ..LoaderConfig::default()
        };
        let drain = |loader: &BatchLoader<'_, Scalar>| -> Vec<f64> {
            loader.iter().flat_map(|b| anchors(&b.unwrap())).collect()
        };

        let mut loader = BatchLoader::new(&ds, Sampler::random(1), &cfg).unwrap();
        assert_eq!(loader.batch_size(), 8);
        loader.reset();
        loader.reseed(21);
        assert_eq!(loader.sampler(), &Sampler::random(21));

        let fresh = BatchLoader::new(&ds, Sampler::random(21), &cfg).unwrap();
        assert_eq!(drain(&loader), drain(&fresh));

        let other = BatchLoader::new(&ds, Sampler::random(1), &cfg).unwrap();
        assert_ne!(drain(&loader), drain(&other));
    }

    #[test]
    fn test_shape_from_first_sample() {
        let dir = tempdir().unwrap();
        let ds = dataset(dir.path(), 12);
        let loader = BatchLoader::from_config(&ds, &LoaderConfig::default()).unwrap();
        assert_eq!(
            loader.shape(),
            LoaderShape {
                channels: 1,
                past_len: 2,
                future_len: 1,
                feature_dim: 1,
            }
        );
    }

    #[test]
    fn test_empty_dataset_zero_shape() {
        let ds: AlignedDataset<Scalar> =
            AlignedDataset::new(SanitizeConfig::default(), DatasetConfig::default());
        let cfg = LoaderConfig::default();
        let loader = BatchLoader::new(&ds, Sampler::sequential(), &cfg).unwrap();
        assert_eq!(loader.shape(), LoaderShape::default());
        assert!(loader.is_empty());
        assert_eq!(loader.iter().count(), 0);
    }
}
