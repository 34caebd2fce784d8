//! Batch iteration over an [`ImageFolder`] with parallel decoding
//!
//! Each batch is decoded on a dedicated rayon pool of `workers` threads;
//! everything else runs on the caller's thread.

use std::sync::Arc;

use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};

use crate::dataset::ImageFolder;

/// Batching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub batch_size: usize,
    /// Reshuffle sample order every epoch
    pub shuffle: bool,
    /// Decode threads
    pub workers: usize,
    /// Drop the trailing incomplete batch
    pub drop_last: bool,
    pub seed: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            shuffle: true,
            workers: 4,
            drop_last: false,
            seed: 42,
        }
    }
}

/// A batch of images `(B, 3, H, W)` and labels `(B,)`, both on CPU
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Tensor,
    pub labels: Tensor,
    /// Dataset indices of the batch members
    pub indices: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Move images and labels to `device`
    pub fn to_device(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        Ok((self.images.to_device(device)?, self.labels.to_device(device)?))
    }
}

/// Produces batches from a dataset
pub struct DataLoader {
    dataset: Arc<ImageFolder>,
    config: LoaderConfig,
    pool: ThreadPool,
}

impl DataLoader {
    pub fn new(dataset: Arc<ImageFolder>, config: LoaderConfig) -> Result<Self> {
        anyhow::ensure!(config.batch_size > 0, "batch_size must be positive");
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers.max(1))
            .thread_name(|i| format!("iba-loader-{i}"))
            .build()?;
        Ok(Self {
            dataset,
            config,
            pool,
        })
    }

    pub fn dataset(&self) -> &ImageFolder {
        &self.dataset
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Number of batches per epoch
    pub fn n_batches(&self) -> usize {
        let n = self.dataset.len();
        let bs = self.config.batch_size;
        if self.config.drop_last {
            n / bs
        } else {
            n.div_ceil(bs)
        }
    }

    /// Sample order for an epoch (seeded, so reproducible)
    pub fn epoch_order(&self, epoch: u64) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.config.shuffle {
            let mut rng =
                rand::rngs::StdRng::seed_from_u64(self.config.seed.wrapping_add(epoch));
            order.shuffle(&mut rng);
        }
        order
    }

    /// Iterate over the batches of one epoch
    pub fn iter(&self, epoch: u64) -> BatchIter<'_> {
        let order = self.epoch_order(epoch);
        let mut chunks: Vec<Vec<usize>> = order
            .chunks(self.config.batch_size)
            .map(<[usize]>::to_vec)
            .collect();
        if self.config.drop_last {
            chunks.retain(|c| c.len() == self.config.batch_size);
        }
        BatchIter {
            loader: self,
            chunks: chunks.into_iter(),
        }
    }

    fn load_batch(&self, indices: Vec<usize>) -> Result<Batch> {
        let dataset = &self.dataset;
        let items: Vec<(Tensor, u32)> = self
            .pool
            .install(|| {
                indices
                    .par_iter()
                    .map(|&i| dataset.get(i))
                    .collect::<Result<Vec<_>>>()
            })?;

        let (images, labels): (Vec<Tensor>, Vec<u32>) = items.into_iter().unzip();
        let images = Tensor::stack(&images, 0)?;
        let labels = Tensor::new(labels.as_slice(), &Device::Cpu)?;
        Ok(Batch {
            images,
            labels,
            indices,
        })
    }
}

/// Iterator over one epoch's batches
pub struct BatchIter<'a> {
    loader: &'a DataLoader,
    chunks: std::vec::IntoIter<Vec<usize>>,
}

impl Iterator for BatchIter<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let indices = self.chunks.next()?;
        Some(self.loader.load_batch(indices))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}
