//! Deterministic per-epoch partition of a dataset across data-parallel ranks
//!
//! Every replica shuffles the full index range with the same seed, pads or
//! truncates it to a multiple of the replica count, then takes every
//! `num_replicas`-th index starting at its own rank. The union over all
//! replicas covers the epoch and no two replicas share a position.

use dashmap::DashMap;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use runtime_core::{Epoch, Error, Rank, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Sampler options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Shuffle the order every epoch
    pub shuffle: bool,

    /// Drop the tail that does not divide evenly across replicas instead of
    /// padding with repeated samples
    pub drop_last: bool,

    /// Base seed; epoch `e` shuffles with `seed + e`
    pub seed: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            shuffle: true,
            drop_last: true,
            seed: 0,
        }
    }
}

/// Per-rank view of the epoch order
#[derive(Debug)]
pub struct EpochSampler {
    dataset_len: usize,
    num_replicas: usize,
    rank: Rank,
    config: SamplerConfig,

    /// epoch -> full shuffled order, shared by every replica in the process
    shuffle_cache: DashMap<Epoch, Arc<Vec<usize>>>,
}

impl EpochSampler {
    pub fn new(
        dataset_len: usize,
        num_replicas: usize,
        rank: Rank,
        config: SamplerConfig,
    ) -> Result<Self> {
        if num_replicas == 0 || rank >= num_replicas {
            return Err(Error::InvalidTopology {
                message: format!(
                    "sampler rank {} out of range for {} replicas",
                    rank, num_replicas
                ),
            });
        }
        Ok(Self {
            dataset_len,
            num_replicas,
            rank,
            config,
            shuffle_cache: DashMap::new(),
        })
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    /// Samples this replica sees per epoch
    pub fn num_samples(&self) -> usize {
        if self.config.drop_last {
            self.dataset_len / self.num_replicas
        } else {
            self.dataset_len.div_ceil(self.num_replicas)
        }
    }

    fn total_size(&self) -> usize {
        self.num_samples() * self.num_replicas
    }

    /// Full dataset order for `epoch`, before partitioning
    pub fn epoch_order(&self, epoch: Epoch) -> Arc<Vec<usize>> {
        if let Some(cached) = self.shuffle_cache.get(&epoch) {
            return Arc::clone(&cached);
        }

        let mut order: Vec<usize> = (0..self.dataset_len).collect();
        if self.config.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed.wrapping_add(epoch));
            order.shuffle(&mut rng);
        }

        let order = Arc::new(order);
        self.shuffle_cache.insert(epoch, Arc::clone(&order));
        tracing::debug!(
            epoch,
            dataset_len = self.dataset_len,
            shuffle = self.config.shuffle,
            "Generated epoch order"
        );
        order
    }

    /// Dataset indices owned by this replica in `epoch`, in visiting order
    pub fn indices(&self, epoch: Epoch) -> Vec<usize> {
        let order = self.epoch_order(epoch);
        let total = self.total_size();
        if order.is_empty() || total == 0 {
            return Vec::new();
        }

        // pad by cycling the order, or truncate the tail
        order
            .iter()
            .copied()
            .cycle()
            .take(total)
            .skip(self.rank)
            .step_by(self.num_replicas)
            .collect()
    }

    /// Forget cached orders before `epoch`
    pub fn evict_before(&self, epoch: Epoch) {
        self.shuffle_cache.retain(|cached, _| *cached >= epoch);
    }
}
