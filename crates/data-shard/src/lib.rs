//! Data sharding for distributed training
//!
//! This crate provides:
//! - **Epoch sampling**: a deterministic, seed-and-epoch keyed shuffle split
//!   into disjoint per-replica partitions
//! - **Batch sources**: random access to fixed-length token blocks
//! - **Loading**: batching plus a bounded async prefetch queue per rank
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use data_shard::{DataLoader, EpochSampler, InMemoryTokenDataset, SamplerConfig};
//!
//! # fn main() -> runtime_core::Result<()> {
//! let dataset = Arc::new(InMemoryTokenDataset::synthetic(128, 16, 1000, 0)?);
//! // rank 1 of 4 data-parallel replicas
//! let sampler = EpochSampler::new(128, 4, 1, SamplerConfig::default())?;
//! let loader = DataLoader::new(dataset, sampler, 8, 2)?;
//! assert_eq!(loader.len(), 4);
//! # Ok(())
//! # }
//! ```

mod epoch;
mod loader;

pub use epoch::{EpochSampler, SamplerConfig};
pub use loader::{Batch, BatchSource, DataLoader, InMemoryTokenDataset, Prefetcher, TokenBlock};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Every data-parallel replica draws a disjoint slice of the same epoch
    #[tokio::test]
    async fn test_replicas_load_disjoint_batches() {
        let dataset = Arc::new(InMemoryTokenDataset::synthetic(96, 4, 100, 3).unwrap());
        let config = SamplerConfig {
            seed: 11,
            ..Default::default()
        };

        let mut seen = Vec::new();
        for rank in 0..3 {
            let sampler = EpochSampler::new(dataset.len(), 3, rank, config).unwrap();
            let loader = DataLoader::new(dataset.clone(), sampler, 4, 2).unwrap();
            assert_eq!(loader.len(), 8);

            let mut prefetcher = loader.epoch(2);
            while let Some(batch) = prefetcher.next_batch().await {
                seen.extend(batch.unwrap().sample_indices);
            }
        }

        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 96);
    }
}
