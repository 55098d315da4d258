//! Token dataset preparation
//!
//! Tokenized corpora are cached under `.cache/` in the storage root. On each
//! host the local leader builds the cache first; the other processes then
//! read what it wrote instead of racing to build it themselves.

use bytes::Bytes;
use data_shard::InMemoryTokenDataset;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use runtime_core::{ClusterTopology, Error, ProcessGroup, RankOrdered, Result};
use serde::{Deserialize, Serialize};
use storage::StorageBackend;
use tracing::info;

/// Cache directory, relative to the storage root
pub const CACHE_DIR: &str = ".cache";

/// Generated corpus: a noisy token chain whose next token mostly depends on
/// the previous one, so a bigram model can learn it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticCorpus {
    pub num_tokens: usize,
    pub vocab_size: u32,
}

impl Default for SyntheticCorpus {
    fn default() -> Self {
        Self {
            num_tokens: 1 << 16,
            vocab_size: 256,
        }
    }
}

impl SyntheticCorpus {
    pub fn generate(&self, seed: u64) -> Result<Vec<u32>> {
        if self.vocab_size == 0 {
            return Err(Error::InvalidDataset {
                message: "vocab_size must be positive".to_string(),
            });
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut previous = 0u32;
        Ok((0..self.num_tokens)
            .map(|_| {
                previous = if rng.gen_bool(0.9) {
                    (previous.wrapping_mul(31).wrapping_add(7)) % self.vocab_size
                } else {
                    rng.gen_range(0..self.vocab_size)
                };
                previous
            })
            .collect())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenCache {
    dataset_name: String,
    vocab_size: u32,
    tokens: Vec<u32>,
}

fn cache_path(dataset_name: &str) -> String {
    format!("{}/{}.tokens.json", CACHE_DIR, dataset_name)
}

async fn load_or_build(
    storage: &dyn StorageBackend,
    dataset_name: &str,
    corpus: SyntheticCorpus,
    seed: u64,
) -> Result<Vec<u32>> {
    let path = cache_path(dataset_name);
    if storage.exists(&path).await? {
        let raw = storage.read(&path).await?;
        let cache: TokenCache = serde_json::from_slice(&raw)?;
        if cache.dataset_name != dataset_name || cache.vocab_size != corpus.vocab_size {
            return Err(Error::InvalidDataset {
                message: format!(
                    "cache {} holds {} with vocab {}, expected {} with vocab {}",
                    storage.describe(&path),
                    cache.dataset_name,
                    cache.vocab_size,
                    dataset_name,
                    corpus.vocab_size
                ),
            });
        }
        info!(dataset = dataset_name, tokens = cache.tokens.len(), "Loaded token cache");
        return Ok(cache.tokens);
    }

    let cache = TokenCache {
        dataset_name: dataset_name.to_string(),
        vocab_size: corpus.vocab_size,
        tokens: corpus.generate(seed)?,
    };
    storage
        .write(&path, Bytes::from(serde_json::to_vec(&cache)?))
        .await?;
    info!(
        dataset = dataset_name,
        tokens = cache.tokens.len(),
        cache = %storage.describe(&path),
        "Built token cache"
    );
    Ok(cache.tokens)
}

/// Load `dataset_name` cut into `seq_length` blocks. Collective: the local
/// leader runs first, then every other process of the host.
pub async fn prepare_token_dataset(
    storage: &dyn StorageBackend,
    group: &dyn ProcessGroup,
    topology: &ClusterTopology,
    dataset_name: &str,
    corpus: SyntheticCorpus,
    seed: u64,
    seq_length: usize,
) -> Result<InMemoryTokenDataset> {
    let ordered = RankOrdered::new(group, topology.is_local_leader());
    let tokens = ordered
        .run(|| load_or_build(storage, dataset_name, corpus, seed))
        .await?;
    InMemoryTokenDataset::from_token_stream(&tokens, seq_length)
}
