//! Batching and asynchronous prefetch over a token-block dataset

use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use runtime_core::{Epoch, Error, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::epoch::EpochSampler;

/// Token ids of one fixed-length training example
pub type TokenBlock = Vec<u32>;

/// Random-access dataset of pre-tokenized fixed-length blocks
pub trait BatchSource: Send + Sync {
    /// Number of blocks
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tokens per block
    fn seq_length(&self) -> usize;

    /// Block at `index`
    fn get(&self, index: usize) -> Result<TokenBlock>;
}

/// Blocks held in memory
#[derive(Debug, Clone)]
pub struct InMemoryTokenDataset {
    blocks: Vec<TokenBlock>,
    seq_length: usize,
}

impl InMemoryTokenDataset {
    /// Concatenated token stream cut into `seq_length` blocks. The tail that
    /// does not fill a block is dropped.
    pub fn from_token_stream(tokens: &[u32], seq_length: usize) -> Result<Self> {
        if seq_length == 0 {
            return Err(Error::InvalidDataset {
                message: "seq_length must be positive".to_string(),
            });
        }
        let blocks: Vec<TokenBlock> = tokens
            .chunks_exact(seq_length)
            .map(|chunk| chunk.to_vec())
            .collect();
        if blocks.is_empty() {
            return Err(Error::InvalidDataset {
                message: format!(
                    "{} tokens are not enough for one block of {}",
                    tokens.len(),
                    seq_length
                ),
            });
        }
        Ok(Self { blocks, seq_length })
    }

    /// Uniform random tokens, reproducible from `seed`
    pub fn synthetic(num_blocks: usize, seq_length: usize, vocab_size: u32, seed: u64) -> Result<Self> {
        if vocab_size == 0 {
            return Err(Error::InvalidDataset {
                message: "vocab_size must be positive".to_string(),
            });
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let tokens: Vec<u32> = (0..num_blocks * seq_length)
            .map(|_| rng.gen_range(0..vocab_size))
            .collect();
        Self::from_token_stream(&tokens, seq_length)
    }
}

impl BatchSource for InMemoryTokenDataset {
    fn len(&self) -> usize {
        self.blocks.len()
    }

    fn seq_length(&self) -> usize {
        self.seq_length
    }

    fn get(&self, index: usize) -> Result<TokenBlock> {
        self.blocks
            .get(index)
            .cloned()
            .ok_or_else(|| Error::InvalidDataset {
                message: format!("block {} out of range ({} blocks)", index, self.blocks.len()),
            })
    }
}

/// One step's worth of examples for this rank
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Position of the batch within its epoch
    pub index: usize,

    /// Dataset indices of the examples
    pub sample_indices: Vec<usize>,

    /// Input tokens, one row per example. Labels are the same tokens; the
    /// model shifts them.
    pub input_ids: Vec<TokenBlock>,
}

impl Batch {
    pub fn batch_size(&self) -> usize {
        self.input_ids.len()
    }

    pub fn num_tokens(&self) -> usize {
        self.input_ids.iter().map(Vec::len).sum()
    }
}

/// Splits this rank's epoch partition into batches and prefetches them
pub struct DataLoader {
    source: Arc<dyn BatchSource>,
    sampler: Arc<EpochSampler>,
    batch_size: usize,
    prefetch_depth: usize,
}

impl DataLoader {
    pub fn new(
        source: Arc<dyn BatchSource>,
        sampler: EpochSampler,
        batch_size: usize,
        prefetch_depth: usize,
    ) -> Result<Self> {
        if batch_size == 0 || prefetch_depth == 0 {
            return Err(Error::InvalidConfig {
                message: "batch_size and prefetch_depth must be positive".to_string(),
            });
        }
        let loader = Self {
            source,
            sampler: Arc::new(sampler),
            batch_size,
            prefetch_depth,
        };
        if loader.len() == 0 {
            return Err(Error::InvalidDataset {
                message: format!(
                    "{} blocks over {} replicas leave rank {} with no batches",
                    loader.source.len(),
                    loader.sampler.num_replicas(),
                    loader.sampler.rank()
                ),
            });
        }
        Ok(loader)
    }

    /// Batches per epoch. The last batch may be short.
    pub fn len(&self) -> usize {
        self.sampler.num_samples().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn seq_length(&self) -> usize {
        self.source.seq_length()
    }

    /// Index lists of every batch of `epoch`, in order
    pub fn batch_indices(&self, epoch: Epoch) -> Vec<Vec<usize>> {
        self.sampler
            .indices(epoch)
            .chunks(self.batch_size)
            .map(<[usize]>::to_vec)
            .collect()
    }

    /// Start prefetching `epoch`. Must be called inside a Tokio runtime.
    pub fn epoch(&self, epoch: Epoch) -> Prefetcher {
        let (tx, rx) = mpsc::channel(self.prefetch_depth);
        let batches = self.batch_indices(epoch);
        let source = Arc::clone(&self.source);
        self.sampler.evict_before(epoch);

        let task = tokio::spawn(async move {
            for (index, sample_indices) in batches.into_iter().enumerate() {
                let batch = sample_indices
                    .iter()
                    .map(|&i| source.get(i))
                    .collect::<Result<Vec<_>>>()
                    .map(|input_ids| Batch {
                        index,
                        sample_indices,
                        input_ids,
                    });
                let failed = batch.is_err();
                if tx.send(batch).await.is_err() {
                    debug!(epoch, index, "Prefetch consumer dropped");
                    return;
                }
                if failed {
                    warn!(epoch, index, "Stopping prefetch after a failed batch");
                    return;
                }
            }
        });

        Prefetcher {
            epoch,
            stream: ReceiverStream::new(rx),
            task,
        }
    }
}

/// Stream of prefetched batches for one epoch
pub struct Prefetcher {
    epoch: Epoch,
    stream: ReceiverStream<Result<Batch>>,
    task: JoinHandle<()>,
}

impl Prefetcher {
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Next batch, or `None` at the end of the epoch
    pub async fn next_batch(&mut self) -> Option<Result<Batch>> {
        self.stream.next().await
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}
