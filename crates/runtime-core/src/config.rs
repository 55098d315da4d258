//! Training run configuration

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Upper bound applied when the requested sequence length exceeds the model's
/// positional range
const FALLBACK_SEQ_LENGTH: usize = 1024;

/// Main training configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Identifies the run and its checkpoint directory
    pub experiment_name: String,

    /// Dataset identifier
    pub dataset_name: String,

    /// Model identifier
    pub model_name: String,

    /// Root directory under which the experiment directory lives
    pub save_dir: PathBuf,

    /// Random seed for weight init and data shuffling
    pub seed: u64,

    /// Number of epochs to train
    pub num_epochs: u64,

    /// Peak learning rate
    pub lr: f64,

    /// Per-rank batch size
    pub batch_size: usize,

    /// Emit a metrics record every N global steps
    pub log_freq: u64,

    /// Persist a checkpoint every N global steps
    pub ckpt_freq: u64,

    /// Sequence length, derived from the model limits when unset
    pub seq_length: Option<usize>,

    /// Tensor-parallel degree (sharded variant only, must be > 1)
    pub tp: Option<usize>,

    /// Depth of the per-rank batch prefetch queue
    pub prefetch_depth: usize,

    /// Whether the save directory is shared by every host. Detected from the
    /// mount table when unset.
    pub shared_save_dir: Option<bool>,

    /// Number of Tokio worker threads
    pub io_threads: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            experiment_name: String::new(),
            dataset_name: String::new(),
            model_name: String::new(),
            save_dir: PathBuf::from("."),
            seed: 0,
            num_epochs: 100,
            lr: 3e-5,
            batch_size: 1,
            log_freq: 100,
            ckpt_freq: 500,
            seq_length: None,
            tp: None,
            prefetch_depth: 2,
            shared_save_dir: None,
            io_threads: 2,
        }
    }
}

impl TrainingConfig {
    /// Load a configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check required fields and value ranges
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("experiment_name", &self.experiment_name),
            ("dataset_name", &self.dataset_name),
            ("model_name", &self.model_name),
        ] {
            if value.trim().is_empty() {
                return Err(Error::InvalidConfig {
                    message: format!("{} is required", field),
                });
            }
        }

        if self.batch_size == 0 {
            return Err(Error::InvalidConfig {
                message: "batch_size must be positive".to_string(),
            });
        }
        if self.log_freq == 0 || self.ckpt_freq == 0 {
            return Err(Error::InvalidConfig {
                message: "log_freq and ckpt_freq must be positive".to_string(),
            });
        }
        if self.prefetch_depth == 0 {
            return Err(Error::InvalidConfig {
                message: "prefetch_depth must be positive".to_string(),
            });
        }
        if let Some(tp) = self.tp {
            if tp <= 1 {
                return Err(Error::InvalidConfig {
                    message: format!("tensor parallelism requires tp > 1, got {}", tp),
                });
            }
        }
        Ok(())
    }

    /// Directory holding every artifact of this run
    pub fn experiment_dir(&self) -> PathBuf {
        self.save_dir.join(&self.experiment_name)
    }

    /// Resolve the sequence length against the model's positional range
    pub fn effective_seq_length(&self, max_positions: usize) -> usize {
        let requested = self.seq_length.unwrap_or(max_positions);
        if requested > max_positions {
            FALLBACK_SEQ_LENGTH.min(max_positions)
        } else {
            requested
        }
    }
}
