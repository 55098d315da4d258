//! On-disk layout of an experiment directory

use runtime_core::Rank;
use serde::{Deserialize, Serialize};

use crate::writer::ShardKind;

/// Commit marker, written last
pub const STATE_FILE: &str = "state.json";

/// Scheduler state, shared by every rank
pub const SCHEDULER_FILE: &str = "lr_scheduler.pt";

/// Whole-model state for the single-process layout
pub const MODEL_FILE: &str = "model.pt";

/// Whole-optimizer state for the single-process layout
pub const OPTIMIZER_FILE: &str = "optimizer.pt";

/// Directory holding per-rank shards in the sharded layout
pub const SHARD_DIR: &str = "checkpoint";

/// Sharded checkpoint metadata, relative to the experiment directory
pub const METADATA_FILE: &str = "checkpoint/.metadata";

/// How checkpoint files are arranged under the experiment directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointLayout {
    /// One process owns the whole model: `model.pt`, `optimizer.pt`
    Simple,

    /// Each rank owns a shard: `checkpoint/model-rank00003.bin`
    Sharded { world_size: usize, tp: usize },
}

impl CheckpointLayout {
    /// File holding `kind` state written by `rank`
    pub fn shard_file(&self, kind: ShardKind, rank: Rank) -> String {
        match (self, kind) {
            (_, ShardKind::Scheduler) => SCHEDULER_FILE.to_string(),
            (CheckpointLayout::Simple, ShardKind::Model) => MODEL_FILE.to_string(),
            (CheckpointLayout::Simple, ShardKind::Optimizer) => OPTIMIZER_FILE.to_string(),
            (CheckpointLayout::Sharded { .. }, kind) => {
                format!("{}/{}-rank{:05}.bin", SHARD_DIR, kind.file_stem(), rank)
            }
        }
    }

    /// Whether every rank persists its own model and optimizer state
    pub fn is_sharded(&self) -> bool {
        matches!(self, CheckpointLayout::Sharded { .. })
    }

    /// Every file, other than `state.json`, that a committed checkpoint has
    pub fn required_files(&self) -> Vec<String> {
        match self {
            CheckpointLayout::Simple => vec![
                MODEL_FILE.to_string(),
                OPTIMIZER_FILE.to_string(),
                SCHEDULER_FILE.to_string(),
            ],
            CheckpointLayout::Sharded { world_size, .. } => {
                let mut files = Vec::with_capacity(2 * world_size + 2);
                files.push(METADATA_FILE.to_string());
                for rank in 0..*world_size {
                    files.push(self.shard_file(ShardKind::Model, rank));
                    files.push(self.shard_file(ShardKind::Optimizer, rank));
                }
                files.push(SCHEDULER_FILE.to_string());
                files
            }
        }
    }
}

/// Contents of `checkpoint/.metadata`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardedMetadata {
    pub format_version: u32,
    pub world_size: usize,
    pub tp: usize,
    pub global_step: u64,
    pub saved_at: chrono::DateTime<chrono::Utc>,
}
