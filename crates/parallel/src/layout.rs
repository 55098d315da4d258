//! Tensor layouts and tensor-parallel sharding policies

use serde::{Deserialize, Serialize};
use std::fmt;

/// Rank of the activations flowing between transformer blocks:
/// `[batch, sequence, hidden]`
pub const ACTIVATION_RANK: usize = 3;

/// Distribution of a tensor across the tp axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Layout {
    /// Every tp rank holds the whole tensor
    Replicate,

    /// Split along a dimension. Negative dims count from the end.
    Shard(i64),
}

impl Layout {
    /// Resolve negative shard dims against a tensor rank
    pub fn normalize(self, ndim: usize) -> Layout {
        match self {
            Layout::Shard(dim) if dim < 0 => Layout::Shard(ndim as i64 + dim),
            other => other,
        }
    }

    /// Equality after resolving negative dims
    pub fn matches(self, other: Layout, ndim: usize) -> bool {
        self.normalize(ndim) == other.normalize(ndim)
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layout::Replicate => f.write_str("Replicate"),
            Layout::Shard(dim) => write!(f, "Shard({})", dim),
        }
    }
}

/// How one named submodule is parallelized over the tp axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardingPolicy {
    /// Leave the module whole on every rank
    Replicate,

    /// Split the output features: each rank computes a slice of the output
    ColumnShard {
        input: Layout,
        output: Layout,
        /// Hand the local shard to the next module rather than a
        /// distributed tensor
        use_local_output: bool,
    },

    /// Split the input features: partial outputs are reduced across ranks
    RowShard {
        input: Layout,
        output: Layout,
        use_local_output: bool,
    },

    /// Run an elementwise module on sequence-sharded activations
    SequenceShard,

    /// Redistribute a container module's input before its children run
    PrepareInput { input: Layout, desired: Layout },
}

impl ShardingPolicy {
    /// Column split with replicated input and last-dim sharded output
    pub fn column() -> Self {
        ShardingPolicy::ColumnShard {
            input: Layout::Replicate,
            output: Layout::Shard(-1),
            use_local_output: true,
        }
    }

    /// Row split with last-dim sharded input and replicated output
    pub fn row() -> Self {
        ShardingPolicy::RowShard {
            input: Layout::Shard(-1),
            output: Layout::Replicate,
            use_local_output: true,
        }
    }

    /// Layout this module expects its input in
    pub fn input_layout(&self) -> Layout {
        match self {
            ShardingPolicy::Replicate => Layout::Replicate,
            ShardingPolicy::ColumnShard { input, .. } | ShardingPolicy::RowShard { input, .. } => {
                *input
            }
            ShardingPolicy::SequenceShard => Layout::Shard(1),
            ShardingPolicy::PrepareInput { input, .. } => *input,
        }
    }

    /// Layout this module hands downstream. For `PrepareInput` that is the
    /// redistributed layout its children receive.
    pub fn output_layout(&self) -> Layout {
        match self {
            ShardingPolicy::Replicate => Layout::Replicate,
            ShardingPolicy::ColumnShard { output, .. } | ShardingPolicy::RowShard { output, .. } => {
                *output
            }
            ShardingPolicy::SequenceShard => Layout::Shard(1),
            ShardingPolicy::PrepareInput { desired, .. } => *desired,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ShardingPolicy::Replicate => "replicate",
            ShardingPolicy::ColumnShard { .. } => "column",
            ShardingPolicy::RowShard { .. } => "row",
            ShardingPolicy::SequenceShard => "sequence",
            ShardingPolicy::PrepareInput { .. } => "prepare_input",
        }
    }
}

/// Where a parameter's storage lives on the tp axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterPlacement {
    Replicated,
    Sharded { dim: usize },
}
