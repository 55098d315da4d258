//! Two-dimensional `(dp, tp)` device mesh

use runtime_core::{ClusterTopology, Error, Rank, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

use crate::device::Accelerator;

/// Position of a rank in the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeshCoordinate {
    pub dp_index: usize,
    pub tp_index: usize,
}

impl fmt::Display for MeshCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(dp={}, tp={})", self.dp_index, self.tp_index)
    }
}

/// `(world_size / tp) x tp` grid of ranks, row-major with tp varying
/// fastest. Ranks in one tp group are consecutive so they usually share a
/// host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMesh {
    topology: ClusterTopology,
    tp: usize,
}

impl DeviceMesh {
    /// Mesh with tensor-parallel degree `tp`. Requires `tp > 1` and
    /// `tp | world_size`.
    pub fn new(topology: ClusterTopology, tp: usize) -> Result<Self> {
        if tp <= 1 {
            return Err(Error::InvalidConfig {
                message: format!("tensor parallelism requires tp > 1, got {}", tp),
            });
        }
        if topology.world_size() % tp != 0 {
            return Err(Error::InvalidConfig {
                message: format!(
                    "tp={} does not divide world_size={}",
                    tp,
                    topology.world_size()
                ),
            });
        }
        let mesh = Self { topology, tp };
        info!(
            rank = topology.rank(),
            dp_size = mesh.dp_size(),
            tp_size = mesh.tp_size(),
            coordinate = %mesh.local_coordinate(),
            "Initialized device mesh"
        );
        Ok(mesh)
    }

    /// Degenerate mesh with every rank on the dp axis
    pub fn data_parallel(topology: ClusterTopology) -> Self {
        Self { topology, tp: 1 }
    }

    pub fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    pub fn world_size(&self) -> usize {
        self.topology.world_size()
    }

    pub fn dp_size(&self) -> usize {
        self.topology.world_size() / self.tp
    }

    pub fn tp_size(&self) -> usize {
        self.tp
    }

    /// Mesh position of `rank`
    pub fn coordinate(&self, rank: Rank) -> Result<MeshCoordinate> {
        if rank >= self.world_size() {
            return Err(Error::InvalidTopology {
                message: format!(
                    "rank {} out of range for world_size {}",
                    rank,
                    self.world_size()
                ),
            });
        }
        Ok(MeshCoordinate {
            dp_index: rank / self.tp,
            tp_index: rank % self.tp,
        })
    }

    /// Mesh position of the calling process
    pub fn local_coordinate(&self) -> MeshCoordinate {
        let rank = self.topology.rank();
        MeshCoordinate {
            dp_index: rank / self.tp,
            tp_index: rank % self.tp,
        }
    }

    /// Index of this process's data partition
    pub fn dp_rank(&self) -> usize {
        self.local_coordinate().dp_index
    }

    /// Index of this process's tensor shard
    pub fn tp_rank(&self) -> usize {
        self.local_coordinate().tp_index
    }

    /// Rank at a mesh position
    pub fn rank_at(&self, dp_index: usize, tp_index: usize) -> Result<Rank> {
        if dp_index >= self.dp_size() || tp_index >= self.tp {
            return Err(Error::InvalidTopology {
                message: format!(
                    "coordinate (dp={}, tp={}) outside {}x{} mesh",
                    dp_index,
                    tp_index,
                    self.dp_size(),
                    self.tp
                ),
            });
        }
        Ok(dp_index * self.tp + tp_index)
    }

    /// Ranks holding the same tensor shard, one per data partition
    pub fn dp_group(&self, tp_index: usize) -> Vec<Rank> {
        if tp_index >= self.tp {
            return Vec::new();
        }
        (0..self.dp_size())
            .map(|dp_index| dp_index * self.tp + tp_index)
            .collect()
    }

    /// Ranks that jointly hold one model replica
    pub fn tp_group(&self, dp_index: usize) -> Vec<Rank> {
        if dp_index >= self.dp_size() {
            return Vec::new();
        }
        let start = dp_index * self.tp;
        (start..start + self.tp).collect()
    }

    /// Bind this process to its local accelerator
    pub fn bind(&self, accelerator: &dyn Accelerator) -> Result<()> {
        accelerator.bind(self.topology.local_rank())?;
        info!(
            rank = self.topology.rank(),
            device = %accelerator.name(),
            "Bound process to device"
        );
        Ok(())
    }
}
