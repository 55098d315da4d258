//! Process placement derived from the launch environment

use crate::{Error, Rank, Result};
use serde::{Deserialize, Serialize};

pub const ENV_RANK: &str = "RANK";
pub const ENV_WORLD_SIZE: &str = "WORLD_SIZE";
pub const ENV_LOCAL_RANK: &str = "LOCAL_RANK";
pub const ENV_LOCAL_WORLD_SIZE: &str = "LOCAL_WORLD_SIZE";

/// Rank, local rank and world size of this process.
///
/// Fixed for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTopology {
    rank: Rank,
    local_rank: Rank,
    world_size: usize,
    local_world_size: usize,
}

impl ClusterTopology {
    /// Build a topology, checking `0 <= rank < world_size`
    pub fn new(
        rank: Rank,
        local_rank: Rank,
        world_size: usize,
        local_world_size: usize,
    ) -> Result<Self> {
        if world_size == 0 {
            return Err(Error::InvalidTopology {
                message: "world_size must be positive".to_string(),
            });
        }
        if rank >= world_size {
            return Err(Error::InvalidTopology {
                message: format!("rank {} out of range for world_size {}", rank, world_size),
            });
        }
        if local_world_size == 0 || local_rank >= local_world_size {
            return Err(Error::InvalidTopology {
                message: format!(
                    "local_rank {} out of range for local_world_size {}",
                    local_rank, local_world_size
                ),
            });
        }
        Ok(Self {
            rank,
            local_rank,
            world_size,
            local_world_size,
        })
    }

    /// A lone process: rank 0 of 1
    pub fn single() -> Self {
        Self {
            rank: 0,
            local_rank: 0,
            world_size: 1,
            local_world_size: 1,
        }
    }

    /// Read the launcher-provided environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup.
    ///
    /// With no variables set the process is a single participant. A missing
    /// `LOCAL_RANK` falls back to `rank % LOCAL_WORLD_SIZE`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let rank = parse_var(&lookup, ENV_RANK)?;
        let world_size = parse_var(&lookup, ENV_WORLD_SIZE)?;

        let (rank, world_size) = match (rank, world_size) {
            (None, None) => return Ok(Self::single()),
            (Some(rank), Some(world_size)) => (rank, world_size),
            _ => {
                return Err(Error::InvalidTopology {
                    message: format!("{} and {} must be set together", ENV_RANK, ENV_WORLD_SIZE),
                })
            }
        };

        let local_world_size = parse_var(&lookup, ENV_LOCAL_WORLD_SIZE)?.unwrap_or(world_size);
        let local_rank = match parse_var(&lookup, ENV_LOCAL_RANK)? {
            Some(local_rank) => local_rank,
            None if local_world_size > 0 => rank % local_world_size,
            None => 0,
        };

        Self::new(rank, local_rank, world_size, local_world_size)
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn local_rank(&self) -> Rank {
        self.local_rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn local_world_size(&self) -> usize {
        self.local_world_size
    }

    /// Global rank 0
    pub fn is_global_leader(&self) -> bool {
        self.rank == 0
    }

    /// First process on this host
    pub fn is_local_leader(&self) -> bool {
        self.local_rank == 0
    }
}

fn parse_var<F>(lookup: &F, key: &str) -> Result<Option<usize>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|e| Error::InvalidTopology {
                message: format!("{}={:?} is not a valid integer: {}", key, raw, e),
            }),
    }
}
