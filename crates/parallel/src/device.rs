//! Compute device binding

use parking_lot::Mutex;
use runtime_core::{Error, Rank, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Device memory counters, in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total_bytes: u64,
    pub allocated_bytes: u64,
    pub peak_allocated_bytes: u64,
    pub reserved_bytes: u64,
    pub peak_reserved_bytes: u64,
}

/// Handle to the accelerator a process computes on
pub trait Accelerator: Send + Sync {
    /// Bind the calling process to device `local_rank`
    fn bind(&self, local_rank: Rank) -> Result<()>;

    /// Block until all queued device work has finished
    fn synchronize(&self);

    /// Current memory counters, if the device reports them
    fn memory_stats(&self) -> Option<MemoryStats>;

    /// Restart peak tracking from the current values
    fn reset_peak_memory_stats(&self) {}

    /// Human readable device name
    fn name(&self) -> String;
}

/// Host CPU. Synchronization is a no-op and there are no memory counters.
#[derive(Debug, Default)]
pub struct CpuAccelerator {
    bound: Mutex<Option<Rank>>,
    synchronizations: AtomicU64,
}

impl CpuAccelerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Device index bound by [`Accelerator::bind`]
    pub fn bound_device(&self) -> Option<Rank> {
        *self.bound.lock()
    }

    /// Number of `synchronize` calls so far
    pub fn synchronizations(&self) -> u64 {
        self.synchronizations.load(Ordering::Relaxed)
    }
}

impl Accelerator for CpuAccelerator {
    fn bind(&self, local_rank: Rank) -> Result<()> {
        let mut bound = self.bound.lock();
        match *bound {
            Some(existing) if existing != local_rank => Err(Error::InvalidTopology {
                message: format!(
                    "process already bound to cpu:{}, cannot rebind to cpu:{}",
                    existing, local_rank
                ),
            }),
            _ => {
                *bound = Some(local_rank);
                debug!(device = local_rank, "Bound to cpu device");
                Ok(())
            }
        }
    }

    fn synchronize(&self) {
        self.synchronizations.fetch_add(1, Ordering::Relaxed);
    }

    fn memory_stats(&self) -> Option<MemoryStats> {
        None
    }

    fn name(&self) -> String {
        match self.bound_device() {
            Some(index) => format!("cpu:{}", index),
            None => "cpu".to_string(),
        }
    }
}
