//! Collective synchronization between participant processes

use crate::{Error, Rank, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Membership and barrier operations shared by every rank of a job.
///
/// Failures are fatal: there is no rank exclusion or retry.
#[async_trait]
pub trait ProcessGroup: Send + Sync {
    /// Rank of the calling process
    fn rank(&self) -> Rank;

    /// Number of participants
    fn world_size(&self) -> usize;

    /// Block until every participant has arrived
    async fn barrier(&self) -> Result<()>;
}

/// Shared handle to a process group
pub type ProcessGroupHandle = Arc<dyn ProcessGroup>;

/// Group containing only the calling process
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcessGroup;

#[async_trait]
impl ProcessGroup for SingleProcessGroup {
    fn rank(&self) -> Rank {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    async fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

/// State of the in-flight barrier generation
struct BarrierState {
    /// Participants that have arrived in this generation
    arrived: usize,
    /// Channels to notify waiting participants
    waiters: Vec<oneshot::Sender<u64>>,
    /// Completed barrier count
    generation: u64,
    /// Set once any participant leaves the group
    poisoned: bool,
}

struct SharedBarrier {
    expected: usize,
    state: Mutex<BarrierState>,
}

/// In-process group where each participant is a task or thread.
///
/// Used for single-host simulation and tests. The last participant to
/// arrive releases the others. Dropping any member poisons the group so
/// peers blocked in, or later entering, a barrier fail instead of hanging.
pub struct LocalProcessGroup {
    rank: Rank,
    shared: Arc<SharedBarrier>,
    barriers_passed: AtomicU64,
}

impl LocalProcessGroup {
    /// Create one handle per rank
    pub fn create(world_size: usize) -> Result<Vec<LocalProcessGroup>> {
        if world_size == 0 {
            return Err(Error::InvalidTopology {
                message: "process group needs at least one member".to_string(),
            });
        }

        let shared = Arc::new(SharedBarrier {
            expected: world_size,
            state: Mutex::new(BarrierState {
                arrived: 0,
                waiters: Vec::with_capacity(world_size),
                generation: 0,
                poisoned: false,
            }),
        });

        Ok((0..world_size)
            .map(|rank| LocalProcessGroup {
                rank,
                shared: Arc::clone(&shared),
                barriers_passed: AtomicU64::new(0),
            })
            .collect())
    }

    /// Number of barriers this member has passed
    pub fn barriers_passed(&self) -> u64 {
        self.barriers_passed.load(Ordering::SeqCst)
    }

    fn collective_error(&self, message: &str) -> Error {
        Error::Collective {
            operation: "barrier".to_string(),
            rank: self.rank,
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.expected
    }

    async fn barrier(&self) -> Result<()> {
        let rx = {
            let mut state = self.shared.state.lock();
            if state.poisoned {
                return Err(self.collective_error("process group lost a member"));
            }

            state.arrived += 1;
            if state.arrived >= self.shared.expected {
                // Last to arrive - release all waiters
                state.arrived = 0;
                state.generation += 1;
                let generation = state.generation;
                for waiter in state.waiters.drain(..) {
                    let _ = waiter.send(generation);
                }
                debug!(rank = self.rank, generation, "Barrier released");
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push(tx);
                Some(rx)
            }
        };

        if let Some(rx) = rx {
            rx.await
                .map_err(|_| self.collective_error("process group lost a member"))?;
        }

        self.barriers_passed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for LocalProcessGroup {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if !state.waiters.is_empty() {
            warn!(
                rank = self.rank,
                waiting = state.waiters.len(),
                "Member left process group while peers wait at a barrier"
            );
        }
        state.poisoned = true;
        // dropping the senders fails every pending wait
        state.waiters.clear();
    }
}
