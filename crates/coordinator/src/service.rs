//! gRPC barrier service

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use runtime_core::{Error, Result};
use tokio::sync::oneshot;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::proto::{coordinator_server::Coordinator, BarrierRequest, BarrierResponse};

/// How long an arrived rank waits for the rest before the call fails
pub const DEFAULT_BARRIER_TIMEOUT: Duration = Duration::from_secs(300);

/// Active barrier tracking
struct BarrierState {
    /// Ranks that have arrived
    arrived: HashSet<u64>,
    /// Channels to notify waiting ranks
    waiters: Vec<oneshot::Sender<u64>>,
}

/// Releases each barrier once every rank of the job has called it
#[derive(Clone)]
pub struct BarrierService {
    world_size: u64,

    /// Active barriers: barrier_id -> state
    barriers: Arc<DashMap<String, Arc<Mutex<BarrierState>>>>,

    barrier_timeout: Duration,

    /// Set once the hosting rank gives up on the job
    aborted: Arc<AtomicBool>,
}

impl BarrierService {
    pub fn new(world_size: usize) -> Result<Self> {
        if world_size == 0 {
            return Err(Error::InvalidTopology {
                message: "coordinator needs at least one rank".to_string(),
            });
        }
        Ok(Self {
            world_size: world_size as u64,
            barriers: Arc::new(DashMap::new()),
            barrier_timeout: DEFAULT_BARRIER_TIMEOUT,
            aborted: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_barrier_timeout(mut self, timeout: Duration) -> Self {
        self.barrier_timeout = timeout;
        self
    }

    pub fn world_size(&self) -> usize {
        self.world_size as usize
    }

    /// Barriers some rank has entered but not all have passed
    pub fn pending_barriers(&self) -> usize {
        self.barriers.len()
    }

    /// Fail every waiting and future barrier call
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        let ids: Vec<String> = self.barriers.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Some((_, barrier)) = self.barriers.remove(&id) {
                // dropping the senders wakes every waiter with an error
                barrier.lock().waiters.clear();
            }
        }
        warn!("Coordinator aborted; pending barriers fail");
    }

    fn check_caller(&self, req: &BarrierRequest) -> std::result::Result<(), Status> {
        if req.world_size != self.world_size {
            return Err(Status::invalid_argument(format!(
                "rank {} was launched with world_size {}, coordinator expects {}",
                req.rank, req.world_size, self.world_size
            )));
        }
        if req.rank >= self.world_size {
            return Err(Status::invalid_argument(format!(
                "rank {} out of range for world_size {}",
                req.rank, self.world_size
            )));
        }
        if req.barrier_id.is_empty() {
            return Err(Status::invalid_argument("barrier_id must not be empty"));
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl Coordinator for BarrierService {
    async fn wait_barrier(
        &self,
        request: Request<BarrierRequest>,
    ) -> std::result::Result<Response<BarrierResponse>, Status> {
        let req = request.into_inner();
        if self.aborted.load(Ordering::SeqCst) {
            return Err(Status::aborted("coordinator aborted the job"));
        }
        self.check_caller(&req)?;

        let barrier = self
            .barriers
            .entry(req.barrier_id.clone())
            .or_insert_with(|| {
                debug!(barrier_id = %req.barrier_id, expected = self.world_size, "Creating new barrier");
                Arc::new(Mutex::new(BarrierState {
                    arrived: HashSet::with_capacity(self.world_size as usize),
                    waiters: Vec::with_capacity(self.world_size as usize),
                }))
            })
            .clone();

        // arrival and waiter registration happen under one lock so the last
        // arrival cannot miss a waiter
        let (arrival_order, rx) = {
            let mut state = barrier.lock();
            if self.aborted.load(Ordering::SeqCst) {
                return Err(Status::aborted("coordinator aborted the job"));
            }
            if !state.arrived.insert(req.rank) {
                return Err(Status::already_exists(format!(
                    "rank {} already waits at barrier {}",
                    req.rank, req.barrier_id
                )));
            }
            let arrival_order = state.arrived.len() as u64;

            if arrival_order >= self.world_size {
                // Last to arrive - release all waiters
                for waiter in state.waiters.drain(..) {
                    let _ = waiter.send(arrival_order);
                }
                self.barriers.remove(&req.barrier_id);
                (arrival_order, None)
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push(tx);
                (arrival_order, Some(rx))
            }
        };

        let participants = match rx {
            None => {
                info!(barrier_id = %req.barrier_id, participants = arrival_order, "Barrier released");
                arrival_order
            }
            Some(rx) => match tokio::time::timeout(self.barrier_timeout, rx).await {
                Ok(Ok(participants)) => participants,
                Ok(Err(_)) => return Err(Status::aborted("coordinator aborted the job")),
                Err(_) => {
                    warn!(
                        barrier_id = %req.barrier_id,
                        rank = req.rank,
                        timeout_secs = self.barrier_timeout.as_secs(),
                        "Barrier timed out waiting for peers"
                    );
                    return Err(Status::deadline_exceeded(format!(
                        "barrier {} timed out after {:?}",
                        req.barrier_id, self.barrier_timeout
                    )));
                }
            },
        };

        Ok(Response::new(BarrierResponse {
            released: true,
            barrier_id: req.barrier_id,
            participants,
            arrival_order,
        }))
    }
}
