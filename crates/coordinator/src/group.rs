//! Process group whose barriers go through the coordinator

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use runtime_core::{Error, ProcessGroup, Rank, Result};
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info};

use crate::proto::coordinator_client::CoordinatorClient;
use crate::proto::BarrierRequest;
use crate::server::DEFAULT_PORT;

pub const ENV_MASTER_ADDR: &str = "MASTER_ADDR";
pub const ENV_MASTER_PORT: &str = "MASTER_PORT";

/// How long a rank keeps retrying while the coordinator comes up
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Where the coordinator of a job listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorAddr {
    pub host: String,
    pub port: u16,
}

impl CoordinatorAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Read `MASTER_ADDR` and `MASTER_PORT`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Missing variables default to `127.0.0.1` and [`DEFAULT_PORT`]
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup(ENV_MASTER_ADDR)
            .map(|host| host.trim().to_string())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let port = match lookup(ENV_MASTER_PORT) {
            None => DEFAULT_PORT,
            Some(raw) => raw.trim().parse::<u16>().map_err(|e| Error::InvalidTopology {
                message: format!("{}={:?} is not a valid port: {}", ENV_MASTER_PORT, raw, e),
            })?,
        };
        Ok(Self { host, port })
    }

    /// Address the hosting rank binds: every interface, same port
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }
}

impl fmt::Display for CoordinatorAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Member of a multi-process job.
///
/// Every rank issues the same sequence of collective calls, so the n-th
/// barrier of each rank carries the same id and meets at the coordinator.
pub struct CoordinatorProcessGroup {
    rank: Rank,
    world_size: usize,
    client: CoordinatorClient<Channel>,
    barriers_passed: AtomicU64,
}

impl CoordinatorProcessGroup {
    /// Connect to the coordinator at `addr`, retrying for
    /// [`DEFAULT_CONNECT_TIMEOUT`]
    pub async fn connect(addr: impl Into<String>, rank: Rank, world_size: usize) -> Result<Self> {
        Self::connect_with_timeout(addr, rank, world_size, DEFAULT_CONNECT_TIMEOUT).await
    }

    pub async fn connect_with_timeout(
        addr: impl Into<String>,
        rank: Rank,
        world_size: usize,
        timeout: Duration,
    ) -> Result<Self> {
        if rank >= world_size {
            return Err(Error::InvalidTopology {
                message: format!("rank {} out of range for world_size {}", rank, world_size),
            });
        }
        let addr = addr.into();
        let endpoint = Endpoint::from_shared(format!("http://{}", addr)).map_err(|e| {
            Error::InvalidTopology {
                message: format!("invalid coordinator address {}: {}", addr, e),
            }
        })?;

        let deadline = Instant::now() + timeout;
        let channel = loop {
            match endpoint.connect().await {
                Ok(channel) => break channel,
                Err(e) if Instant::now() < deadline => {
                    debug!(rank, address = %addr, error = %e, "Coordinator not reachable yet");
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
                Err(e) => {
                    return Err(Error::Collective {
                        operation: "connect".to_string(),
                        rank,
                        message: format!("coordinator {} unreachable: {}", addr, e),
                    })
                }
            }
        };

        info!(rank, world_size, address = %addr, "Joined coordinator");
        Ok(Self {
            rank,
            world_size,
            client: CoordinatorClient::new(channel),
            barriers_passed: AtomicU64::new(0),
        })
    }

    /// Number of barriers this member has passed
    pub fn barriers_passed(&self) -> u64 {
        self.barriers_passed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessGroup for CoordinatorProcessGroup {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn barrier(&self) -> Result<()> {
        let sequence = self.barriers_passed.load(Ordering::SeqCst);
        let request = BarrierRequest {
            barrier_id: format!("barrier-{}", sequence),
            rank: self.rank as u64,
            world_size: self.world_size as u64,
        };

        // clients share one channel
        let mut client = self.client.clone();
        let response = client
            .wait_barrier(request)
            .await
            .map_err(|status| Error::Collective {
                operation: "barrier".to_string(),
                rank: self.rank,
                message: format!("{:?}: {}", status.code(), status.message()),
            })?
            .into_inner();

        if !response.released {
            return Err(Error::Collective {
                operation: "barrier".to_string(),
                rank: self.rank,
                message: format!("barrier {} was not released", response.barrier_id),
            });
        }

        self.barriers_passed.fetch_add(1, Ordering::SeqCst);
        debug!(
            rank = self.rank,
            barrier_id = %response.barrier_id,
            arrival_order = response.arrival_order,
            "Barrier passed"
        );
        Ok(())
    }
}
