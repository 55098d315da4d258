//! gRPC server hosting the barrier service

use std::net::SocketAddr;
use std::time::Duration;

use runtime_core::{Error, Result};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{error, info};

use crate::proto::coordinator_server::CoordinatorServer as CoordinatorGrpcServer;
use crate::service::BarrierService;

/// Port the coordinator listens on when `MASTER_PORT` is unset
pub const DEFAULT_PORT: u16 = 29500;

/// Coordinator server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to; port 0 picks a free port
    pub addr: SocketAddr,

    /// HTTP/2 keepalive ping interval
    pub keepalive_interval: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            keepalive_interval: Some(Duration::from_secs(60)),
        }
    }
}

/// Coordinator gRPC server
pub struct CoordinatorServer {
    config: ServerConfig,
    service: BarrierService,
}

impl CoordinatorServer {
    pub fn new(service: BarrierService) -> Self {
        Self {
            config: ServerConfig::default(),
            service,
        }
    }

    pub fn with_config(service: BarrierService, config: ServerConfig) -> Self {
        Self { config, service }
    }

    /// Bind the listener and serve on a background task until
    /// [`RunningServer::shutdown`]
    pub async fn spawn(self) -> Result<RunningServer> {
        let listener = TcpListener::bind(self.config.addr).await?;
        let local_addr = listener.local_addr()?;
        let world_size = self.service.world_size();
        let service = self.service.clone();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            Server::builder()
                .http2_keepalive_interval(self.config.keepalive_interval)
                .add_service(CoordinatorGrpcServer::new(self.service))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        info!(address = %local_addr, world_size, "Coordinator server listening");
        Ok(RunningServer {
            local_addr,
            service,
            shutdown_tx,
            task,
        })
    }
}

/// Handle to a coordinator serving in the background
pub struct RunningServer {
    local_addr: SocketAddr,
    service: BarrierService,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<std::result::Result<(), tonic::transport::Error>>,
}

impl RunningServer {
    /// Address the server actually bound
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Fail every pending barrier, then shut down. Ranks blocked in a
    /// barrier get an error instead of waiting for a peer that is gone.
    pub async fn abort(self) -> Result<()> {
        self.service.abort();
        self.shutdown().await
    }

    /// Stop accepting calls and wait for in-flight ones to finish
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        let served = self.task.await.map_err(|e| Error::Internal {
            message: format!("coordinator server task failed: {}", e),
        })?;
        served.map_err(|e| {
            error!(error = %e, "Coordinator server error");
            Error::Collective {
                operation: "serve".to_string(),
                rank: 0,
                message: e.to_string(),
            }
        })?;
        info!("Coordinator server shutdown complete");
        Ok(())
    }
}
