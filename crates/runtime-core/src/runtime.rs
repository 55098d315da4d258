//! Async runtime manager

use crate::{Error, Result, TrainingConfig};
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::broadcast;
use tracing::info;

/// Shutdown signal sender
pub type ShutdownSender = broadcast::Sender<()>;

/// Shutdown signal receiver
pub type ShutdownReceiver = broadcast::Receiver<()>;

/// Owns the Tokio runtime driving I/O, prefetching and collectives of one
/// rank
pub struct RuntimeManager {
    /// Tokio runtime
    runtime: Option<Runtime>,

    /// Shutdown signal sender
    shutdown_tx: ShutdownSender,
}

impl RuntimeManager {
    /// Create a runtime with the given number of worker threads
    pub fn new(io_threads: usize) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(io_threads.max(1))
            .enable_all()
            .thread_name("trainer-io")
            .build()
            .map_err(|e| Error::Internal {
                message: format!("Failed to build Tokio runtime: {}", e),
            })?;

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            runtime: Some(runtime),
            shutdown_tx,
        })
    }

    /// Create a runtime sized from a training configuration
    pub fn from_config(config: &TrainingConfig) -> Result<Self> {
        Self::new(config.io_threads)
    }

    fn runtime(&self) -> Result<&Runtime> {
        self.runtime.as_ref().ok_or_else(|| Error::Internal {
            message: "runtime already shut down".to_string(),
        })
    }

    /// Get the runtime handle for spawning tasks
    pub fn handle(&self) -> Result<tokio::runtime::Handle> {
        Ok(self.runtime()?.handle().clone())
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> ShutdownReceiver {
        self.shutdown_tx.subscribe()
    }

    /// Signal shutdown to all components
    pub fn shutdown(&self) {
        info!("Initiating runtime shutdown");
        let _ = self.shutdown_tx.send(());
    }

    /// Block on a future until completion
    pub fn block_on<F: std::future::Future>(&self, future: F) -> Result<F::Output> {
        Ok(self.runtime()?.block_on(future))
    }
}

impl Drop for RuntimeManager {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            let _ = self.shutdown_tx.send(());

            // Give prefetch tasks time to wind down
            runtime.shutdown_timeout(Duration::from_secs(5));
            info!("Runtime manager shut down");
        }
    }
}
