//! Runtime Core - Foundation for the distributed training harness
//!
//! Provides core types, error handling, process topology, collective
//! synchronization and async runtime utilities shared by every crate.

pub mod config;
pub mod error;
pub mod group;
pub mod logging;
pub mod ordered;
pub mod runtime;
pub mod topology;
pub mod types;

pub use config::TrainingConfig;
pub use error::{Error, ErrorKind, Result};
pub use group::{LocalProcessGroup, ProcessGroup, ProcessGroupHandle, SingleProcessGroup};
pub use ordered::RankOrdered;
pub use runtime::RuntimeManager;
pub use topology::ClusterTopology;
pub use types::*;
