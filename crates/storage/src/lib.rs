//! Storage - Async filesystem access for experiment directories
//!
//! Checkpoint files, `state.json` and metrics logs are all written through
//! a [`StorageBackend`] so writes stay atomic and paths stay inside the
//! configured save directory.
//!
//! # Example
//!
//! ```no_run
//! use storage::{StorageBackend, LocalStorage};
//! use bytes::Bytes;
//!
//! # async fn example() -> runtime_core::Result<()> {
//! let storage = LocalStorage::new("/tmp/outputs");
//! storage.write("llama-run/state.json", Bytes::from("{}")).await?;
//! let data = storage.read("llama-run/state.json").await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod local;

pub use backend::StorageBackend;
pub use local::LocalStorage;
