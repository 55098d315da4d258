//! Storage backend trait definition

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::Result;

/// Async interface over the filesystem holding experiment directories.
///
/// Paths are relative to the backend root. Writes must be atomic: a reader
/// observes either the previous file or the complete new one, never a
/// partial write.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read the whole file at `path`
    ///
    /// # Errors
    /// `StoragePathNotFound` if the path does not exist
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Atomically replace the file at `path`, creating parent directories.
    ///
    /// # Returns
    /// Number of bytes written
    async fn write(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Delete the file at `path`
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if a path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// List files under a prefix, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Create a directory and its parents
    async fn create_dir(&self, path: &str) -> Result<()>;

    /// Human readable location of `path`, for diagnostics
    fn describe(&self, path: &str) -> String;
}
