//! Local filesystem storage backend
//!
//! Every write goes to a uniquely named temporary file that is synced and
//! then renamed over the target, so a crash mid-write never leaves a
//! truncated checkpoint file behind.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::{Error, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::StorageBackend;

/// Filesystem backend rooted at a save directory
#[derive(Debug, Clone)]
pub struct LocalStorage {
    /// Base path for all storage operations
    base_path: PathBuf,
}

impl LocalStorage {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve a relative path, rejecting anything that escapes the root
    fn resolve_path(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(Error::Storage {
                message: format!("path {:?} must stay inside {:?}", path, self.base_path),
            });
        }
        Ok(self.base_path.join(relative))
    }

    /// Sibling temporary path for an atomic write
    fn temp_path(full_path: &Path) -> PathBuf {
        let temp_name = format!(
            ".{}.{}.tmp",
            full_path.file_name().unwrap_or_default().to_string_lossy(),
            Uuid::new_v4()
        );
        full_path.with_file_name(temp_name)
    }

    /// Whether `path` is the root of a mounted filesystem.
    ///
    /// Used to decide which process creates an experiment directory: on a
    /// mount shared by every host only global rank 0 may create it.
    pub fn is_mount_point(&self, path: &str) -> bool {
        match self.resolve_path(path) {
            Ok(full_path) => is_mount_point(&full_path),
            Err(_) => false,
        }
    }
}

#[cfg(unix)]
fn is_mount_point(path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    let parent = path.join("..");
    let Ok(parent_meta) = std::fs::metadata(&parent) else {
        return false;
    };
    meta.dev() != parent_meta.dev() || meta.ino() == parent_meta.ino()
}

#[cfg(not(unix))]
fn is_mount_point(_path: &Path) -> bool {
    false
}

#[async_trait]
impl StorageBackend for LocalStorage {
    #[instrument(skip(self), fields(backend = "local"))]
    async fn read(&self, path: &str) -> Result<Bytes> {
        let full_path = self.resolve_path(path)?;
        debug!(?full_path, "Reading file");

        match fs::read(&full_path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::StoragePathNotFound {
                path: self.describe(path),
            }),
            Err(e) => Err(Error::Storage {
                message: format!("Failed to read {}: {}", self.describe(path), e),
            }),
        }
    }

    #[instrument(skip(self, data), fields(backend = "local", size = data.len()))]
    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let full_path = self.resolve_path(path)?;
        let temp_path = Self::temp_path(&full_path);
        let size = data.len() as u64;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::CheckpointWriteFailed {
                    message: format!("Failed to create directory {:?}: {}", parent, e),
                })?;
        }

        let write_result = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            fs::rename(&temp_path, &full_path).await
        }
        .await;

        if let Err(e) = write_result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(Error::CheckpointWriteFailed {
                message: format!("Failed to write {:?}: {}", full_path, e),
            });
        }

        debug!(?full_path, size, "File written atomically");
        Ok(size)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path)?;

        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::StoragePathNotFound {
                path: self.describe(path),
            }),
            Err(e) => Err(Error::Storage {
                message: format!("Failed to delete {}: {}", self.describe(path), e),
            }),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.resolve_path(path)?;
        Ok(fs::metadata(&full_path).await.is_ok())
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let search_path = self.resolve_path(prefix)?;
        let dir_to_scan = if search_path.is_dir() {
            search_path
        } else {
            match search_path.parent() {
                Some(parent) if parent.is_dir() => parent.to_path_buf(),
                _ => return Ok(Vec::new()),
            }
        };

        let mut results = Vec::new();
        let mut stack = vec![dir_to_scan];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let entry_path = entry.path();
                if file_type.is_dir() {
                    stack.push(entry_path);
                    continue;
                }
                if let Ok(relative) = entry_path.strip_prefix(&self.base_path) {
                    let relative = relative.to_string_lossy().to_string();
                    let is_temp = entry.file_name().to_string_lossy().ends_with(".tmp");
                    if relative.starts_with(prefix) && !is_temp {
                        results.push(relative);
                    }
                }
            }
        }

        results.sort();
        Ok(results)
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path)?;
        fs::create_dir_all(&full_path)
            .await
            .map_err(|e| Error::Storage {
                message: format!("Failed to create directory {:?}: {}", full_path, e),
            })
    }

    fn describe(&self, path: &str) -> String {
        self.base_path.join(path).display().to_string()
    }
}
