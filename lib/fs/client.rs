//! The client-facing filesystem handle.

use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::debug;

use super::backend::{Backend, FsOptions};
use super::error::FsError;
use super::{FileData, Mode, Stat, WriteOptions};
use crate::store::StoreRegistry;

/// A named filesystem that activates itself on first use.
///
/// Every operation first activates the current backend (a no-op once active), so calling
/// [`init`](Self::init) with another name swaps filesystems transparently. Metadata mutations
/// arm the debounced superblock save.
pub struct FileSystem {
    registry: Arc<dyn StoreRegistry>,
    backend: RwLock<Option<Backend>>,
}

impl std::fmt::Debug for FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystem")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

impl FileSystem {
    /// A handle with no filesystem configured yet.
    #[must_use]
    pub fn new(registry: Arc<dyn StoreRegistry>) -> Self {
        Self {
            registry,
            backend: RwLock::new(None),
        }
    }

    /// A handle configured for `name`.
    #[must_use]
    pub fn open(registry: Arc<dyn StoreRegistry>, name: &str, options: FsOptions) -> Self {
        let backend = Backend::new(Arc::clone(&registry), name, options);
        Self {
            registry,
            backend: RwLock::new(Some(backend)),
        }
    }

    /// Switch to filesystem `name`, deactivating the current one first.
    ///
    /// The new filesystem is installed even when deactivating the old one fails; that failure
    /// is still returned.
    pub async fn init(&self, name: &str, options: FsOptions) -> Result<(), FsError> {
        let mut slot = self.backend.write().await;
        let outcome = match slot.take() {
            Some(previous) => {
                debug!(from = previous.name(), to = name, "switching filesystem");
                previous.deactivate().await
            }
            None => Ok(()),
        };
        *slot = Some(Backend::new(Arc::clone(&self.registry), name, options));
        outcome
    }

    /// Deactivate the current filesystem, flushing and releasing its lock.
    pub async fn close(&self) -> Result<(), FsError> {
        match self.backend.read().await.as_ref() {
            Some(backend) => backend.deactivate().await,
            None => Ok(()),
        }
    }

    /// The active backend, activating it if needed.
    async fn active(&self) -> Result<RwLockReadGuard<'_, Backend>, FsError> {
        let guard = self.backend.read().await;
        let backend =
            RwLockReadGuard::try_map(guard, Option::as_ref).map_err(|_| FsError::NotActive)?;
        backend.activate().await?;
        Ok(backend)
    }

    /// Name of the configured filesystem.
    pub async fn name(&self) -> Option<String> {
        self.backend
            .read()
            .await
            .as_ref()
            .map(|b| b.name().to_owned())
    }

    /// Read a file as bytes, or as text when `encoding` is `"utf8"`.
    pub async fn read_file(&self, path: &str, encoding: Option<&str>) -> Result<FileData, FsError> {
        self.active().await?.read_file(path, encoding).await
    }

    /// Create or replace a file.
    pub async fn write_file(
        &self,
        path: &str,
        data: impl Into<FileData>,
        options: WriteOptions,
    ) -> Result<Stat, FsError> {
        let backend = self.active().await?;
        let stat = backend.write_file(path, data.into(), options).await?;
        backend.schedule_save();
        Ok(stat)
    }

    /// Remove a file or symlink.
    pub async fn unlink(&self, path: &str) -> Result<(), FsError> {
        let backend = self.active().await?;
        backend.unlink(path).await?;
        backend.schedule_save();
        Ok(())
    }

    /// Child names of a directory.
    pub async fn readdir(&self, path: &str) -> Result<Vec<String>, FsError> {
        self.active().await?.readdir(path)
    }

    /// Create a directory.
    pub async fn mkdir(&self, path: &str, mode: Option<Mode>) -> Result<Stat, FsError> {
        let backend = self.active().await?;
        let stat = backend.mkdir(path, mode)?;
        backend.schedule_save();
        Ok(stat)
    }

    /// Remove an empty directory.
    pub async fn rmdir(&self, path: &str) -> Result<(), FsError> {
        let backend = self.active().await?;
        backend.rmdir(path)?;
        backend.schedule_save();
        Ok(())
    }

    /// Move a node.
    pub async fn rename(&self, old: &str, new: &str) -> Result<(), FsError> {
        let backend = self.active().await?;
        backend.rename(old, new).await?;
        backend.schedule_save();
        Ok(())
    }

    /// Metadata, following symlinks.
    pub async fn stat(&self, path: &str) -> Result<Stat, FsError> {
        self.active().await?.stat(path)
    }

    /// Metadata, not following a final symlink.
    pub async fn lstat(&self, path: &str) -> Result<Stat, FsError> {
        self.active().await?.lstat(path)
    }

    /// The raw target of a symlink.
    pub async fn readlink(&self, path: &str) -> Result<String, FsError> {
        self.active().await?.readlink(path)
    }

    /// Create a symlink at `path` pointing at `target`.
    pub async fn symlink(&self, target: &str, path: &str) -> Result<Stat, FsError> {
        let backend = self.active().await?;
        let stat = backend.symlink(target, path)?;
        backend.schedule_save();
        Ok(stat)
    }

    /// Create a metadata-only placeholder for a remote file.
    pub async fn back_file(&self, path: &str, mode: Option<Mode>) -> Result<Stat, FsError> {
        let backend = self.active().await?;
        let stat = backend.back_file(path, mode).await?;
        backend.schedule_save();
        Ok(stat)
    }

    /// Total file size beneath `path`.
    pub async fn du(&self, path: &str) -> Result<u64, FsError> {
        self.active().await?.du(path)
    }

    /// Save the superblock now.
    pub async fn flush(&self) -> Result<(), FsError> {
        self.active().await?.flush().await
    }

    /// The current tree in its text encoding.
    pub async fn superblock_text(&self) -> Result<String, FsError> {
        Ok(self.active().await?.snapshot()?.to_text())
    }
}
