//! Stores rooted at a host directory.
//!
//! Layout under the registry root:
//!
//! ```text
//! <root>/<db>/<store>/.light_fs_store    marker
//! <root>/<db>/<store>/superblock.json
//! <root>/<db>/<store>/<ino>              file content
//! <root>/<lock db>/<lock store>/<key>.json
//! <root>/locks/<name>.lock               native advisory locks
//! ```
//!
//! Separate processes pointing at the same root share every store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use nix::fcntl::{Flock, FlockArg};
use tracing::debug;

use super::{
    DurableStore, LockRecord, LockStore, LockTransition, LockUpdate, StoreError, StoreRegistry,
};
use crate::fs::{Ino, Superblock};
use crate::io;

/// Turn an arbitrary name into a single path component.
fn component(name: &str) -> String {
    name.chars()
        .map(|c| if c == '/' || c == '\0' { '_' } else { c })
        .collect()
}

/// A [`DurableStore`] keeping one file per ino in a host directory.
#[derive(Debug)]
pub struct DirStore {
    dir: PathBuf,
    ready: AtomicBool,
}

impl DirStore {
    // Changing this makes every existing store directory look foreign.
    const MARKER_FILE: &'static str = ".light_fs_store";
    const SUPERBLOCK_FILE: &'static str = "superblock.json";

    /// A store rooted at `dir`. Nothing is touched until first use.
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            ready: AtomicBool::new(false),
        }
    }

    /// The directory backing this store.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn content_path(&self, ino: Ino) -> PathBuf {
        self.dir.join(ino.to_string())
    }

    /// Create the directory on first use, refusing directories holding foreign data.
    async fn ensure_ready(&self) -> Result<(), StoreError> {
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }

        match tokio::fs::read_dir(&self.dir).await {
            Ok(mut entries) => {
                let is_empty = entries.next_entry().await?.is_none();
                let marker_exists = tokio::fs::try_exists(self.dir.join(Self::MARKER_FILE)).await?;
                if !(is_empty || marker_exists) {
                    return Err(StoreError::Foreign(self.dir.clone()));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(&self.dir).await?;
            }
            Err(e) => return Err(e.into()),
        }

        self.write_marker().await?;
        self.ready.store(true, Ordering::Release);
        debug!(dir = %self.dir.display(), "opened directory store");
        Ok(())
    }

    async fn write_marker(&self) -> Result<(), StoreError> {
        tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.dir.join(Self::MARKER_FILE))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DurableStore for DirStore {
    async fn load_superblock(&self) -> Result<Option<Superblock>, StoreError> {
        self.ensure_ready().await?;
        let raw =
            io::not_found_as_none(tokio::fs::read(self.dir.join(Self::SUPERBLOCK_FILE)).await)?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save_superblock(&self, superblock: &Superblock) -> Result<(), StoreError> {
        self.ensure_ready().await?;
        let raw = serde_json::to_vec(superblock)?;
        io::write_atomic(&self.dir.join(Self::SUPERBLOCK_FILE), &raw).await?;
        Ok(())
    }

    async fn wipe(&self) -> Result<(), StoreError> {
        self.ensure_ready().await?;
        io::remove_dir_contents(&self.dir).await?;
        self.write_marker().await?;
        debug!(dir = %self.dir.display(), "wiped directory store");
        Ok(())
    }

    async fn read_file(&self, ino: Ino) -> Result<Option<Bytes>, StoreError> {
        self.ensure_ready().await?;
        let raw = io::not_found_as_none(tokio::fs::read(self.content_path(ino)).await)?;
        Ok(raw.map(Bytes::from))
    }

    async fn write_file(&self, ino: Ino, data: Bytes) -> Result<(), StoreError> {
        self.ensure_ready().await?;
        io::write_atomic(&self.content_path(ino), &data).await?;
        Ok(())
    }

    async fn unlink(&self, ino: Ino) -> Result<(), StoreError> {
        self.ensure_ready().await?;
        io::not_found_as_none(tokio::fs::remove_file(self.content_path(ino)).await)?;
        Ok(())
    }

    async fn content_high_water(&self) -> Result<Ino, StoreError> {
        self.ensure_ready().await?;
        let mut highest = 0;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(ino) = entry.file_name().to_str().and_then(|n| n.parse::<Ino>().ok()) {
                highest = highest.max(ino);
            }
        }
        Ok(highest)
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.ready.store(false, Ordering::Release);
        Ok(())
    }
}

/// A [`LockStore`] keeping each record in a JSON file, updated under an exclusive `flock`.
#[derive(Debug, Clone)]
pub struct DirLockStore {
    dir: PathBuf,
}

impl DirLockStore {
    /// A lock store rooted at `dir`. Nothing is touched until first use.
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn update_blocking(
        dir: &Path,
        key: &str,
        f: LockUpdate,
    ) -> Result<LockTransition, StoreError> {
        std::fs::create_dir_all(dir)?;
        let stem = component(key);
        let guard_file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(format!("{stem}.guard")))?;
        let _guard = Flock::lock(guard_file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| std::io::Error::from(errno))?;

        let record_path = dir.join(format!("{stem}.json"));
        let previous: Option<LockRecord> = match io::not_found_as_none(std::fs::read(&record_path))?
        {
            // A torn or garbage record is treated as absent so the lock stays reclaimable.
            Some(raw) => serde_json::from_slice(&raw).ok(),
            None => None,
        };

        let current = f(previous.as_ref());
        match &current {
            Some(next) => io::write_atomic_blocking(&record_path, &serde_json::to_vec(next)?)?,
            None => {
                io::not_found_as_none(std::fs::remove_file(&record_path))?;
            }
        }
        Ok(LockTransition { previous, current })
    }
}

#[async_trait]
impl LockStore for DirLockStore {
    async fn update(&self, key: &str, f: LockUpdate) -> Result<LockTransition, StoreError> {
        let dir = self.dir.clone();
        let key = key.to_owned();
        tokio::task::spawn_blocking(move || Self::update_blocking(&dir, &key, f))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }
}

/// Registry of stores under one host directory.
#[derive(Debug, Clone)]
pub struct DirRegistry {
    root: PathBuf,
}

impl DirRegistry {
    const NATIVE_LOCK_DIR: &'static str = "locks";

    /// A registry rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn store_dir(&self, db: &str, store: &str) -> PathBuf {
        self.root.join(component(db)).join(component(store))
    }
}

impl StoreRegistry for DirRegistry {
    fn file_store(&self, db: &str, store: &str) -> Arc<dyn DurableStore> {
        Arc::new(DirStore::new(self.store_dir(db, store)))
    }

    fn lock_store(&self, db: &str, store: &str) -> Arc<dyn LockStore> {
        Arc::new(DirLockStore::new(self.store_dir(db, store)))
    }

    fn native_lock_dir(&self) -> Option<PathBuf> {
        Some(self.root.join(Self::NATIVE_LOCK_DIR))
    }
}
