//! Durable storage behind the tree.
//!
//! A [`DurableStore`] keeps one superblock and the content of every file, keyed by ino. A
//! [`LockStore`] keeps the records of cooperative locks. Both are obtained from a
//! [`StoreRegistry`], which is the only thing two independent execution contexts share.

/// On-disk stores rooted at a host directory.
pub mod dir;
/// Process-local stores.
pub mod memory;

pub use dir::DirRegistry;
pub use memory::MemoryRegistry;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fs::{Ino, Superblock};

/// Failures of a durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying storage failed.
    #[error("store IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted record could not be encoded or decoded.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store's root holds data this crate did not write.
    #[error("refusing to use {0}: it contains foreign data")]
    Foreign(PathBuf),

    /// The store was closed and not reopened.
    #[error("store {0} is closed")]
    Closed(String),
}

/// Persistence of a single filesystem: its superblock plus file contents by ino.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// The last saved superblock, if one was ever saved.
    async fn load_superblock(&self) -> Result<Option<Superblock>, StoreError>;

    /// Replace the saved superblock.
    async fn save_superblock(&self, superblock: &Superblock) -> Result<(), StoreError>;

    /// Remove everything this store holds.
    async fn wipe(&self) -> Result<(), StoreError>;

    /// The content stored under `ino`.
    async fn read_file(&self, ino: Ino) -> Result<Option<Bytes>, StoreError>;

    /// Replace the content stored under `ino`.
    async fn write_file(&self, ino: Ino, data: Bytes) -> Result<(), StoreError>;

    /// Remove the content stored under `ino`. Absent content is not an error.
    async fn unlink(&self, ino: Ino) -> Result<(), StoreError>;

    /// An ino at least as high as any ino holding content, 0 when nothing is stored.
    async fn content_high_water(&self) -> Result<Ino, StoreError>;

    /// Release any handle held on the backing storage. The next call reopens it.
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// The record naming the current holder of a cooperative lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Identity of the holding context.
    pub holder: String,
    /// When the hold lapses, in milliseconds since the Unix epoch.
    pub expires_at_ms: u64,
}

impl LockRecord {
    /// Whether the record has lapsed at `now_ms`.
    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms <= now_ms
    }
}

/// The decision function applied by [`LockStore::update`]. It sees the current record and
/// returns the record to store (`None` deletes it).
pub type LockUpdate = Box<dyn FnOnce(Option<&LockRecord>) -> Option<LockRecord> + Send>;

/// Outcome of an atomic [`LockStore::update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockTransition {
    /// The record before the update.
    pub previous: Option<LockRecord>,
    /// The record after the update.
    pub current: Option<LockRecord>,
}

/// Atomic read-modify-write storage for lock records.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Apply `f` to the record under `key` atomically with respect to every other context
    /// sharing this store.
    async fn update(&self, key: &str, f: LockUpdate) -> Result<LockTransition, StoreError>;

    /// The record under `key`.
    async fn get(&self, key: &str) -> Result<Option<LockRecord>, StoreError> {
        self.update(key, Box::new(|r| r.cloned()))
            .await
            .map(|t| t.current)
    }
}

/// Hands out store handles by database and store name. Never performs I/O.
pub trait StoreRegistry: Send + Sync {
    /// The durable store named `(db, store)`.
    fn file_store(&self, db: &str, store: &str) -> Arc<dyn DurableStore>;

    /// The lock-record store named `(db, store)`.
    fn lock_store(&self, db: &str, store: &str) -> Arc<dyn LockStore>;

    /// Directory for native advisory lock files, when the platform offers them.
    fn native_lock_dir(&self) -> Option<PathBuf> {
        None
    }
}
