//! Process-local stores.
//!
//! Every [`Backend`](crate::fs::Backend) built from clones of one [`MemoryRegistry`] sees the
//! same stores, which is how independent in-process execution contexts are modelled.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use scc::hash_map::Entry;

use super::{
    DurableStore, LockRecord, LockStore, LockTransition, LockUpdate, StoreError, StoreRegistry,
};
use crate::fs::{Ino, Superblock};

/// A [`DurableStore`] held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    superblock: Mutex<Option<Superblock>>,
    contents: scc::HashMap<Ino, Bytes>,
    high_water: AtomicU64,
}

impl MemoryStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of files with stored content.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.contents.len()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn load_superblock(&self) -> Result<Option<Superblock>, StoreError> {
        Ok(self.superblock.lock().clone())
    }

    async fn save_superblock(&self, superblock: &Superblock) -> Result<(), StoreError> {
        *self.superblock.lock() = Some(superblock.clone());
        Ok(())
    }

    async fn wipe(&self) -> Result<(), StoreError> {
        *self.superblock.lock() = None;
        self.contents.clear_async().await;
        self.high_water.store(0, Ordering::Release);
        Ok(())
    }

    async fn read_file(&self, ino: Ino) -> Result<Option<Bytes>, StoreError> {
        Ok(self.contents.read_async(&ino, |_, data| data.clone()).await)
    }

    async fn write_file(&self, ino: Ino, data: Bytes) -> Result<(), StoreError> {
        self.high_water.fetch_max(ino, Ordering::AcqRel);
        match self.contents.entry_async(ino).await {
            Entry::Occupied(mut occ) => *occ.get_mut() = data,
            Entry::Vacant(vac) => {
                vac.insert_entry(data);
            }
        }
        Ok(())
    }

    async fn unlink(&self, ino: Ino) -> Result<(), StoreError> {
        self.contents.remove_async(&ino).await;
        Ok(())
    }

    async fn content_high_water(&self) -> Result<Ino, StoreError> {
        Ok(self.high_water.load(Ordering::Acquire))
    }
}

/// A [`LockStore`] held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    records: scc::HashMap<String, LockRecord>,
}

impl MemoryLockStore {
    /// An empty lock store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn update(&self, key: &str, f: LockUpdate) -> Result<LockTransition, StoreError> {
        // The entry stays locked for the duration of `f`, which makes the update atomic.
        let transition = match self.records.entry_async(key.to_owned()).await {
            Entry::Occupied(mut occ) => {
                let previous = occ.get().clone();
                let current = f(Some(&previous));
                match &current {
                    Some(next) => *occ.get_mut() = next.clone(),
                    None => {
                        occ.remove_entry();
                    }
                }
                LockTransition {
                    previous: Some(previous),
                    current,
                }
            }
            Entry::Vacant(vac) => {
                let current = f(None);
                if let Some(next) = &current {
                    vac.insert_entry(next.clone());
                }
                LockTransition {
                    previous: None,
                    current,
                }
            }
        };
        Ok(transition)
    }
}

type StoreKey = (String, String);

#[derive(Debug, Default)]
struct Shelves {
    files: scc::HashMap<StoreKey, Arc<MemoryStore>>,
    locks: scc::HashMap<StoreKey, Arc<MemoryLockStore>>,
}

/// Registry of process-local stores. Clones share the same stores.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    shelves: Arc<Shelves>,
}

impl MemoryRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The concrete store named `(db, store)`, created on first use.
    #[must_use]
    pub fn memory_store(&self, db: &str, store: &str) -> Arc<MemoryStore> {
        let key = (db.to_owned(), store.to_owned());
        match self.shelves.files.entry_sync(key) {
            Entry::Occupied(occ) => Arc::clone(occ.get()),
            Entry::Vacant(vac) => {
                let created = Arc::new(MemoryStore::new());
                vac.insert_entry(Arc::clone(&created));
                created
            }
        }
    }
}

impl StoreRegistry for MemoryRegistry {
    fn file_store(&self, db: &str, store: &str) -> Arc<dyn DurableStore> {
        self.memory_store(db, store)
    }

    fn lock_store(&self, db: &str, store: &str) -> Arc<dyn LockStore> {
        let key = (db.to_owned(), store.to_owned());
        match self.shelves.locks.entry_sync(key) {
            Entry::Occupied(occ) => Arc::clone(occ.get()) as Arc<dyn LockStore>,
            Entry::Vacant(vac) => {
                let created = Arc::new(MemoryLockStore::new());
                vac.insert_entry(Arc::clone(&created));
                created
            }
        }
    }
}
