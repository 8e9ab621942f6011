#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use light_fs::fs::{FsOptions, Ino, Superblock};
use light_fs::lock::{LockStrategy, LockTiming};
use light_fs::remote::{RemoteError, RemoteSource};
use light_fs::store::memory::MemoryStore;
use light_fs::store::{DurableStore, StoreError};

/// Lock timing short enough that contended tests finish quickly.
pub fn fast_timing() -> LockTiming {
    LockTiming {
        ttl: Duration::from_secs(5),
        margin: Duration::from_secs(2),
        interval: Duration::from_millis(10),
        timeout: Duration::from_secs(5),
    }
}

/// Options for a cooperative, remote-less filesystem with fast lock timing.
pub fn options() -> FsOptions {
    FsOptions {
        lock_strategy: LockStrategy::Cooperative,
        lock_timing: fast_timing(),
        ..FsOptions::default()
    }
}

/// Options that give up on the lock after `timeout`.
pub fn options_with_lock_timeout(timeout: Duration) -> FsOptions {
    let mut opts = options();
    opts.lock_timing.timeout = timeout;
    opts
}

/// Remote source backed by a map of path to content.
#[derive(Debug, Default)]
pub struct MockRemote {
    files: HashMap<String, Bytes>,
    superblock: Option<String>,
    reads: AtomicUsize,
    sizes: AtomicUsize,
    superblock_loads: AtomicUsize,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_file(mut self, path: &str, content: impl Into<Bytes>) -> Self {
        self.files.insert(path.to_owned(), content.into());
        self
    }

    /// Publish a superblock in text form.
    #[must_use]
    pub fn with_superblock(mut self, text: &str) -> Self {
        self.superblock = Some(text.to_owned());
        self
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn sizes(&self) -> usize {
        self.sizes.load(Ordering::SeqCst)
    }

    pub fn superblock_loads(&self) -> usize {
        self.superblock_loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteSource for MockRemote {
    async fn load_superblock(&self) -> Result<Superblock, RemoteError> {
        self.superblock_loads.fetch_add(1, Ordering::SeqCst);
        match &self.superblock {
            Some(text) => Ok(Superblock::parse_text(text)?),
            None => Ok(Superblock::empty()),
        }
    }

    async fn read_file(&self, path: &str) -> Result<Bytes, RemoteError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(path.to_owned()))
    }

    async fn size_file(&self, path: &str) -> Result<u64, RemoteError> {
        self.sizes.fetch_add(1, Ordering::SeqCst);
        self.files
            .get(path)
            .map(|b| b.len() as u64)
            .ok_or_else(|| RemoteError::NotFound(path.to_owned()))
    }
}

/// A [`MemoryStore`] that counts superblock saves.
#[derive(Debug, Default)]
pub struct CountingStore {
    inner: MemoryStore,
    saves: AtomicUsize,
}

impl CountingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn file_count(&self) -> usize {
        self.inner.file_count()
    }
}

#[async_trait]
impl DurableStore for CountingStore {
    async fn load_superblock(&self) -> Result<Option<Superblock>, StoreError> {
        self.inner.load_superblock().await
    }

    async fn save_superblock(&self, superblock: &Superblock) -> Result<(), StoreError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save_superblock(superblock).await
    }

    async fn wipe(&self) -> Result<(), StoreError> {
        self.inner.wipe().await
    }

    async fn read_file(&self, ino: Ino) -> Result<Option<Bytes>, StoreError> {
        self.inner.read_file(ino).await
    }

    async fn write_file(&self, ino: Ino, data: Bytes) -> Result<(), StoreError> {
        self.inner.write_file(ino, data).await
    }

    async fn unlink(&self, ino: Ino) -> Result<(), StoreError> {
        self.inner.unlink(ino).await
    }

    async fn content_high_water(&self) -> Result<Ino, StoreError> {
        self.inner.content_high_water().await
    }
}

/// Let spawned tasks that are ready run to completion.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

pub fn remote(mock: MockRemote) -> Arc<MockRemote> {
    Arc::new(mock)
}
