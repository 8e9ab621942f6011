//! The orchestrator: activation lifecycle, debounced persistence and the layered read path.
//!
//! A [`Backend`] owns one [`TreeCache`] and talks to exactly one durable store, one lock and at
//! most one remote source. Metadata operations are answered by the tree synchronously; content
//! operations go to the store, falling back to the remote.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, instrument, warn};

use super::debounce::Debouncer;
use super::error::FsError;
use super::superblock::Superblock;
use super::tree::{MAX_SYMLINK_HOPS, TreeCache};
use super::{FileData, Mode, Stat, UTF8, WriteOptions, path};
use crate::lock::{FsLock, LockStrategy, LockTiming, ReleaseMode};
use crate::remote::{HttpSource, RemoteSource};
use crate::store::{DurableStore, StoreRegistry};

/// Where a backend is in its activation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// No tree is loaded and the lock is not held.
    Inactive,
    /// Waiting for the lock or loading the superblock.
    Acquiring,
    /// The tree is loaded and the lock held.
    Active,
    /// Flushing, discarding the tree and releasing the lock.
    Deactivating,
}

/// Configuration of a [`Backend`].
#[derive(Clone)]
pub struct FsOptions {
    /// Wipe the durable store (and force-release the lock) on the next activation.
    pub wipe: bool,
    /// Base URL of an HTTP remote source.
    pub url: Option<String>,
    /// Fall back to the remote for paths the tree does not know about.
    pub url_auto: bool,
    /// A preconfigured durable store, used instead of the registry's.
    pub db: Option<Arc<dyn DurableStore>>,
    /// A preconfigured remote source, used instead of one built from `url`.
    pub remote: Option<Arc<dyn RemoteSource>>,
    /// Database name of the file store. Defaults to the filesystem name.
    pub file_db_name: Option<String>,
    /// Store name of the file store. Defaults to `{name}_files`.
    pub file_store_name: Option<String>,
    /// Database name of the lock store. Defaults to `{name}_lock`.
    pub lock_db_name: Option<String>,
    /// Store name of the lock store. Defaults to `{name}_lock`.
    pub lock_store_name: Option<String>,
    /// Which lock implementation to use.
    pub lock_strategy: LockStrategy,
    /// Lock timing parameters.
    pub lock_timing: LockTiming,
    /// Quiet period of the debounced superblock save.
    pub save_delay: Duration,
    /// Request timeout of an HTTP remote built from `url`.
    pub http_timeout: Duration,
}

impl Default for FsOptions {
    fn default() -> Self {
        Self {
            wipe: false,
            url: None,
            url_auto: false,
            db: None,
            remote: None,
            file_db_name: None,
            file_store_name: None,
            lock_db_name: None,
            lock_store_name: None,
            lock_strategy: LockStrategy::default(),
            lock_timing: LockTiming::default(),
            save_delay: Duration::from_millis(500),
            http_timeout: Duration::from_secs(30),
        }
    }
}

impl std::fmt::Debug for FsOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsOptions")
            .field("wipe", &self.wipe)
            .field("url", &self.url)
            .field("url_auto", &self.url_auto)
            .field("db", &self.db.is_some())
            .field("remote", &self.remote.is_some())
            .field("file_db_name", &self.file_db_name)
            .field("file_store_name", &self.file_store_name)
            .field("lock_db_name", &self.lock_db_name)
            .field("lock_store_name", &self.lock_store_name)
            .field("lock_strategy", &self.lock_strategy)
            .field("lock_timing", &self.lock_timing)
            .field("save_delay", &self.save_delay)
            .finish_non_exhaustive()
    }
}

/// State shared with the debounced save task.
struct Shared {
    name: String,
    tree: RwLock<TreeCache>,
    store: Arc<dyn DurableStore>,
    lock: FsLock,
    save_gate: tokio::sync::Mutex<()>,
}

impl Shared {
    /// Persist the current tree, but only while this context still holds the lock.
    async fn save_if_held(&self) -> Result<(), FsError> {
        match self.lock.has().await {
            Ok(true) => self.save().await,
            Ok(false) => {
                warn!(name = %self.name, "lock lost, skipping superblock save");
                Ok(())
            }
            Err(e) => {
                warn!(name = %self.name, error = %e, "could not check lock, skipping superblock save");
                Ok(())
            }
        }
    }

    /// Persist the current tree. Does nothing when no tree is loaded.
    async fn save(&self) -> Result<(), FsError> {
        let _gate = self.save_gate.lock().await;
        let snapshot = {
            let tree = self.tree.read();
            if !tree.is_active() {
                return Ok(());
            }
            tree.snapshot()?
        };
        self.store.save_superblock(&snapshot).await?;
        debug!(name = %self.name, "saved superblock");
        Ok(())
    }
}

/// Accept `None` or utf8, reject everything else.
fn check_encoding(encoding: Option<&str>) -> Result<(), FsError> {
    match encoding {
        None => Ok(()),
        Some(e) if e.eq_ignore_ascii_case(UTF8) || e.eq_ignore_ascii_case("utf-8") => Ok(()),
        Some(e) => Err(FsError::UnsupportedEncoding(e.to_owned())),
    }
}

/// The orchestrator of one named filesystem in one execution context.
pub struct Backend {
    registry: Arc<dyn StoreRegistry>,
    name: String,
    url_auto: bool,
    remote: Option<Arc<dyn RemoteSource>>,
    shared: Arc<Shared>,
    debouncer: Debouncer,
    state: Mutex<Lifecycle>,
    transition: tokio::sync::Mutex<()>,
    needs_wipe: AtomicBool,
    last_release_error: Mutex<Option<String>>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("state", &*self.state.lock())
            .field("url_auto", &self.url_auto)
            .field("remote", &self.remote.is_some())
            .field("lock", &self.shared.lock)
            .finish_non_exhaustive()
    }
}

impl Backend {
    /// Configure a backend for filesystem `name`. Performs no I/O; nothing happens until
    /// [`activate`](Self::activate).
    #[must_use]
    pub fn new(registry: Arc<dyn StoreRegistry>, name: &str, options: FsOptions) -> Self {
        let file_db = options.file_db_name.unwrap_or_else(|| name.to_owned());
        let file_store = options
            .file_store_name
            .unwrap_or_else(|| format!("{name}_files"));
        let lock_db = options
            .lock_db_name
            .unwrap_or_else(|| format!("{name}_lock"));
        let lock_store = options
            .lock_store_name
            .unwrap_or_else(|| format!("{name}_lock"));

        let store = options
            .db
            .unwrap_or_else(|| registry.file_store(&file_db, &file_store));
        let remote = options.remote.or_else(|| {
            options.url.as_deref().map(|url| {
                Arc::new(HttpSource::new(url, options.http_timeout)) as Arc<dyn RemoteSource>
            })
        });
        let lock = FsLock::new(
            registry.as_ref(),
            name,
            &lock_db,
            &lock_store,
            options.lock_strategy,
            options.lock_timing,
        );

        debug!(
            name,
            file_db = %file_db,
            file_store = %file_store,
            lock_db = %lock_db,
            lock_store = %lock_store,
            lock = ?lock.strategy(),
            wipe = options.wipe,
            remote = remote.is_some(),
            "configured backend"
        );

        Self {
            registry,
            name: name.to_owned(),
            url_auto: options.url_auto,
            remote,
            shared: Arc::new(Shared {
                name: name.to_owned(),
                tree: RwLock::new(TreeCache::new()),
                store,
                lock,
                save_gate: tokio::sync::Mutex::new(()),
            }),
            debouncer: Debouncer::new(options.save_delay),
            state: Mutex::new(Lifecycle::Inactive),
            transition: tokio::sync::Mutex::new(()),
            needs_wipe: AtomicBool::new(options.wipe),
            last_release_error: Mutex::new(None),
        }
    }

    /// Reconfigure this backend for another filesystem. Rejected while active.
    pub fn init(&mut self, name: &str, options: FsOptions) -> Result<(), FsError> {
        if self.lifecycle() != Lifecycle::Inactive {
            return Err(FsError::Busy(self.name.clone()));
        }
        *self = Self::new(Arc::clone(&self.registry), name, options);
        Ok(())
    }

    /// The filesystem name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        *self.state.lock()
    }

    /// Whether the backend is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.lifecycle() == Lifecycle::Active
    }

    /// The lock strategy resolved at construction.
    #[must_use]
    pub fn lock_strategy(&self) -> LockStrategy {
        self.shared.lock.strategy()
    }

    /// Whether a debounced save is waiting to run.
    #[must_use]
    pub fn save_pending(&self) -> bool {
        self.debouncer.is_pending()
    }

    /// The error of the last failed lock release during deactivation, if any.
    #[must_use]
    pub fn last_release_error(&self) -> Option<String> {
        self.last_release_error.lock().clone()
    }

    fn set_state(&self, next: Lifecycle) {
        let mut state = self.state.lock();
        debug!(name = %self.name, from = ?*state, to = ?next, "lifecycle transition");
        *state = next;
    }

    /// Take the lock and load the tree. Idempotent once active.
    #[instrument(name = "Backend::activate", skip(self), fields(name = %self.name))]
    pub async fn activate(&self) -> Result<(), FsError> {
        let _gate = self.transition.lock().await;
        if self.lifecycle() == Lifecycle::Active {
            return Ok(());
        }
        self.set_state(Lifecycle::Acquiring);

        match self.load().await {
            Ok(from_remote) => {
                self.set_state(Lifecycle::Active);
                if from_remote {
                    self.schedule_save();
                }
                Ok(())
            }
            Err(e) => {
                warn!(name = %self.name, error = %e, "activation failed");
                self.shared.tree.write().deactivate();
                if matches!(self.shared.lock.has().await, Ok(true))
                    && let Err(release) = self.shared.lock.release(ReleaseMode::Normal).await
                {
                    warn!(name = %self.name, error = %release, "failed to release lock");
                }
                self.set_state(Lifecycle::Inactive);
                Err(e)
            }
        }
    }

    /// The body of activation. Returns whether the tree came from the remote.
    async fn load(&self) -> Result<bool, FsError> {
        if self.needs_wipe.load(Ordering::Acquire) {
            debug!(name = %self.name, "wiping durable store");
            self.shared.store.wipe().await?;
            self.shared.lock.release(ReleaseMode::Force).await?;
            self.needs_wipe.store(false, Ordering::Release);
        }

        if !self.shared.lock.has().await? {
            self.shared.lock.wait().await?;
        }

        let (superblock, from_remote) = match self.shared.store.load_superblock().await? {
            Some(sb) => (sb, false),
            None => match &self.remote {
                Some(remote) => (remote.load_superblock().await?, true),
                None => (Superblock::empty(), false),
            },
        };
        let high_water = self.shared.store.content_high_water().await?;
        debug!(
            name = %self.name,
            from_remote,
            max_ino = superblock.max_ino(),
            high_water,
            "loaded superblock"
        );
        {
            let mut tree = self.shared.tree.write();
            tree.activate(Some(superblock))?;
            tree.reserve_through(high_water);
        }

        if !self.shared.lock.has().await? {
            return Err(FsError::ActivationTimeout(self.name.clone()));
        }
        Ok(from_remote)
    }

    /// Flush, drop the tree, release the lock and close the store.
    ///
    /// Ends inactive whatever happens. A failed final save is returned after cleanup; a
    /// failed lock release is logged and kept in [`last_release_error`](Self::last_release_error).
    #[instrument(name = "Backend::deactivate", skip(self), fields(name = %self.name))]
    pub async fn deactivate(&self) -> Result<(), FsError> {
        let _gate = self.transition.lock().await;
        if self.lifecycle() != Lifecycle::Active {
            return Ok(());
        }
        self.set_state(Lifecycle::Deactivating);

        self.debouncer.cancel_and_wait().await;
        let result = self.shared.save_if_held().await;
        self.shared.tree.write().deactivate();

        if let Err(e) = self.shared.lock.release(ReleaseMode::Normal).await {
            warn!(name = %self.name, error = %e, "failed to release lock");
            *self.last_release_error.lock() = Some(e.to_string());
        }
        if let Err(e) = self.shared.store.close().await {
            warn!(name = %self.name, error = %e, "failed to close store");
        }

        self.set_state(Lifecycle::Inactive);
        result
    }

    /// Arm the debounced superblock save.
    pub fn schedule_save(&self) {
        let shared = Arc::clone(&self.shared);
        self.debouncer.schedule(move || async move {
            if let Err(e) = shared.save_if_held().await {
                warn!(name = %shared.name, error = %e, "debounced superblock save failed");
            }
        });
    }

    /// Save the superblock now, superseding any pending debounced save.
    #[instrument(name = "Backend::flush", skip(self), fields(name = %self.name))]
    pub async fn flush(&self) -> Result<(), FsError> {
        if !self.is_active() {
            return Ok(());
        }
        self.debouncer.cancel_and_wait().await;
        self.shared.save_if_held().await
    }

    /// Read the content of `path`, as bytes or as utf8 text.
    ///
    /// Falls back to the remote when the store has no content, and re-materializes metadata
    /// for content that was missing from the tree or whose size changed.
    #[instrument(name = "Backend::read_file", skip(self))]
    pub async fn read_file(&self, p: &str, encoding: Option<&str>) -> Result<FileData, FsError> {
        check_encoding(encoding)?;

        let (stat, mut data) = match self.read_local(p).await {
            Ok((stat, data)) => (Some(stat), data),
            Err(e @ (FsError::IsDirectory(_) | FsError::NotActive)) => return Err(e),
            Err(e) if self.url_auto => {
                debug!(path = p, error = %e, "local read failed, trying remote");
                (None, None)
            }
            Err(e) => return Err(e),
        };

        if data.is_none()
            && let Some(remote) = &self.remote
        {
            let fetch_path = self.resolve_for_fetch(p)?;
            let fetched = remote.read_file(&fetch_path).await?;
            let fetched_len = fetched.len() as u64;
            if stat.as_ref().is_none_or(|s| s.size != fetched_len) {
                debug!(path = %fetch_path, size = fetched_len, "materializing remote metadata");
                {
                    let mut tree = self.shared.tree.write();
                    tree.mkdir_all(&path::dirname(&fetch_path), Mode::DEFAULT_DIRECTORY)?;
                    tree.write_stat(&fetch_path, fetched_len, stat.as_ref().map(|s| s.mode))?;
                }
                self.schedule_save();
            }
            data = Some(fetched);
        }

        let Some(data) = data else {
            return Err(FsError::NotFound(p.to_owned()));
        };
        match encoding {
            None => Ok(FileData::Binary(data)),
            Some(_) => String::from_utf8(data.to_vec())
                .map(FileData::Text)
                .map_err(|_| FsError::InvalidUtf8(p.to_owned())),
        }
    }

    /// Tree metadata plus store content, without any remote involvement.
    async fn read_local(&self, p: &str) -> Result<(Stat, Option<Bytes>), FsError> {
        let stat = self.shared.tree.read().stat(p)?;
        if stat.is_dir() {
            return Err(FsError::IsDirectory(p.to_owned()));
        }
        let data = self.shared.store.read_file(stat.ino).await?;
        Ok((stat, data))
    }

    /// Follow symlinks by repeated `lstat` to the path the remote should be asked for.
    ///
    /// When the final segment is unknown, the parent is canonicalized instead, so the remote is
    /// asked for the same path the metadata will be materialized at. A parent the tree does not
    /// know either leaves the path as is.
    fn resolve_for_fetch(&self, p: &str) -> Result<String, FsError> {
        let tree = self.shared.tree.read();
        let mut current = path::normalize(p);
        for _ in 0..=MAX_SYMLINK_HOPS {
            match tree.lstat(&current) {
                Ok(stat) => match stat.target {
                    Some(target) => current = path::resolve_link(&current, &target),
                    None => return Ok(current),
                },
                Err(e @ (FsError::NotActive | FsError::Loop(_))) => return Err(e),
                Err(_) => {
                    return match tree.realpath(&path::dirname(&current)) {
                        Ok(parent) => Ok(path::join(&parent, &path::basename(&current))),
                        Err(e @ (FsError::NotActive | FsError::Loop(_))) => Err(e),
                        Err(_) => Ok(current),
                    };
                }
            }
        }
        Err(FsError::Loop(p.to_owned()))
    }

    /// Create or replace the file at `path`.
    #[instrument(name = "Backend::write_file", skip(self, data), fields(len = data.len()))]
    pub async fn write_file(
        &self,
        p: &str,
        data: FileData,
        options: WriteOptions,
    ) -> Result<Stat, FsError> {
        check_encoding(options.encoding.as_deref())?;
        let bytes = data.into_bytes();
        let stat = self
            .shared
            .tree
            .write()
            .write_stat(p, bytes.len() as u64, options.mode)?;
        self.shared.store.write_file(stat.ino, bytes).await?;
        Ok(stat)
    }

    /// Remove a file or symlink, along with its stored content.
    #[instrument(name = "Backend::unlink", skip(self))]
    pub async fn unlink(&self, p: &str) -> Result<(), FsError> {
        let stat = self.shared.tree.write().unlink(p)?;
        if !stat.is_symlink() {
            self.shared.store.unlink(stat.ino).await?;
        }
        Ok(())
    }

    /// Move `old` to `new`. Content of a replaced file is removed from the store.
    #[instrument(name = "Backend::rename", skip(self))]
    pub async fn rename(&self, old: &str, new: &str) -> Result<(), FsError> {
        let replaced = self.shared.tree.write().rename(old, new)?;
        if let Some(stat) = replaced
            && stat.is_file()
        {
            self.shared.store.unlink(stat.ino).await?;
        }
        Ok(())
    }

    /// Create a metadata-only placeholder for a remote file, sized from the remote.
    #[instrument(name = "Backend::back_file", skip(self))]
    pub async fn back_file(&self, p: &str, mode: Option<Mode>) -> Result<Stat, FsError> {
        let remote = self.remote.as_ref().ok_or(FsError::NoRemote)?;
        let size = remote.size_file(p).await?;
        let mut tree = self.shared.tree.write();
        tree.mkdir_all(&path::dirname(p), Mode::DEFAULT_DIRECTORY)?;
        tree.write_stat(p, size, mode)
    }

    /// Child names of a directory.
    pub fn readdir(&self, p: &str) -> Result<Vec<String>, FsError> {
        self.shared.tree.read().readdir(p)
    }

    /// Create a directory, 0o777 unless a mode is given.
    pub fn mkdir(&self, p: &str, mode: Option<Mode>) -> Result<Stat, FsError> {
        self.shared
            .tree
            .write()
            .mkdir(p, mode.unwrap_or(Mode::DEFAULT_DIRECTORY))
    }

    /// Remove an empty directory.
    pub fn rmdir(&self, p: &str) -> Result<(), FsError> {
        self.shared.tree.write().rmdir(p).map(drop)
    }

    /// Metadata, following symlinks.
    pub fn stat(&self, p: &str) -> Result<Stat, FsError> {
        self.shared.tree.read().stat(p)
    }

    /// Metadata, not following a final symlink.
    pub fn lstat(&self, p: &str) -> Result<Stat, FsError> {
        self.shared.tree.read().lstat(p)
    }

    /// The raw target of a symlink.
    pub fn readlink(&self, p: &str) -> Result<String, FsError> {
        self.shared.tree.read().readlink(p)
    }

    /// Create a symlink at `p` pointing at `target`.
    pub fn symlink(&self, target: &str, p: &str) -> Result<Stat, FsError> {
        self.shared.tree.write().symlink(target, p)
    }

    /// Total file size beneath `p`.
    pub fn du(&self, p: &str) -> Result<u64, FsError> {
        self.shared.tree.read().du(p)
    }

    /// The current tree as a superblock.
    pub fn snapshot(&self) -> Result<Superblock, FsError> {
        self.shared.tree.read().snapshot()
    }
}
