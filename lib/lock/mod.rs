//! Mutual exclusion between execution contexts opening the same filesystem name.
//!
//! Two strategies exist and one is chosen when a backend is configured:
//!
//! - [`NativeLock`] takes an advisory `flock(2)` on `<lock dir>/<name>.lock`. Only available
//!   when the [`StoreRegistry`] exposes a lock directory.
//! - [`CooperativeLock`] keeps a `{holder, expires_at_ms}` record in a [`LockStore`], renewed
//!   by a heartbeat. An expired record may be reclaimed by anyone.

/// Record-based locking with heartbeat and expiry.
pub mod cooperative;
/// `flock(2)`-based locking.
pub mod native;

pub use cooperative::CooperativeLock;
pub use native::NativeLock;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::store::{StoreError, StoreRegistry};

/// Failures of lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock was not obtained within the configured timeout.
    #[error("timed out waiting for lock {0}")]
    Timeout(String),

    /// This context tried to acquire a lock it already holds.
    #[error("lock {0} is already held by this context")]
    DoubleLock(String),

    /// This context released a lock nobody holds.
    #[error("lock {0} is not held")]
    DoubleFree(String),

    /// This context released a lock that now belongs to someone else.
    #[error("lock {0} was taken over by another holder")]
    LostOwnership(String),

    /// The lock file could not be accessed.
    #[error("lock IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The lock record store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<&LockError> for i32 {
    fn from(e: &LockError) -> Self {
        match e {
            LockError::Timeout(_) => libc::ETIMEDOUT,
            LockError::DoubleLock(_) => libc::EDEADLK,
            LockError::DoubleFree(_) | LockError::LostOwnership(_) => libc::EPERM,
            LockError::Io(_) | LockError::Store(_) => libc::EIO,
        }
    }
}

/// How a lock is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseMode {
    /// Release a lock this context holds. Fails when it does not.
    Normal,
    /// Clear the lock whoever holds it. Never fails.
    Force,
}

/// Which lock implementation to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStrategy {
    /// Native when the registry offers a lock directory, cooperative otherwise.
    #[default]
    Auto,
    /// Advisory `flock` on a lock file.
    Native,
    /// Record with heartbeat and expiry.
    Cooperative,
}

/// Timing parameters of a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTiming {
    /// Lifetime of a cooperative record between renewals.
    pub ttl: Duration,
    /// A record closer than this to expiry is renewed by `has`.
    pub margin: Duration,
    /// Delay between acquisition attempts while waiting.
    pub interval: Duration,
    /// Longest time `wait` keeps trying.
    pub timeout: Duration,
}

impl Default for LockTiming {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5),
            margin: Duration::from_secs(2),
            interval: Duration::from_millis(100),
            timeout: Duration::from_secs(600),
        }
    }
}

/// A filesystem lock using whichever strategy was resolved at construction.
#[derive(Debug)]
pub enum FsLock {
    /// `flock(2)` on a lock file.
    Native(NativeLock),
    /// Record in a lock store.
    Cooperative(CooperativeLock),
}

impl FsLock {
    /// Build the lock for filesystem `name`. Performs no I/O.
    ///
    /// An explicit [`LockStrategy::Native`] on a registry without a lock directory falls back
    /// to the cooperative strategy.
    #[must_use]
    pub fn new(
        registry: &dyn StoreRegistry,
        name: &str,
        lock_db: &str,
        lock_store: &str,
        strategy: LockStrategy,
        timing: LockTiming,
    ) -> Self {
        let native_dir = match strategy {
            LockStrategy::Cooperative => None,
            LockStrategy::Auto => registry.native_lock_dir(),
            LockStrategy::Native => {
                let dir = registry.native_lock_dir();
                if dir.is_none() {
                    warn!(name, "native locks unavailable, using cooperative lock");
                }
                dir
            }
        };

        match native_dir {
            Some(dir) => Self::Native(NativeLock::new(&dir, name, timing)),
            None => Self::Cooperative(CooperativeLock::new(
                registry.lock_store(lock_db, lock_store),
                name,
                timing,
            )),
        }
    }

    /// The strategy this lock ended up with.
    #[must_use]
    pub fn strategy(&self) -> LockStrategy {
        match self {
            Self::Native(_) => LockStrategy::Native,
            Self::Cooperative(_) => LockStrategy::Cooperative,
        }
    }

    /// Whether this context currently holds the lock.
    pub async fn has(&self) -> Result<bool, LockError> {
        match self {
            Self::Native(l) => l.has(),
            Self::Cooperative(l) => l.has().await,
        }
    }

    /// Try to take the lock once.
    pub async fn try_acquire(&self) -> Result<bool, LockError> {
        match self {
            Self::Native(l) => l.try_acquire(),
            Self::Cooperative(l) => l.try_acquire().await,
        }
    }

    /// Block until the lock is held or the timeout elapses.
    pub async fn wait(&self) -> Result<(), LockError> {
        let (interval, timeout, name) = match self {
            Self::Native(l) => (l.timing().interval, l.timing().timeout, l.name()),
            Self::Cooperative(l) => (l.timing().interval, l.timing().timeout, l.name()),
        };
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.try_acquire().await? {
                return Ok(());
            }
            if tokio::time::Instant::now() + interval > deadline {
                return Err(LockError::Timeout(name.to_owned()));
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Release the lock.
    pub async fn release(&self, mode: ReleaseMode) -> Result<(), LockError> {
        match self {
            Self::Native(l) => l.release(mode),
            Self::Cooperative(l) => l.release(mode).await,
        }
    }
}
