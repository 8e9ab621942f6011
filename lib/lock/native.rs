use std::fs::File;
use std::os::unix::fs::MetadataExt as _;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use parking_lot::Mutex;
use tracing::debug;

use super::{LockError, LockTiming, ReleaseMode};

/// Advisory lock on `<dir>/<name>.lock`.
///
/// Holding the lock means holding an exclusive `flock` on the file that is *currently* at the
/// lock path. A forced release unlinks the file, which silently strips any holder of the lock
/// without needing to reach it.
#[derive(Debug)]
pub struct NativeLock {
    name: String,
    path: PathBuf,
    timing: LockTiming,
    held: Mutex<Option<Flock<File>>>,
}

impl NativeLock {
    /// Lock for `name` with its lock file under `dir`. Performs no I/O.
    #[must_use]
    pub fn new(dir: &Path, name: &str, timing: LockTiming) -> Self {
        let file_name: String = name
            .chars()
            .map(|c| if c == '/' { '_' } else { c })
            .collect();
        Self {
            name: name.to_owned(),
            path: dir.join(format!("{file_name}.lock")),
            timing,
            held: Mutex::new(None),
        }
    }

    /// The filesystem name this lock guards.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Timing parameters.
    #[must_use]
    pub fn timing(&self) -> &LockTiming {
        &self.timing
    }

    /// Whether `file` is still the file at the lock path.
    fn is_current(&self, file: &File) -> bool {
        let (Ok(held), Ok(on_disk)) = (file.metadata(), std::fs::metadata(&self.path)) else {
            return false;
        };
        held.dev() == on_disk.dev() && held.ino() == on_disk.ino()
    }

    /// Whether this context holds the lock.
    pub fn has(&self) -> Result<bool, LockError> {
        let mut held = self.held.lock();
        let Some(flock) = held.as_ref() else {
            return Ok(false);
        };
        if self.is_current(flock) {
            return Ok(true);
        }
        debug!(name = %self.name, "lock file was replaced, dropping stale flock");
        *held = None;
        Ok(false)
    }

    /// Try once to take the lock without blocking.
    pub fn try_acquire(&self) -> Result<bool, LockError> {
        let mut held = self.held.lock();
        if let Some(flock) = held.as_ref() {
            if self.is_current(flock) {
                return Err(LockError::DoubleLock(self.name.clone()));
            }
            *held = None;
        }

        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => {
                // The previous holder may have force-unlinked the path between open and lock.
                if !self.is_current(&flock) {
                    return Ok(false);
                }
                *held = Some(flock);
                debug!(name = %self.name, path = %self.path.display(), "acquired native lock");
                Ok(true)
            }
            Err((_, Errno::EWOULDBLOCK)) => Ok(false),
            Err((_, errno)) => Err(LockError::Io(std::io::Error::from(errno))),
        }
    }

    /// Release the lock. A forced release unlinks the lock file and never fails.
    pub fn release(&self, mode: ReleaseMode) -> Result<(), LockError> {
        let previous = self.held.lock().take();
        match mode {
            ReleaseMode::Force => {
                drop(previous);
                if let Err(e) = std::fs::remove_file(&self.path) {
                    debug!(name = %self.name, error = %e, "force release found no lock file");
                }
                Ok(())
            }
            ReleaseMode::Normal => {
                let Some(flock) = previous else {
                    return Err(LockError::DoubleFree(self.name.clone()));
                };
                if !self.is_current(&flock) {
                    return Err(LockError::LostOwnership(self.name.clone()));
                }
                drop(flock);
                debug!(name = %self.name, "released native lock");
                Ok(())
            }
        }
    }
}
