use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{LockError, LockTiming, ReleaseMode};
use crate::fs::tree::now_ms;
use crate::store::{LockRecord, LockStore};

/// A process-unique identity for a lock holder.
fn new_holder_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.subsec_nanos());
    format!(
        "{}-{}-{nanos:08x}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

fn millis(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Lock kept as a record in a [`LockStore`], with heartbeat and expiry.
///
/// A holder keeps its record alive by renewing it every `ttl / 2` from a background task.
/// Should the holder vanish, the record lapses after `ttl` and anyone may take it.
pub struct CooperativeLock {
    name: String,
    holder: String,
    store: Arc<dyn LockStore>,
    timing: LockTiming,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CooperativeLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CooperativeLock")
            .field("name", &self.name)
            .field("holder", &self.holder)
            .field("timing", &self.timing)
            .finish_non_exhaustive()
    }
}

impl CooperativeLock {
    /// Lock for `name` with its record in `store`. Performs no I/O.
    #[must_use]
    pub fn new(store: Arc<dyn LockStore>, name: &str, timing: LockTiming) -> Self {
        Self {
            name: name.to_owned(),
            holder: new_holder_id(),
            store,
            timing,
            heartbeat: Mutex::new(None),
        }
    }

    /// The filesystem name this lock guards.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// This context's holder identity.
    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Timing parameters.
    #[must_use]
    pub fn timing(&self) -> &LockTiming {
        &self.timing
    }

    /// Extend our record by a full ttl if we still hold it. Returns whether we do.
    async fn renew(
        store: &dyn LockStore,
        name: &str,
        holder: &str,
        ttl_ms: u64,
    ) -> Result<bool, LockError> {
        let me = holder.to_owned();
        let transition = store
            .update(
                name,
                Box::new(move |rec| {
                    let now = now_ms();
                    match rec {
                        Some(r) if r.holder == me && !r.is_expired(now) => Some(LockRecord {
                            holder: me,
                            expires_at_ms: now + ttl_ms,
                        }),
                        other => other.cloned(),
                    }
                }),
            )
            .await?;
        Ok(transition
            .current
            .is_some_and(|r| r.holder == holder && !r.is_expired(now_ms())))
    }

    /// Whether this context holds the lock. A record close to expiry is renewed.
    pub async fn has(&self) -> Result<bool, LockError> {
        let Some(record) = self.store.get(&self.name).await? else {
            return Ok(false);
        };
        let now = now_ms();
        if record.holder != self.holder || record.is_expired(now) {
            return Ok(false);
        }
        if record.expires_at_ms - now < millis(self.timing.margin) {
            return Self::renew(
                self.store.as_ref(),
                &self.name,
                &self.holder,
                millis(self.timing.ttl),
            )
            .await;
        }
        Ok(true)
    }

    /// Try once to take the lock. An expired record is reclaimed.
    pub async fn try_acquire(&self) -> Result<bool, LockError> {
        let me = self.holder.clone();
        let ttl_ms = millis(self.timing.ttl);
        let transition = self
            .store
            .update(
                &self.name,
                Box::new(move |rec| {
                    let now = now_ms();
                    match rec {
                        Some(r) if !r.is_expired(now) => Some(r.clone()),
                        _ => Some(LockRecord {
                            holder: me,
                            expires_at_ms: now + ttl_ms,
                        }),
                    }
                }),
            )
            .await?;

        let now = now_ms();
        if let Some(prev) = &transition.previous
            && prev.holder == self.holder
            && !prev.is_expired(now)
        {
            return Err(LockError::DoubleLock(self.name.clone()));
        }
        let acquired = transition
            .current
            .is_some_and(|r| r.holder == self.holder);
        if acquired {
            debug!(name = %self.name, holder = %self.holder, "acquired cooperative lock");
            self.start_heartbeat();
        }
        Ok(acquired)
    }

    fn start_heartbeat(&self) {
        let store = Arc::clone(&self.store);
        let name = self.name.clone();
        let holder = self.holder.clone();
        let ttl = self.timing.ttl;
        let handle = tokio::spawn(async move {
            let period = ttl / 2;
            loop {
                tokio::time::sleep(period).await;
                match Self::renew(store.as_ref(), &name, &holder, millis(ttl)).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(name = %name, "heartbeat found the lock gone, stopping");
                        return;
                    }
                    Err(e) => warn!(name = %name, error = %e, "failed to renew lock"),
                }
            }
        });
        if let Some(previous) = self.heartbeat.lock().replace(handle) {
            previous.abort();
        }
    }

    fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.abort();
        }
    }

    /// Release the lock.
    ///
    /// A normal release fails with `DoubleFree` when there is no record and with
    /// `LostOwnership` when someone else holds it. A forced release deletes any record.
    pub async fn release(&self, mode: ReleaseMode) -> Result<(), LockError> {
        self.stop_heartbeat();
        match mode {
            ReleaseMode::Force => {
                if let Err(e) = self.store.update(&self.name, Box::new(|_| None)).await {
                    warn!(name = %self.name, error = %e, "forced lock release failed");
                }
                Ok(())
            }
            ReleaseMode::Normal => {
                let me = self.holder.clone();
                let transition = self
                    .store
                    .update(
                        &self.name,
                        Box::new(move |rec| match rec {
                            Some(r) if r.holder == me => None,
                            other => other.cloned(),
                        }),
                    )
                    .await?;
                match transition.previous {
                    None => Err(LockError::DoubleFree(self.name.clone())),
                    Some(r) if r.holder != self.holder => {
                        Err(LockError::LostOwnership(self.name.clone()))
                    }
                    Some(_) => {
                        debug!(name = %self.name, "released cooperative lock");
                        Ok(())
                    }
                }
            }
        }
    }
}

impl Drop for CooperativeLock {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}
