use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

const WAITING: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;

#[derive(Debug)]
struct Pending {
    phase: Arc<AtomicU8>,
    handle: JoinHandle<()>,
}

impl Pending {
    /// Stop the task if it is still sleeping. A task that already started is left to finish.
    fn cancel(self) -> Option<JoinHandle<()>> {
        match self
            .phase
            .compare_exchange(WAITING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.handle.abort();
                None
            }
            Err(_) => Some(self.handle),
        }
    }
}

/// Trailing-edge debouncer: runs the most recently scheduled task once `delay` has passed
/// without another schedule.
///
/// Each [`schedule`](Self::schedule) cancels the previously pending task and arms a new timer.
/// Cancelling only ever stops a task that is still waiting out its delay; a task that has
/// started always runs to completion. Dropping the debouncer cancels whatever is waiting.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    pending: Mutex<Option<Pending>>,
}

impl Debouncer {
    /// A debouncer with the given quiet period.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Mutex::new(None),
        }
    }

    /// The quiet period.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Arm the timer for `task`, replacing any pending one. Must be called within a tokio
    /// runtime.
    pub fn schedule<F, Fut>(&self, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = self.delay;
        let phase = Arc::new(AtomicU8::new(WAITING));
        let task_phase = Arc::clone(&phase);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if task_phase
                .compare_exchange(WAITING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                task().await;
            }
        });
        let previous = self.pending.lock().replace(Pending { phase, handle });
        // A superseded task that already started keeps running detached.
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    /// Drop the pending task if it is still waiting. Returns whether one was.
    pub fn cancel(&self) -> bool {
        let Some(pending) = self.pending.lock().take() else {
            return false;
        };
        let waiting = !pending.handle.is_finished();
        pending.cancel().is_none() && waiting
    }

    /// Like [`cancel`](Self::cancel), but when the task has already started, wait for it to
    /// finish.
    pub async fn cancel_and_wait(&self) {
        let Some(pending) = self.pending.lock().take() else {
            return;
        };
        if let Some(running) = pending.cancel()
            && let Err(e) = running.await
            && e.is_panic()
        {
            warn!(error = %e, "debounced task panicked");
        }
    }

    /// Whether a scheduled task has not completed yet.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .is_some_and(|pending| !pending.handle.is_finished())
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.get_mut().take() {
            pending.cancel();
        }
    }
}
