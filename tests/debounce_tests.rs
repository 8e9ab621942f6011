#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use light_fs::fs::debounce::Debouncer;
use light_fs::fs::{FileSystem, FsOptions, WriteOptions};
use light_fs::store::{DurableStore, MemoryRegistry};

use common::{CountingStore, options, settle};

fn counted(store: &Arc<CountingStore>) -> FileSystem {
    FileSystem::open(
        Arc::new(MemoryRegistry::new()),
        "debounced",
        FsOptions {
            db: Some(Arc::clone(store) as Arc<dyn DurableStore>),
            ..options()
        },
    )
}

async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    settle().await;
}

#[tokio::test(start_paused = true)]
async fn only_the_last_scheduled_task_runs() {
    let debouncer = Debouncer::new(Duration::from_millis(100));
    let runs = Arc::new(AtomicUsize::new(0));
    let last = Arc::new(AtomicUsize::new(0));

    for i in 1..=3 {
        let runs = Arc::clone(&runs);
        let last = Arc::clone(&last);
        debouncer.schedule(move || async move {
            runs.fetch_add(1, Ordering::SeqCst);
            last.store(i, Ordering::SeqCst);
        });
        advance(50).await;
    }
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert!(debouncer.is_pending());

    advance(60).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(last.load(Ordering::SeqCst), 3);
    assert!(!debouncer.is_pending());
}

#[tokio::test(start_paused = true)]
async fn cancel_drops_the_pending_task() {
    let debouncer = Debouncer::new(Duration::from_millis(100));
    let runs = Arc::new(AtomicUsize::new(0));

    let r = Arc::clone(&runs);
    debouncer.schedule(move || async move {
        r.fetch_add(1, Ordering::SeqCst);
    });
    assert!(debouncer.cancel());
    assert!(!debouncer.cancel(), "nothing left to cancel");

    advance(500).await;
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn a_started_task_is_waited_for_instead_of_aborted() {
    let debouncer = Debouncer::new(Duration::from_millis(100));
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let (release, gate) = tokio::sync::oneshot::channel::<()>();

    let (s, f) = (Arc::clone(&started), Arc::clone(&finished));
    debouncer.schedule(move || async move {
        s.store(true, Ordering::SeqCst);
        gate.await.unwrap();
        f.store(true, Ordering::SeqCst);
    });
    advance(150).await;
    assert!(started.load(Ordering::SeqCst));

    tokio::join!(debouncer.cancel_and_wait(), async {
        release.send(()).unwrap();
    });
    assert!(finished.load(Ordering::SeqCst));
    assert!(!debouncer.is_pending());
}

#[tokio::test(start_paused = true)]
async fn cancel_leaves_a_started_task_running() {
    let debouncer = Debouncer::new(Duration::from_millis(100));
    let finished = Arc::new(AtomicBool::new(false));

    let f = Arc::clone(&finished);
    debouncer.schedule(move || async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        f.store(true, Ordering::SeqCst);
    });
    advance(150).await;
    assert!(!debouncer.cancel(), "the task was no longer waiting");

    advance(100).await;
    assert!(finished.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn mutations_within_the_quiet_period_coalesce() {
    let store = Arc::new(CountingStore::new());
    let fs = counted(&store);

    fs.mkdir("/a", None).await.unwrap();
    assert_eq!(store.saves(), 0, "activation of an empty store saves nothing");

    advance(300).await;
    fs.mkdir("/b", None).await.unwrap();
    advance(300).await;
    fs.write_file("/b/c.txt", "c", WriteOptions::default())
        .await
        .unwrap();
    advance(300).await;
    assert_eq!(store.saves(), 0, "each mutation restarts the timer");

    advance(250).await;
    assert_eq!(store.saves(), 1);

    advance(5_000).await;
    assert_eq!(store.saves(), 1);
    fs.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn flush_supersedes_the_pending_save() {
    let store = Arc::new(CountingStore::new());
    let fs = counted(&store);

    fs.mkdir("/a", None).await.unwrap();
    fs.flush().await.unwrap();
    assert_eq!(store.saves(), 1);

    advance(1_000).await;
    assert_eq!(store.saves(), 1, "the debounced save was cancelled");
    fs.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn close_saves_immediately() {
    let store = Arc::new(CountingStore::new());
    let fs = counted(&store);

    fs.write_file("/f", "x", WriteOptions::default())
        .await
        .unwrap();
    fs.close().await.unwrap();
    assert_eq!(store.saves(), 1);

    advance(1_000).await;
    assert_eq!(store.saves(), 1);

    let saved = store.load_superblock().await.unwrap().unwrap();
    assert_eq!(saved.root.du(), 1);
}

#[tokio::test(start_paused = true)]
async fn reads_do_not_schedule_saves() {
    let store = Arc::new(CountingStore::new());
    let fs = counted(&store);

    fs.write_file("/f", "x", WriteOptions::default())
        .await
        .unwrap();
    fs.flush().await.unwrap();

    fs.read_file("/f", None).await.unwrap();
    fs.stat("/f").await.unwrap();
    fs.readdir("/").await.unwrap();
    fs.du("/").await.unwrap();

    advance(1_000).await;
    assert_eq!(store.saves(), 1);
    fs.close().await.unwrap();
}
