#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use light_fs::fs::{FileData, FileSystem, FsOptions, Mode, Superblock, TreeCache, WriteOptions};
use light_fs::lock::LockTiming;
use light_fs::store::dir::{DirLockStore, DirStore};
use light_fs::store::{DirRegistry, DurableStore, LockRecord, LockStore, StoreError};
use tokio::task::JoinSet;

fn sample_superblock() -> Superblock {
    let mut tree = TreeCache::new();
    tree.activate(None).unwrap();
    tree.mkdir("/docs", Mode::from_raw(0o755)).unwrap();
    tree.write_stat("/docs/a.txt", 5, Some(Mode::from_raw(0o100_644)))
        .unwrap();
    tree.symlink("docs/a.txt", "/latest").unwrap();
    tree.snapshot().unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn superblock_and_contents_survive_reopening() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db").join("files");
    let sb = sample_superblock();

    let store = DirStore::new(path.clone());
    assert_eq!(store.load_superblock().await.unwrap(), None);
    store.save_superblock(&sb).await.unwrap();
    store
        .write_file(1, Bytes::from_static(b"hello"))
        .await
        .unwrap();
    store.close().await.unwrap();

    let reopened = DirStore::new(path);
    assert_eq!(reopened.load_superblock().await.unwrap(), Some(sb));
    assert_eq!(
        reopened.read_file(1).await.unwrap(),
        Some(Bytes::from_static(b"hello"))
    );
    assert_eq!(reopened.read_file(2).await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unlink_and_wipe() {
    let dir = tempfile::tempdir().unwrap();
    let store = DirStore::new(dir.path().join("store"));

    store.save_superblock(&Superblock::empty()).await.unwrap();
    store.write_file(7, Bytes::from_static(b"x")).await.unwrap();
    store.unlink(7).await.unwrap();
    store.unlink(7).await.expect("unlinking absent content is fine");
    assert_eq!(store.read_file(7).await.unwrap(), None);

    store.write_file(8, Bytes::from_static(b"y")).await.unwrap();
    store.wipe().await.unwrap();
    assert_eq!(store.load_superblock().await.unwrap(), None);
    assert_eq!(store.read_file(8).await.unwrap(), None);
    assert!(store.path().join(".light_fs_store").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refuses_directories_with_foreign_data() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("precious.txt"), b"not ours").unwrap();

    let store = DirStore::new(dir.path().to_path_buf());
    let err = store.load_superblock().await.unwrap_err();
    assert!(matches!(err, StoreError::Foreign(_)), "got {err:?}");
    assert!(dir.path().join("precious.txt").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lock_store_updates_are_atomic() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(DirLockStore::new(dir.path().join("locks")));
    let mut set = JoinSet::new();

    for i in 0..8 {
        let store = Arc::clone(&store);
        set.spawn(async move {
            let me = format!("holder-{i}");
            let transition = store
                .update(
                    "fs",
                    Box::new(move |rec| match rec {
                        Some(r) => Some(r.clone()),
                        None => Some(LockRecord {
                            holder: me,
                            expires_at_ms: u64::MAX,
                        }),
                    }),
                )
                .await
                .unwrap();
            transition.previous.is_none()
        });
    }

    let mut winners = 0;
    while let Some(res) = set.join_next().await {
        if res.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one contender may create the record");
    assert!(store.get("fs").await.unwrap().is_some());

    store.update("fs", Box::new(|_| None)).await.unwrap();
    assert_eq!(store.get("fs").await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn torn_lock_record_reads_as_absent() {
    let dir = tempfile::tempdir().unwrap();
    let locks = dir.path().join("locks");
    std::fs::create_dir_all(&locks).unwrap();
    std::fs::write(locks.join("fs.json"), b"{\"holder\": \"half").unwrap();

    let store = DirLockStore::new(locks);
    assert_eq!(store.get("fs").await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn filesystem_on_disk_round_trips_across_handles() {
    let dir = tempfile::tempdir().unwrap();
    let opts = || FsOptions {
        lock_timing: LockTiming {
            interval: Duration::from_millis(10),
            timeout: Duration::from_secs(5),
            ..LockTiming::default()
        },
        ..FsOptions::default()
    };

    let first = FileSystem::open(Arc::new(DirRegistry::new(dir.path())), "notes", opts());
    first.mkdir("/docs", None).await.unwrap();
    first
        .write_file("/docs/today.md", "# today", WriteOptions::default())
        .await
        .unwrap();
    first.close().await.unwrap();

    let second = FileSystem::open(Arc::new(DirRegistry::new(dir.path())), "notes", opts());
    assert_eq!(
        second.read_file("/docs/today.md", Some("utf8")).await.unwrap(),
        FileData::Text(String::from("# today"))
    );
    assert_eq!(second.readdir("/docs").await.unwrap(), vec!["today.md"]);
    second.close().await.unwrap();

    assert!(dir.path().join("notes").join("notes_files").join("superblock.json").exists());
    assert!(dir.path().join("locks").join("notes.lock").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn high_water_covers_every_stored_ino() {
    let dir = tempfile::tempdir().unwrap();
    let store = DirStore::new(dir.path().join("store"));
    assert_eq!(store.content_high_water().await.unwrap(), 0);

    store.save_superblock(&sample_superblock()).await.unwrap();
    store.write_file(3, Bytes::from_static(b"a")).await.unwrap();
    store.write_file(12, Bytes::from_static(b"b")).await.unwrap();
    assert_eq!(store.content_high_water().await.unwrap(), 12);

    store.wipe().await.unwrap();
    assert_eq!(store.content_high_water().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_superblock_saves_never_tear() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(DirStore::new(dir.path().join("store")));
    assert_eq!(store.load_superblock().await.unwrap(), None);
    let small = Superblock::empty();
    let large = sample_superblock();
    let mut set = JoinSet::new();

    for i in 0..16 {
        let store = Arc::clone(&store);
        let sb = if i % 2 == 0 { small.clone() } else { large.clone() };
        set.spawn(async move { store.save_superblock(&sb).await });
    }
    while let Some(res) = set.join_next().await {
        res.unwrap().unwrap();
    }

    let loaded = store.load_superblock().await.unwrap().unwrap();
    assert!(loaded == small || loaded == large);
}
