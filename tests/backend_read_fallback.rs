#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use light_fs::fs::{Backend, FileData, FsError, FsOptions, Mode, Superblock, WriteOptions};
use light_fs::lock::LockTiming;
use light_fs::remote::RemoteSource;
use light_fs::store::{DurableStore, MemoryRegistry};

use common::{MockRemote, fast_timing, options};

const DOCS: &str = "docs\t755\n\ta.txt\t100644\t5\t1700000000000\n\tlatest\t120777\t0\t1700000000000\ta.txt\n";

fn with_remote(
    registry: &MemoryRegistry,
    name: &str,
    remote: &Arc<MockRemote>,
    url_auto: bool,
) -> Backend {
    Backend::new(
        Arc::new(registry.clone()),
        name,
        FsOptions {
            remote: Some(Arc::clone(remote) as Arc<dyn RemoteSource>),
            url_auto,
            ..options()
        },
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_store_is_populated_from_the_remote_superblock() {
    let registry = MemoryRegistry::new();
    let remote = Arc::new(MockRemote::new().with_superblock(DOCS));

    let b = with_remote(&registry, "seeded", &remote, false);
    b.activate().await.unwrap();
    assert_eq!(remote.superblock_loads(), 1);
    assert_eq!(b.stat("/docs/a.txt").unwrap().size, 5);
    assert!(b.save_pending(), "a remote tree must be persisted");

    b.deactivate().await.unwrap();
    let stored = registry
        .memory_store("seeded", "seeded_files")
        .load_superblock()
        .await
        .unwrap();
    assert!(stored.is_some());

    let again = with_remote(&registry, "seeded", &remote, false);
    again.activate().await.unwrap();
    assert_eq!(remote.superblock_loads(), 1, "store takes precedence");
    assert!(!again.save_pending());
    again.deactivate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn known_file_without_content_is_fetched_every_time() {
    let registry = MemoryRegistry::new();
    let remote = Arc::new(
        MockRemote::new()
            .with_superblock(DOCS)
            .with_file("/docs/a.txt", "hello"),
    );
    let b = with_remote(&registry, "fetch", &remote, false);
    b.activate().await.unwrap();
    let before = b.stat("/docs/a.txt").unwrap();

    let data = b.read_file("/docs/a.txt", Some("utf8")).await.unwrap();
    assert_eq!(data, FileData::Text(String::from("hello")));
    assert_eq!(b.stat("/docs/a.txt").unwrap(), before, "matching size leaves metadata");

    b.read_file("/docs/a.txt", None).await.unwrap();
    assert_eq!(remote.reads(), 2, "remote content is not cached");
    b.deactivate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_size_is_corrected_from_the_fetched_content() {
    let registry = MemoryRegistry::new();
    let remote = Arc::new(
        MockRemote::new()
            .with_superblock("a.bin\t100640\t3\t1700000000000\n")
            .with_file("/a.bin", vec![0u8; 8]),
    );
    let b = with_remote(&registry, "stale", &remote, false);
    b.activate().await.unwrap();
    let before = b.stat("/a.bin").unwrap();

    let data = b.read_file("/a.bin", None).await.unwrap();
    assert_eq!(data.len(), 8);

    let after = b.stat("/a.bin").unwrap();
    assert_eq!(after.size, 8);
    assert_eq!(after.ino, before.ino);
    assert_eq!(after.mode, Mode::from_raw(0o100_640), "mode is kept");
    assert!(b.save_pending());
    b.deactivate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn url_auto_materializes_unknown_paths() {
    let registry = MemoryRegistry::new();
    let remote = Arc::new(MockRemote::new().with_file("/new/dir/file.txt", "remote!"));
    let b = with_remote(&registry, "auto", &remote, true);
    b.activate().await.unwrap();

    let data = b.read_file("/new/dir/file.txt", None).await.unwrap();
    assert_eq!(data.into_bytes(), "remote!".as_bytes());

    let stat = b.stat("/new/dir/file.txt").unwrap();
    assert_eq!(stat.size, 7);
    assert_eq!(stat.mode, Mode::DEFAULT_FILE);
    assert!(b.stat("/new/dir").unwrap().is_dir());

    let missing = b.read_file("/nowhere", None).await.unwrap_err();
    assert!(matches!(missing, FsError::NotFound(_)), "got {missing:?}");
    b.deactivate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn without_url_auto_unknown_paths_stay_local() {
    let registry = MemoryRegistry::new();
    let remote = Arc::new(MockRemote::new().with_file("/elsewhere.txt", "x"));
    let b = with_remote(&registry, "manual", &remote, false);
    b.activate().await.unwrap();

    let err = b.read_file("/elsewhere.txt", None).await.unwrap_err();
    assert!(matches!(err, FsError::NotFound(_)), "got {err:?}");
    assert_eq!(remote.reads(), 0);
    b.deactivate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn symlinks_are_resolved_before_fetching() {
    let registry = MemoryRegistry::new();
    let remote = Arc::new(
        MockRemote::new()
            .with_superblock(DOCS)
            .with_file("/docs/a.txt", "hello"),
    );
    let b = with_remote(&registry, "links", &remote, false);
    b.activate().await.unwrap();

    let data = b.read_file("/docs/latest", Some("utf8")).await.unwrap();
    assert_eq!(data, FileData::Text(String::from("hello")));
    assert!(b.lstat("/docs/latest").unwrap().is_symlink());
    b.deactivate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dangling_symlink_is_filled_in_with_url_auto() {
    let registry = MemoryRegistry::new();
    let remote = Arc::new(MockRemote::new().with_file("/target.txt", "abc"));
    let b = with_remote(&registry, "dangling", &remote, true);
    b.activate().await.unwrap();
    b.symlink("/target.txt", "/link").unwrap();

    let data = b.read_file("/link", None).await.unwrap();
    assert_eq!(data.len(), 3);
    assert!(b.lstat("/link").unwrap().is_symlink());
    assert_eq!(b.stat("/link").unwrap().size, 3);
    b.deactivate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn loops_and_directories_are_not_fetched() {
    let registry = MemoryRegistry::new();
    let remote = Arc::new(MockRemote::new());
    let b = with_remote(&registry, "loops", &remote, true);
    b.activate().await.unwrap();
    b.symlink("/b", "/a").unwrap();
    b.symlink("/a", "/b").unwrap();
    b.mkdir("/dir", None).unwrap();

    let err = b.read_file("/a", None).await.unwrap_err();
    assert!(matches!(err, FsError::Loop(_)), "got {err:?}");
    let err = b.read_file("/dir", None).await.unwrap_err();
    assert!(matches!(err, FsError::IsDirectory(_)), "got {err:?}");
    assert_eq!(remote.reads(), 0);
    b.deactivate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stored_content_wins_over_the_remote() {
    let registry = MemoryRegistry::new();
    let remote = Arc::new(
        MockRemote::new()
            .with_superblock(DOCS)
            .with_file("/docs/a.txt", "remote"),
    );
    let b = with_remote(&registry, "local", &remote, true);
    b.activate().await.unwrap();

    b.write_file("/docs/a.txt", FileData::from("local"), WriteOptions::default())
        .await
        .unwrap();
    let data = b.read_file("/docs/a.txt", Some("utf8")).await.unwrap();
    assert_eq!(data, FileData::Text(String::from("local")));
    assert_eq!(remote.reads(), 0);
    b.deactivate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn back_file_registers_metadata_without_content() {
    let registry = MemoryRegistry::new();
    let remote = Arc::new(MockRemote::new().with_file("/big/blob.bin", vec![7u8; 1024]));
    let b = with_remote(&registry, "backed", &remote, false);
    b.activate().await.unwrap();

    let stat = b.back_file("/big/blob.bin", None).await.unwrap();
    assert_eq!(stat.size, 1024);
    assert_eq!(remote.sizes(), 1);
    assert_eq!(remote.reads(), 0);
    assert_eq!(registry.memory_store("backed", "backed_files").file_count(), 0);
    assert_eq!(b.du("/big").unwrap(), 1024);

    let data = b.read_file("/big/blob.bin", None).await.unwrap();
    assert_eq!(data.len(), 1024);
    assert_eq!(remote.reads(), 1);

    let missing = b.back_file("/big/missing.bin", None).await.unwrap_err();
    assert!(matches!(missing, FsError::NotFound(_)), "got {missing:?}");
    b.deactivate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_operations_need_a_remote() {
    let registry = MemoryRegistry::new();
    let b = Backend::new(Arc::new(registry.clone()), "no-remote", options());
    b.activate().await.unwrap();

    assert!(matches!(
        b.back_file("/x", None).await,
        Err(FsError::NoRemote)
    ));
    b.deactivate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn metadata_without_content_and_no_remote_is_not_found() {
    let registry = MemoryRegistry::new();
    registry
        .memory_store("ghost", "ghost_files")
        .save_superblock(&Superblock::parse_text("ghost.txt\t100644\t4\t1\n").unwrap())
        .await
        .unwrap();

    let b = Backend::new(Arc::new(registry.clone()), "ghost", options());
    b.activate().await.unwrap();
    assert_eq!(b.stat("/ghost.txt").unwrap().size, 4);
    let err = b.read_file("/ghost.txt", None).await.unwrap_err();
    assert!(matches!(err, FsError::NotFound(_)), "got {err:?}");
    b.deactivate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn encodings_other_than_utf8_are_rejected() {
    let registry = MemoryRegistry::new();
    let b = Backend::new(Arc::new(registry.clone()), "enc", options());
    b.activate().await.unwrap();
    b.write_file(
        "/bin",
        FileData::from(vec![0xff, 0xfe, 0x00]),
        WriteOptions::default(),
    )
    .await
    .unwrap();
    b.write_file("/text", FileData::from("héllo"), WriteOptions::default())
        .await
        .unwrap();

    assert_eq!(
        b.read_file("/text", Some("UTF-8")).await.unwrap(),
        FileData::Text(String::from("héllo"))
    );
    assert!(matches!(
        b.read_file("/text", Some("latin1")).await,
        Err(FsError::UnsupportedEncoding(_))
    ));
    assert!(matches!(
        b.read_file("/bin", Some("utf8")).await,
        Err(FsError::InvalidUtf8(_))
    ));
    let rejected = b
        .write_file(
            "/other",
            FileData::from("x"),
            WriteOptions {
                mode: None,
                encoding: Some(String::from("ascii")),
            },
        )
        .await;
    assert!(matches!(rejected, Err(FsError::UnsupportedEncoding(_))));
    assert!(b.stat("/other").is_err(), "rejected write leaves no metadata");
    b.deactivate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_file_behind_a_symlinked_parent_is_fetched_by_its_real_path() {
    let registry = MemoryRegistry::new();
    let remote = Arc::new(MockRemote::new().with_file("/real/x.txt", "canonical"));
    let b = with_remote(&registry, "canon", &remote, true);
    b.activate().await.unwrap();
    b.mkdir("/real", None).unwrap();
    b.symlink("/real", "/link").unwrap();

    let data = b.read_file("/link/x.txt", Some("utf8")).await.unwrap();
    assert_eq!(data, FileData::Text(String::from("canonical")));
    assert_eq!(b.stat("/real/x.txt").unwrap().size, 9);
    assert_eq!(b.readdir("/").unwrap(), vec!["real", "link"]);
    assert_eq!(remote.reads(), 1);
    b.deactivate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn content_left_by_a_crashed_context_is_not_served_for_new_files() {
    let registry = MemoryRegistry::new();
    let remote = Arc::new(MockRemote::new().with_file("/b.txt", "fresh"));
    let opts = || FsOptions {
        remote: Some(Arc::clone(&remote) as Arc<dyn RemoteSource>),
        lock_timing: LockTiming {
            ttl: Duration::from_millis(300),
            margin: Duration::from_millis(100),
            ..fast_timing()
        },
        ..options()
    };

    let crashed = Backend::new(Arc::new(registry.clone()), "crash", opts());
    crashed.activate().await.unwrap();
    crashed
        .write_file(
            "/a.txt",
            FileData::Text(String::from("STALE")),
            WriteOptions::default(),
        )
        .await
        .unwrap();
    // Gone without deactivating: the content is stored, the metadata never saved.
    drop(crashed);

    let next = Backend::new(Arc::new(registry.clone()), "crash", opts());
    next.activate().await.unwrap();
    assert!(matches!(next.stat("/a.txt"), Err(FsError::NotFound(_))));

    assert_eq!(next.back_file("/b.txt", None).await.unwrap().size, 5);
    assert_eq!(
        next.read_file("/b.txt", Some("utf8")).await.unwrap(),
        FileData::Text(String::from("fresh"))
    );
    assert_eq!(remote.reads(), 1);
    next.deactivate().await.unwrap();
}
