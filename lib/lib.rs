//! light-fs shared library.
//!
//! An in-process POSIX-like filesystem whose metadata lives in memory while active, persisted
//! lazily to a durable store, optionally populated on demand from a read-only remote, and
//! guarded by a lock so independent execution contexts can share one store.

/// Filesystem types, the tree cache, the orchestrator and the client facade.
pub mod fs;
pub mod io;
/// Mutual exclusion between execution contexts.
pub mod lock;
/// Read-only remote sources.
pub mod remote;
/// Durable stores and their registries.
pub mod store;

pub use fs::{FileData, FileSystem, FsError, FsOptions, Mode, Stat, WriteOptions};
