//! Error taxonomy of the filesystem.

use thiserror::Error;

use crate::lock::LockError;
use crate::remote::RemoteError;
use crate::store::StoreError;

/// Every failure the filesystem surface can report.
///
/// Tree errors carry the path they were raised for. Each variant maps onto an errno through
/// `From<FsError> for i32` and onto its POSIX name through [`FsError::code`].
#[derive(Debug, Error)]
pub enum FsError {
    /// A path segment does not exist.
    #[error("no such file or directory: {0}")]
    NotFound(String),

    /// The directory still has children.
    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// The target already exists.
    #[error("file exists: {0}")]
    AlreadyExists(String),

    /// A path segment that must be a directory is not.
    #[error("not a directory: {0}")]
    NotDirectory(String),

    /// The operation does not accept a directory.
    #[error("is a directory: {0}")]
    IsDirectory(String),

    /// The arguments are not valid for this node.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Too many symbolic links were encountered while resolving a path.
    #[error("too many levels of symbolic links: {0}")]
    Loop(String),

    /// The lock could not be obtained before the wait timeout elapsed.
    #[error("timed out waiting for the lock of {0}")]
    LockTimeout(String),

    /// The lock was lost while the superblock was being loaded.
    #[error("lost the lock of {0} during activation")]
    ActivationTimeout(String),

    /// The requested text encoding is not supported.
    #[error("unsupported encoding: {0}")]
    UnsupportedEncoding(String),

    /// Content requested as text is not valid UTF-8.
    #[error("content of {0} is not valid utf8")]
    InvalidUtf8(String),

    /// The tree is not loaded.
    #[error("filesystem is not active")]
    NotActive,

    /// A remote operation was requested but no remote source is configured.
    #[error("no remote source configured")]
    NoRemote,

    /// The backend is active and cannot be reconfigured.
    #[error("filesystem {0} is active")]
    Busy(String),

    /// Lock failure.
    #[error(transparent)]
    Lock(LockError),

    /// Durable store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Remote source failure.
    #[error(transparent)]
    Remote(RemoteError),
}

impl FsError {
    /// The POSIX name of the error, e.g. `"ENOENT"`.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match i32::from(self) {
            libc::ENOENT => "ENOENT",
            libc::ENOTEMPTY => "ENOTEMPTY",
            libc::EEXIST => "EEXIST",
            libc::ENOTDIR => "ENOTDIR",
            libc::EISDIR => "EISDIR",
            libc::EINVAL => "EINVAL",
            libc::ELOOP => "ELOOP",
            libc::ETIMEDOUT => "ETIMEDOUT",
            libc::EBUSY => "EBUSY",
            libc::ENOTSUP => "ENOTSUP",
            libc::EILSEQ => "EILSEQ",
            libc::EBADF => "EBADF",
            libc::EPERM => "EPERM",
            libc::EDEADLK => "EDEADLK",
            _ => "EIO",
        }
    }

    /// Whether this error means the path does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Remote(RemoteError::NotFound(_)))
    }
}

impl From<LockError> for FsError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Timeout(name) => Self::LockTimeout(name),
            other => Self::Lock(other),
        }
    }
}

impl From<RemoteError> for FsError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::NotFound(path) => Self::NotFound(path),
            other => Self::Remote(other),
        }
    }
}

impl From<&FsError> for i32 {
    fn from(e: &FsError) -> Self {
        match e {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::NotEmpty(_) => libc::ENOTEMPTY,
            FsError::AlreadyExists(_) => libc::EEXIST,
            FsError::NotDirectory(_) => libc::ENOTDIR,
            FsError::IsDirectory(_) => libc::EISDIR,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::Loop(_) => libc::ELOOP,
            FsError::LockTimeout(_) | FsError::ActivationTimeout(_) => libc::ETIMEDOUT,
            FsError::UnsupportedEncoding(_) => libc::ENOTSUP,
            FsError::InvalidUtf8(_) => libc::EILSEQ,
            FsError::NotActive => libc::EBADF,
            FsError::NoRemote => libc::ENOTSUP,
            FsError::Busy(_) => libc::EBUSY,
            FsError::Lock(e) => e.into(),
            FsError::Store(_) | FsError::Remote(_) => libc::EIO,
        }
    }
}

impl From<FsError> for i32 {
    fn from(e: FsError) -> Self {
        Self::from(&e)
    }
}
