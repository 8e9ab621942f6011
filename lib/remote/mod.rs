//! Read-only remote sources used to populate a filesystem on demand.

/// HTTP remote source.
pub mod http;

pub use http::HttpSource;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::fs::Superblock;
use crate::fs::superblock::ParseError;

/// Failures of a remote source.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The remote has nothing at this path.
    #[error("remote has no entry at {0}")]
    NotFound(String),

    /// The remote answered with an unexpected status.
    #[error("remote returned HTTP {status} for {path}")]
    Status {
        /// Requested path.
        path: String,
        /// Status code received.
        status: u16,
    },

    /// The request timed out.
    #[error("remote request timed out")]
    Timeout,

    /// The remote could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// Any other transport failure.
    #[error("remote transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The remote superblock is malformed.
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// A path-addressed, read-only source of content and metadata.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// The remote's superblock. A remote without one yields an empty tree.
    async fn load_superblock(&self) -> Result<Superblock, RemoteError>;

    /// The content at `path`.
    async fn read_file(&self, path: &str) -> Result<Bytes, RemoteError>;

    /// The size of the content at `path`, without fetching it.
    async fn size_file(&self, path: &str) -> Result<u64, RemoteError>;
}
