//! Filesystem types and the layers built on them.

/// Activation lifecycle, debounced persistence and the layered read path.
pub mod backend;
/// Lazily-activating client facade over a [`backend::Backend`].
pub mod client;
/// Schedule-or-cancel timer for trailing-edge saves.
pub mod debounce;
/// Error taxonomy shared by every layer.
pub mod error;
/// Virtual POSIX path strings.
pub mod path;
/// Serialized form of the metadata tree.
pub mod superblock;
/// The in-memory directory tree.
pub mod tree;

pub use backend::{Backend, FsOptions, Lifecycle};
pub use client::FileSystem;
pub use error::FsError;
pub use superblock::Superblock;
pub use tree::TreeCache;

use std::time::SystemTime;

use bitflags::bitflags;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Opaque identifier of a node, stable for the node's lifetime. Used as the content key in
/// the durable store.
pub type Ino = u64;

/// The ino reserved for the root directory.
pub const ROOT_INO: Ino = 0;

bitflags! {
    /// Mode bits of a node, similar to Unix `st_mode`.
    ///
    /// The tree never interprets permission bits; they are carried through opaquely. Unknown
    /// bits are retained.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Mode: u32 {
        /// Other: execute permission.
        const OTHER_EXECUTE = 1 << 0;
        /// Other: write permission.
        const OTHER_WRITE   = 1 << 1;
        /// Other: read permission.
        const OTHER_READ    = 1 << 2;

        /// Group: execute permission.
        const GROUP_EXECUTE = 1 << 3;
        /// Group: write permission.
        const GROUP_WRITE   = 1 << 4;
        /// Group: read permission.
        const GROUP_READ    = 1 << 5;

        /// Owner: execute permission.
        const OWNER_EXECUTE = 1 << 6;
        /// Owner: write permission.
        const OWNER_WRITE   = 1 << 7;
        /// Owner: read permission.
        const OWNER_READ    = 1 << 8;

        /// Sticky bit.
        const STICKY        = 1 << 9;
        /// Set-group-ID bit.
        const SETGID        = 1 << 10;
        /// Set-user-ID bit.
        const SETUID        = 1 << 11;

        /// Regular file type bits.
        const TYPE_FILE      = 0o100_000;
        /// Directory type bits.
        const TYPE_DIRECTORY = 0o040_000;
        /// Symbolic link type bits.
        const TYPE_SYMLINK   = 0o120_000;
    }
}

// Persisted as the raw number so unknown bits survive a round trip.
impl Serialize for Mode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

impl<'de> Deserialize<'de> for Mode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u32::deserialize(deserializer).map(Self::from_bits_retain)
    }
}

impl Mode {
    /// Mask covering the file type bits.
    pub const TYPE_MASK: u32 = 0o170_000;

    /// Default mode of directories created without an explicit mode.
    pub const DEFAULT_DIRECTORY: Self = Self::from_bits_retain(0o777);
    /// Default mode of files created without an explicit mode.
    pub const DEFAULT_FILE: Self = Self::from_bits_retain(0o666);
    /// Mode given to every symlink.
    pub const DEFAULT_SYMLINK: Self = Self::from_bits_retain(0o120_000);

    /// Build a mode from raw bits, keeping every bit.
    #[must_use]
    pub const fn from_raw(bits: u32) -> Self {
        Self::from_bits_retain(bits)
    }

    /// The node type encoded in the `S_IFMT` bits, if any.
    #[must_use]
    pub const fn node_type(self) -> Option<NodeType> {
        match self.bits() & Self::TYPE_MASK {
            0o100_000 => Some(NodeType::File),
            0o040_000 => Some(NodeType::Directory),
            0o120_000 => Some(NodeType::Symlink),
            _ => None,
        }
    }
}

/// The type of a node in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// A regular file.
    File,
    /// A directory.
    Directory,
    /// A symbolic link.
    Symlink,
}

/// Metadata of a single node, as returned by `stat`/`lstat`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Stat {
    /// The node's identifier.
    pub ino: Ino,
    /// What kind of node this is.
    pub node_type: NodeType,
    /// Mode bits.
    pub mode: Mode,
    /// Size in bytes. Always zero for directories and symlinks.
    pub size: u64,
    /// Last modification time.
    pub mtime: SystemTime,
    /// The raw target of a symlink.
    pub target: Option<String>,
}

impl Stat {
    /// Whether this node is a regular file.
    #[must_use]
    pub fn is_file(&self) -> bool {
        self.node_type == NodeType::File
    }

    /// Whether this node is a directory.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.node_type == NodeType::Directory
    }

    /// Whether this node is a symbolic link.
    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.node_type == NodeType::Symlink
    }
}

/// The only text encoding the filesystem speaks.
pub const UTF8: &str = "utf8";

/// Content handed to or returned from the content operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileData {
    /// Raw bytes.
    Binary(Bytes),
    /// Text, stored as UTF-8.
    Text(String),
}

impl FileData {
    /// Byte length of the stored representation.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Binary(b) => b.len(),
            Self::Text(s) => s.len(),
        }
    }

    /// Whether the content is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The content as bytes.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        match self {
            Self::Binary(b) => b,
            Self::Text(s) => Bytes::from(s),
        }
    }
}

impl From<Bytes> for FileData {
    fn from(b: Bytes) -> Self {
        Self::Binary(b)
    }
}

impl From<Vec<u8>> for FileData {
    fn from(v: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(v))
    }
}

impl From<&'static [u8]> for FileData {
    fn from(v: &'static [u8]) -> Self {
        Self::Binary(Bytes::from_static(v))
    }
}

impl From<String> for FileData {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for FileData {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

/// Options accepted by `write_file`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Mode of the file. Keeps the current mode (or 0o666 for new files) when `None`.
    pub mode: Option<Mode>,
    /// Encoding of text content. Only `"utf8"` is accepted; `None` means utf8.
    pub encoding: Option<String>,
}
