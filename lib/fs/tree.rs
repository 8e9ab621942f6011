//! The in-memory directory tree.
//!
//! While a filesystem is active, [`TreeCache`] is the authoritative view of every piece of
//! metadata. All operations are synchronous and address nodes by path; nothing ever points
//! from a child back to its parent.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hashlink::LinkedHashMap;
use serde::{Deserialize, Serialize};

use super::error::FsError;
use super::path;
use super::superblock::Superblock;
use super::{Ino, Mode, NodeType, Stat};

/// How many symlinks a single path resolution may traverse.
pub const MAX_SYMLINK_HOPS: usize = 40;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// A node of the tree together with everything it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Identifier, stable for the node's lifetime.
    pub ino: Ino,
    /// Mode bits, opaque to the tree.
    pub mode: Mode,
    /// Size in bytes, zero unless this is a file.
    #[serde(default)]
    pub size: u64,
    /// Modification time in milliseconds since the Unix epoch.
    #[serde(default)]
    pub mtime_ms: u64,
    /// Kind-specific payload.
    #[serde(flatten)]
    pub kind: NodeKind,
}

/// What a [`Node`] is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeKind {
    /// A directory owning its children, in insertion order.
    Directory {
        /// Children by name.
        children: LinkedHashMap<String, Node>,
    },
    /// A regular file. Its content lives in the durable store under the node's ino.
    File,
    /// A symbolic link.
    Symlink {
        /// The raw, unresolved target.
        target: String,
    },
}

impl Node {
    /// An empty directory.
    #[must_use]
    pub fn directory(ino: Ino, mode: Mode, mtime_ms: u64) -> Self {
        Self {
            ino,
            mode,
            size: 0,
            mtime_ms,
            kind: NodeKind::Directory {
                children: LinkedHashMap::new(),
            },
        }
    }

    /// A regular file.
    #[must_use]
    pub fn file(ino: Ino, mode: Mode, size: u64, mtime_ms: u64) -> Self {
        Self {
            ino,
            mode,
            size,
            mtime_ms,
            kind: NodeKind::File,
        }
    }

    /// A symbolic link.
    #[must_use]
    pub fn symlink(ino: Ino, mode: Mode, target: String, mtime_ms: u64) -> Self {
        Self {
            ino,
            mode,
            size: 0,
            mtime_ms,
            kind: NodeKind::Symlink { target },
        }
    }

    /// The type of this node.
    #[must_use]
    pub fn node_type(&self) -> NodeType {
        match self.kind {
            NodeKind::Directory { .. } => NodeType::Directory,
            NodeKind::File => NodeType::File,
            NodeKind::Symlink { .. } => NodeType::Symlink,
        }
    }

    /// The metadata of this node.
    #[must_use]
    pub fn stat(&self) -> Stat {
        Stat {
            ino: self.ino,
            node_type: self.node_type(),
            mode: self.mode,
            size: self.size,
            mtime: UNIX_EPOCH + Duration::from_millis(self.mtime_ms),
            target: match &self.kind {
                NodeKind::Symlink { target } => Some(target.clone()),
                _ => None,
            },
        }
    }

    /// The largest ino in this subtree.
    #[must_use]
    pub fn max_ino(&self) -> Ino {
        match &self.kind {
            NodeKind::Directory { children } => children
                .values()
                .map(Self::max_ino)
                .fold(self.ino, Ino::max),
            _ => self.ino,
        }
    }

    /// Sum of file sizes in this subtree. Symlinks contribute nothing.
    #[must_use]
    pub fn du(&self) -> u64 {
        match &self.kind {
            NodeKind::Directory { children } => children.values().map(Self::du).sum(),
            NodeKind::File => self.size,
            NodeKind::Symlink { .. } => 0,
        }
    }

    fn children(&self) -> Option<&LinkedHashMap<String, Node>> {
        match &self.kind {
            NodeKind::Directory { children } => Some(children),
            _ => None,
        }
    }

    fn is_empty_dir(&self) -> bool {
        self.children().is_none_or(LinkedHashMap::is_empty)
    }

    fn children_mut(&mut self) -> Option<&mut LinkedHashMap<String, Node>> {
        match &mut self.kind {
            NodeKind::Directory { children } => Some(children),
            _ => None,
        }
    }
}

/// One pass of a path walk.
enum Walk<'a> {
    /// The walk reached its final node at this canonical path.
    Found(String, &'a Node),
    /// A symlink was crossed; walk again from the root along this path.
    Redirect(String),
}

/// The in-memory tree of an active filesystem.
#[derive(Debug, Default)]
pub struct TreeCache {
    root: Option<Node>,
    next_ino: Ino,
}

impl TreeCache {
    /// An inactive cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a tree is loaded.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.root.is_some()
    }

    /// Load a tree, replacing whatever was loaded. `None` loads an empty root.
    pub fn activate(&mut self, superblock: Option<Superblock>) -> Result<(), FsError> {
        let sb = superblock.unwrap_or_default();
        if sb.root.children().is_none() {
            return Err(FsError::InvalidArgument(String::from(
                "superblock root is not a directory",
            )));
        }
        self.next_ino = sb.max_ino() + 1;
        self.root = Some(sb.root);
        Ok(())
    }

    /// Never hand out `ino` or any ino below it. Content may outlive the metadata that named
    /// it, so inos already used in the store must not be reissued.
    pub fn reserve_through(&mut self, ino: Ino) {
        self.next_ino = self.next_ino.max(ino.saturating_add(1));
    }

    /// Discard the tree.
    pub fn deactivate(&mut self) {
        self.root = None;
        self.next_ino = 0;
    }

    /// Serialize the current tree.
    pub fn snapshot(&self) -> Result<Superblock, FsError> {
        Ok(Superblock {
            root: self.root()?.clone(),
        })
    }

    fn root(&self) -> Result<&Node, FsError> {
        self.root.as_ref().ok_or(FsError::NotActive)
    }

    /// Walk `target` once from the root, stopping at the first symlink that must be followed.
    fn walk<'a>(
        root: &'a Node,
        target: &str,
        original: &str,
        follow_last: bool,
    ) -> Result<Walk<'a>, FsError> {
        let segs: Vec<&str> = path::segments(target).collect();
        let mut node = root;
        let mut walked = String::new();
        for (i, seg) in segs.iter().enumerate() {
            let children = node
                .children()
                .ok_or_else(|| FsError::NotDirectory(original.to_owned()))?;
            let child = children
                .get(*seg)
                .ok_or_else(|| FsError::NotFound(original.to_owned()))?;
            walked.push(path::SEPARATOR);
            walked.push_str(seg);

            let is_last = i + 1 == segs.len();
            if let NodeKind::Symlink { target: link } = &child.kind
                && (follow_last || !is_last)
            {
                let mut next = path::resolve_link(&walked, link);
                for rest in &segs[i + 1..] {
                    next.push(path::SEPARATOR);
                    next.push_str(rest);
                }
                return Ok(Walk::Redirect(path::normalize(&next)));
            }
            node = child;
        }
        if walked.is_empty() {
            walked.push(path::SEPARATOR);
        }
        Ok(Walk::Found(walked, node))
    }

    /// Resolve a path to its canonical (symlink-free) form and node.
    fn resolve(&self, p: &str, follow_last: bool) -> Result<(String, &Node), FsError> {
        let root = self.root()?;
        let mut target = path::normalize(p);
        for _ in 0..=MAX_SYMLINK_HOPS {
            match Self::walk(root, &target, p, follow_last)? {
                Walk::Found(canonical, node) => return Ok((canonical, node)),
                Walk::Redirect(next) => target = next,
            }
        }
        Err(FsError::Loop(p.to_owned()))
    }

    /// Resolve the parent of `p` (following every symlink) and return its canonical path
    /// along with the final name. The root has no parent and is rejected with `on_root`.
    fn parent_of(&self, p: &str, on_root: FsError) -> Result<(String, String), FsError> {
        let Some((parent, name)) = path::split(p) else {
            return Err(on_root);
        };
        let (canonical, node) = self.resolve(&parent, true)?;
        if node.children().is_none() {
            return Err(FsError::NotDirectory(p.to_owned()));
        }
        Ok((canonical, name))
    }

    /// Mutable access to the children of a canonical directory path.
    fn dir_mut(&mut self, canonical: &str) -> Result<&mut LinkedHashMap<String, Node>, FsError> {
        let mut node = self.root.as_mut().ok_or(FsError::NotActive)?;
        for seg in path::segments(canonical) {
            node = node
                .children_mut()
                .and_then(|c| c.get_mut(seg))
                .ok_or_else(|| FsError::NotFound(canonical.to_owned()))?;
        }
        node.children_mut()
            .ok_or_else(|| FsError::NotDirectory(canonical.to_owned()))
    }

    /// Metadata of `p`, following every symlink.
    pub fn stat(&self, p: &str) -> Result<Stat, FsError> {
        self.resolve(p, true).map(|(_, node)| node.stat())
    }

    /// Metadata of `p`, without following a final symlink.
    pub fn lstat(&self, p: &str) -> Result<Stat, FsError> {
        self.resolve(p, false).map(|(_, node)| node.stat())
    }

    /// The canonical path `p` resolves to, following every symlink.
    pub fn realpath(&self, p: &str) -> Result<String, FsError> {
        self.resolve(p, true).map(|(canonical, _)| canonical)
    }

    /// Child names of a directory, in insertion order.
    pub fn readdir(&self, p: &str) -> Result<Vec<String>, FsError> {
        let (_, node) = self.resolve(p, true)?;
        let children = node
            .children()
            .ok_or_else(|| FsError::NotDirectory(p.to_owned()))?;
        Ok(children.keys().cloned().collect())
    }

    /// Create a directory.
    pub fn mkdir(&mut self, p: &str, mode: Mode) -> Result<Stat, FsError> {
        let (parent, name) = self.parent_of(p, FsError::AlreadyExists(p.to_owned()))?;
        let ino = self.next_ino;
        let children = self.dir_mut(&parent)?;
        if children.contains_key(&name) {
            return Err(FsError::AlreadyExists(p.to_owned()));
        }
        let node = Node::directory(ino, mode, now_ms());
        let stat = node.stat();
        children.insert(name, node);
        self.next_ino += 1;
        Ok(stat)
    }

    /// Create every missing directory along `p`. Existing directories are left alone.
    pub fn mkdir_all(&mut self, p: &str, mode: Mode) -> Result<(), FsError> {
        let mut prefix = String::new();
        for seg in path::segments(&path::normalize(p)).map(str::to_owned).collect::<Vec<_>>() {
            prefix.push(path::SEPARATOR);
            prefix.push_str(&seg);
            match self.stat(&prefix) {
                Ok(stat) if stat.is_dir() => {}
                Ok(_) => return Err(FsError::NotDirectory(prefix)),
                Err(FsError::NotFound(_)) => {
                    self.mkdir(&prefix, mode)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Remove an empty directory. The root is never removable.
    pub fn rmdir(&mut self, p: &str) -> Result<Stat, FsError> {
        let (parent, name) = self.parent_of(p, FsError::NotEmpty(p.to_owned()))?;
        let children = self.dir_mut(&parent)?;
        let node = children
            .get(&name)
            .ok_or_else(|| FsError::NotFound(p.to_owned()))?;
        match node.children() {
            None => return Err(FsError::NotDirectory(p.to_owned())),
            Some(c) if !c.is_empty() => return Err(FsError::NotEmpty(p.to_owned())),
            Some(_) => {}
        }
        let stat = node.stat();
        children.remove(&name);
        Ok(stat)
    }

    /// Remove a file or symlink, never following the final segment. Returns the removed
    /// node's metadata.
    pub fn unlink(&mut self, p: &str) -> Result<Stat, FsError> {
        let (parent, name) = self.parent_of(p, FsError::IsDirectory(p.to_owned()))?;
        let children = self.dir_mut(&parent)?;
        let node = children
            .get(&name)
            .ok_or_else(|| FsError::NotFound(p.to_owned()))?;
        if node.children().is_some() {
            return Err(FsError::IsDirectory(p.to_owned()));
        }
        let stat = node.stat();
        children.remove(&name);
        Ok(stat)
    }

    /// Move a node to a new path, keeping its ino and subtree.
    ///
    /// When the destination exists and is compatible it is replaced and its metadata
    /// returned.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<Option<Stat>, FsError> {
        let (old_parent, old_name) =
            self.parent_of(old, FsError::InvalidArgument(old.to_owned()))?;
        let (new_parent, new_name) =
            self.parent_of(new, FsError::InvalidArgument(new.to_owned()))?;

        let old_canonical = path::join(&old_parent, &old_name);
        let new_canonical = path::join(&new_parent, &new_name);

        let (moving_is_dir, replaced) = {
            let (_, old_dir) = self.resolve(&old_parent, true)?;
            let moving = old_dir
                .children()
                .and_then(|c| c.get(&old_name))
                .ok_or_else(|| FsError::NotFound(old.to_owned()))?;
            let (_, new_dir) = self.resolve(&new_parent, true)?;
            let existing = new_dir.children().and_then(|c| c.get(&new_name));
            (moving.children().is_some(), existing.map(|n| (n.stat(), n.is_empty_dir())))
        };

        if old_canonical == new_canonical {
            return Ok(None);
        }
        if moving_is_dir && path::is_within(&new_canonical, &old_canonical) {
            return Err(FsError::InvalidArgument(new.to_owned()));
        }
        if let Some((existing, empty)) = &replaced {
            match (moving_is_dir, existing.is_dir()) {
                (true, true) if !empty => return Err(FsError::NotEmpty(new.to_owned())),
                (true, false) => return Err(FsError::NotDirectory(new.to_owned())),
                (false, true) => return Err(FsError::IsDirectory(new.to_owned())),
                _ => {}
            }
        }

        let node = self
            .dir_mut(&old_parent)?
            .remove(&old_name)
            .ok_or_else(|| FsError::NotFound(old.to_owned()))?;
        let dest = self.dir_mut(&new_parent)?;
        dest.remove(&new_name);
        dest.insert(new_name, node);
        Ok(replaced.map(|(stat, _)| stat))
    }

    /// Create a symlink at `p` pointing at the unresolved `target`.
    pub fn symlink(&mut self, target: &str, p: &str) -> Result<Stat, FsError> {
        let (parent, name) = self.parent_of(p, FsError::AlreadyExists(p.to_owned()))?;
        let ino = self.next_ino;
        let children = self.dir_mut(&parent)?;
        if children.contains_key(&name) {
            return Err(FsError::AlreadyExists(p.to_owned()));
        }
        let node = Node::symlink(ino, Mode::DEFAULT_SYMLINK, target.to_owned(), now_ms());
        let stat = node.stat();
        children.insert(name, node);
        self.next_ino += 1;
        Ok(stat)
    }

    /// The raw target of a symlink.
    pub fn readlink(&self, p: &str) -> Result<String, FsError> {
        let (_, node) = self.resolve(p, false)?;
        match &node.kind {
            NodeKind::Symlink { target } => Ok(target.clone()),
            _ => Err(FsError::InvalidArgument(p.to_owned())),
        }
    }

    /// Where a create-or-update of `p` lands: its canonical path after following any chain of
    /// symlinks at the final segment, dangling ones included.
    fn write_target(&self, p: &str) -> Result<String, FsError> {
        let mut current = path::normalize(p);
        for _ in 0..=MAX_SYMLINK_HOPS {
            let (parent, name) = self.parent_of(&current, FsError::IsDirectory(p.to_owned()))?;
            let canonical = path::join(&parent, &name);
            let (_, dir) = self.resolve(&parent, true)?;
            match dir.children().and_then(|c| c.get(&name)).map(|n| &n.kind) {
                Some(NodeKind::Symlink { target }) => {
                    current = path::resolve_link(&canonical, target);
                }
                Some(NodeKind::Directory { .. }) => {
                    return Err(FsError::IsDirectory(p.to_owned()));
                }
                Some(NodeKind::File) | None => return Ok(canonical),
            }
        }
        Err(FsError::Loop(p.to_owned()))
    }

    /// Create or update the metadata of a file.
    ///
    /// A new file gets a fresh ino and `mode` (0o666 when absent). An existing file keeps its
    /// ino, and its mode unless one is given.
    pub fn write_stat(&mut self, p: &str, size: u64, mode: Option<Mode>) -> Result<Stat, FsError> {
        let canonical = self.write_target(p)?;
        let (parent, name) = path::split(&canonical).ok_or_else(|| FsError::IsDirectory(p.to_owned()))?;
        let ino = self.next_ino;
        let children = self.dir_mut(&parent)?;
        let stat = if let Some(node) = children.get_mut(&name) {
            node.size = size;
            node.mtime_ms = now_ms();
            if let Some(mode) = mode {
                node.mode = mode;
            }
            node.stat()
        } else {
            let node = Node::file(ino, mode.unwrap_or(Mode::DEFAULT_FILE), size, now_ms());
            let stat = node.stat();
            children.insert(name, node);
            self.next_ino += 1;
            stat
        };
        Ok(stat)
    }

    /// Total size of the files under `p`.
    pub fn du(&self, p: &str) -> Result<u64, FsError> {
        self.resolve(p, true).map(|(_, node)| node.du())
    }
}
