//! The superblock: the whole tree minus file contents.
//!
//! Two encodings exist. The structured one is plain serde and is what the durable stores
//! persist. The text one is what remote sources publish as `.superblock.txt`: one entry per
//! line, indented with one tab per level of depth, fields separated by tabs.
//!
//! ```text
//! docs	755
//! 	readme.md	100644	12	1700000000000
//! 	latest	120777	9	1700000000000	readme.md
//! empty	755
//! ```

use hashlink::LinkedHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::tree::{Node, NodeKind, now_ms};
use super::{Ino, Mode, NodeType, ROOT_INO};

/// A malformed line in a text superblock.
#[derive(Debug, Error)]
#[error("invalid superblock at line {line}: {reason}")]
pub struct ParseError {
    /// One-based line number.
    pub line: usize,
    /// What was wrong with it.
    pub reason: String,
}

/// Serialized form of an entire tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    /// The root directory, owning everything else.
    pub root: Node,
}

impl Default for Superblock {
    fn default() -> Self {
        Self::empty()
    }
}

impl Superblock {
    /// A superblock holding only an empty root directory.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            root: Node::directory(ROOT_INO, Mode::DEFAULT_DIRECTORY, now_ms()),
        }
    }

    /// The largest ino in use.
    #[must_use]
    pub fn max_ino(&self) -> Ino {
        self.root.max_ino()
    }

    /// Parse the tab-indented text encoding. Inos are assigned from 1 in document order.
    pub fn parse_text(text: &str) -> Result<Self, ParseError> {
        let mut entries = Vec::new();
        let mut next_ino: Ino = 1;
        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            if raw.trim().is_empty() {
                continue;
            }
            let body = raw.trim_start_matches('\t');
            let depth = raw.len() - body.len();
            let node = parse_entry(body, next_ino).map_err(|reason| ParseError { line, reason })?;
            next_ino += 1;
            entries.push(Entry { line, depth, node });
        }

        let mut root = Node::directory(ROOT_INO, Mode::DEFAULT_DIRECTORY, now_ms());
        let mut cursor = 0;
        if let NodeKind::Directory { children } = &mut root.kind {
            attach(&mut entries, &mut cursor, 0, children)?;
        }
        if let Some(stray) = entries.get(cursor) {
            return Err(ParseError {
                line: stray.line,
                reason: String::from("indentation does not match any directory"),
            });
        }
        Ok(Self { root })
    }

    /// Print the tab-indented text encoding.
    #[must_use]
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        if let NodeKind::Directory { children } = &self.root.kind {
            print_children(children, 0, &mut out);
        }
        out
    }
}

struct Entry {
    line: usize,
    depth: usize,
    node: (String, Node),
}

fn parse_entry(body: &str, ino: Ino) -> Result<(String, Node), String> {
    let fields: Vec<&str> = body.split('\t').collect();
    let name = fields[0];
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(format!("invalid name {name:?}"));
    }
    let mode_field = fields
        .get(1)
        .ok_or_else(|| format!("missing mode for {name:?}"))?;
    let mode = u32::from_str_radix(mode_field, 8)
        .map(Mode::from_raw)
        .map_err(|e| format!("invalid mode {mode_field:?}: {e}"))?;

    let node_type = mode.node_type().unwrap_or(if fields.len() == 2 {
        NodeType::Directory
    } else {
        NodeType::File
    });

    let node = match node_type {
        NodeType::Directory => Node::directory(ino, mode, now_ms()),
        NodeType::File => {
            let size = parse_number(fields.get(2), "size")?;
            let mtime = parse_number(fields.get(3), "mtime")?;
            Node::file(ino, mode, size, mtime)
        }
        NodeType::Symlink => {
            let mtime = parse_number(fields.get(3), "mtime")?;
            let target = fields
                .get(4)
                .ok_or_else(|| format!("missing target for {name:?}"))?;
            Node::symlink(ino, mode, (*target).to_owned(), mtime)
        }
    };
    Ok((name.to_owned(), node))
}

/// Parse an integer field, truncating any fractional part.
fn parse_number(field: Option<&&str>, what: &str) -> Result<u64, String> {
    let Some(field) = field else {
        return Ok(0);
    };
    let whole = field.split('.').next().unwrap_or_default();
    whole
        .parse()
        .map_err(|e| format!("invalid {what} {field:?}: {e}"))
}

fn attach(
    entries: &mut [Entry],
    cursor: &mut usize,
    depth: usize,
    children: &mut LinkedHashMap<String, Node>,
) -> Result<(), ParseError> {
    while let Some(entry) = entries.get_mut(*cursor) {
        if entry.depth < depth {
            return Ok(());
        }
        if entry.depth > depth {
            return Err(ParseError {
                line: entry.line,
                reason: String::from("indentation does not match any directory"),
            });
        }
        let line = entry.line;
        let (name, mut node) = std::mem::replace(
            &mut entry.node,
            (String::new(), Node::file(0, Mode::empty(), 0, 0)),
        );
        *cursor += 1;
        if let NodeKind::Directory { children: nested } = &mut node.kind {
            attach(entries, cursor, depth + 1, nested)?;
        }
        if children.contains_key(&name) {
            return Err(ParseError {
                line,
                reason: format!("duplicate entry {name:?}"),
            });
        }
        children.insert(name, node);
    }
    Ok(())
}

fn print_children(children: &LinkedHashMap<String, Node>, depth: usize, out: &mut String) {
    for (name, node) in children {
        for _ in 0..depth {
            out.push('\t');
        }
        let mode = node.mode.bits();
        let line = match &node.kind {
            NodeKind::Directory { .. } => format!("{name}\t{mode:o}\n"),
            NodeKind::File => format!("{name}\t{mode:o}\t{}\t{}\n", node.size, node.mtime_ms),
            NodeKind::Symlink { target } => format!(
                "{name}\t{mode:o}\t{}\t{}\t{target}\n",
                node.size, node.mtime_ms
            ),
        };
        out.push_str(&line);
        if let NodeKind::Directory { children } = &node.kind {
            print_children(children, depth + 1, out);
        }
    }
}
