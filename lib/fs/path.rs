//! Virtual path strings.
//!
//! Paths inside the filesystem are always absolute, `/`-separated and free of `.` and `..`
//! once normalized. They never touch the host filesystem.

/// Separator between path segments.
pub const SEPARATOR: char = '/';

/// Normalize a virtual path.
///
/// Repeated separators and `.` segments are dropped, `..` pops the previous segment (and
/// stops at the root), and relative input is anchored at `/`.
#[must_use]
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split(SEPARATOR) {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    if parts.is_empty() {
        return String::from("/");
    }
    let mut out = String::with_capacity(path.len() + 1);
    for seg in parts {
        out.push(SEPARATOR);
        out.push_str(seg);
    }
    out
}

/// The segments of a normalized path, root excluded.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(SEPARATOR).filter(|s| !s.is_empty())
}

/// Split a path into its parent directory and final name.
///
/// Returns `None` for the root, which has neither.
#[must_use]
pub fn split(path: &str) -> Option<(String, String)> {
    let norm = normalize(path);
    if norm == "/" {
        return None;
    }
    let idx = norm.rfind(SEPARATOR)?;
    let name = norm[idx + 1..].to_owned();
    let parent = if idx == 0 {
        String::from("/")
    } else {
        norm[..idx].to_owned()
    };
    Some((parent, name))
}

/// The parent directory of a path. The root is its own parent.
#[must_use]
pub fn dirname(path: &str) -> String {
    split(path).map_or_else(|| String::from("/"), |(parent, _)| parent)
}

/// The final segment of a path, empty for the root.
#[must_use]
pub fn basename(path: &str) -> String {
    split(path).map(|(_, name)| name).unwrap_or_default()
}

/// Join a relative path onto a base directory and normalize.
///
/// An absolute `rel` replaces the base.
#[must_use]
pub fn join(base: &str, rel: &str) -> String {
    if rel.starts_with(SEPARATOR) {
        normalize(rel)
    } else {
        normalize(&format!("{base}/{rel}"))
    }
}

/// Resolve a symlink target relative to the directory holding the link.
#[must_use]
pub fn resolve_link(link_path: &str, target: &str) -> String {
    join(&dirname(link_path), target)
}

/// Whether `path` is `ancestor` or lies beneath it.
#[must_use]
pub fn is_within(path: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        return true;
    }
    path == ancestor
        || (path.starts_with(ancestor) && path[ancestor.len()..].starts_with(SEPARATOR))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_separators_and_dots() {
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("//a///b/"), "/a/b");
        assert_eq!(normalize("a/./b"), "/a/b");
        assert_eq!(normalize("/a/b/../c"), "/a/c");
        assert_eq!(normalize("/../../a"), "/a");
    }

    #[test]
    fn split_returns_parent_and_name() {
        assert_eq!(split("/"), None);
        assert_eq!(split("/a"), Some(("/".into(), "a".into())));
        assert_eq!(split("/a/b/c"), Some(("/a/b".into(), "c".into())));
        assert_eq!(dirname("/a/b"), "/a");
        assert_eq!(dirname("/"), "/");
        assert_eq!(basename("/a/b"), "b");
        assert_eq!(basename("/"), "");
    }

    #[test]
    fn join_and_resolve_link() {
        assert_eq!(join("/a", "b"), "/a/b");
        assert_eq!(join("/a", "/b"), "/b");
        assert_eq!(join("/a/b", "../c"), "/a/c");
        assert_eq!(resolve_link("/dir/link", "target.txt"), "/dir/target.txt");
        assert_eq!(resolve_link("/dir/link", "/abs"), "/abs");
    }

    #[test]
    fn is_within_respects_segment_boundaries() {
        assert!(is_within("/a/b", "/a"));
        assert!(is_within("/a", "/a"));
        assert!(is_within("/anything", "/"));
        assert!(!is_within("/ab", "/a"));
        assert!(!is_within("/a", "/a/b"));
    }
}
