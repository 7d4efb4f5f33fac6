//! Fluid path helpers.
//!
//! A fluid path is the absolute logical name `/<prefix>/<relative path>`;
//! the prefix is the mount namespace. Fluid paths are the keys into the
//! global `names` keyspace.

/// Root of a mount namespace.
pub fn prefix_root(prefix: &str) -> String {
    format!("/{}", prefix.trim_matches('/'))
}

/// Joins a child name onto a fluid path.
pub fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{}/{name}", parent.trim_end_matches('/'))
    }
}

/// Parent of a fluid path; `None` at the filesystem root.
pub fn parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rsplit_once('/') {
        Some(("", _)) => Some("/"),
        Some((parent, _)) => Some(parent),
        None => None,
    }
}

/// Final component of a fluid path.
pub fn basename(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit_once('/')
        .map(|(_, name)| name)
        .unwrap_or(path)
}

/// First component: the mount prefix.
pub fn prefix(path: &str) -> Option<&str> {
    let mut parts = path.trim_start_matches('/').splitn(2, '/');
    match parts.next() {
        Some("") | None => None,
        Some(first) => Some(first),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_handles_root() {
        assert_eq!(join("/", "alpha"), "/alpha");
        assert_eq!(join("/alpha", "notes.txt"), "/alpha/notes.txt");
        assert_eq!(join("/alpha/sub/", "a.txt"), "/alpha/sub/a.txt");
    }

    #[test]
    fn parent_and_basename() {
        assert_eq!(parent("/alpha/sub/a.txt"), Some("/alpha/sub"));
        assert_eq!(parent("/alpha"), Some("/"));
        assert_eq!(parent("/"), None);
        assert_eq!(basename("/alpha/sub/a.txt"), "a.txt");
        assert_eq!(basename("/alpha"), "alpha");
    }

    #[test]
    fn prefix_is_first_component() {
        assert_eq!(prefix("/alpha/sub/a.txt"), Some("alpha"));
        assert_eq!(prefix("/alpha"), Some("alpha"));
        assert_eq!(prefix("/"), None);
        assert_eq!(prefix_root("alpha"), "/alpha");
    }
}
