//! The pseudo-Merkle blob tree.
//!
//! A per-replica summary of the blob store: one node per path component,
//! each interior node carrying the count (and byte size) of leaf files
//! beneath it. Equal counts do not prove equal blob sets; unequal counts
//! prove divergence, which is all anti-entropy needs for its fast compare.
//! Precise reconciliation exchanges the blob inventory itself.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fluid_core::error::{Error, Result};
use tracing::debug;

#[derive(Debug)]
struct TreeNode {
    name: String,
    parent: Option<usize>,
    children: BTreeMap<String, usize>,
    /// Leaf files at or beneath this node.
    count: u64,
    /// Bytes of leaf files at or beneath this node.
    size: u64,
}

#[derive(Debug)]
struct TreeInner {
    root_path: PathBuf,
    /// Arena; index 0 is the root.
    nodes: Vec<TreeNode>,
}

/// Count/size pair compared during anti-entropy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeSummary {
    pub count: u64,
    pub size: u64,
}

#[derive(Debug)]
pub struct BlobTree {
    inner: Mutex<TreeInner>,
}

impl BlobTree {
    /// An empty tree over the given storage root.
    pub fn new(root: impl Into<PathBuf>) -> BlobTree {
        BlobTree {
            inner: Mutex::new(TreeInner {
                root_path: root.into(),
                nodes: vec![TreeNode {
                    name: String::new(),
                    parent: None,
                    children: BTreeMap::new(),
                    count: 0,
                    size: 0,
                }],
            }),
        }
    }

    /// Builds the tree by walking the storage root, skipping hidden
    /// entries. A missing root yields an empty tree.
    pub async fn build(root: impl Into<PathBuf>) -> Result<BlobTree> {
        let root = root.into();
        let tree = BlobTree::new(&root);
        let mut pending = vec![root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound && dir == root => break,
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                if name.to_string_lossy().starts_with('.') {
                    continue;
                }
                let path = entry.path();
                let kind = entry.file_type().await?;
                if kind.is_dir() {
                    pending.push(path);
                } else {
                    let size = entry.metadata().await?.len();
                    tree.add_file(&path, size)?;
                }
            }
        }
        let summary = tree.summary();
        debug!(count = summary.count, size = summary.size, "blob tree built");
        Ok(tree)
    }

    /// Records one leaf file, creating interior nodes for each path
    /// component and incrementing every counter on the way down. Only
    /// valid on the root, for paths under the root.
    pub fn add_file(&self, path: &Path, size: u64) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| {
            Error::Internal("blob tree lock poisoned".into())
        })?;
        let rel = path
            .strip_prefix(&inner.root_path)
            .map_err(|_| {
                Error::InvalidArgument(format!(
                    "{} is not under the storage root {}",
                    path.display(),
                    inner.root_path.display()
                ))
            })?
            .to_path_buf();
        let components: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if components.is_empty() {
            return Err(Error::InvalidArgument(
                "cannot add the storage root itself".into(),
            ));
        }

        let mut current = 0usize;
        inner.nodes[0].count += 1;
        inner.nodes[0].size += size;
        for component in components {
            let next = match inner.nodes[current].children.get(&component) {
                Some(&id) => id,
                None => {
                    let id = inner.nodes.len();
                    inner.nodes.push(TreeNode {
                        name: component.clone(),
                        parent: Some(current),
                        children: BTreeMap::new(),
                        count: 0,
                        size: 0,
                    });
                    inner.nodes[current].children.insert(component, id);
                    id
                }
            };
            inner.nodes[next].count += 1;
            inner.nodes[next].size += size;
            current = next;
        }
        Ok(())
    }

    /// Total leaf files and bytes beneath the root.
    pub fn summary(&self) -> TreeSummary {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        TreeSummary {
            count: inner.nodes[0].count,
            size: inner.nodes[0].size,
        }
    }

    /// Count at the node addressed by path components from the root;
    /// `None` when no such node exists.
    pub fn count_at(&self, components: &[&str]) -> Option<u64> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut current = 0usize;
        for component in components {
            current = *inner.nodes[current].children.get(*component)?;
        }
        Some(inner.nodes[current].count)
    }

    /// Absolute path of the node, rebuilt through parent back-links.
    pub fn path_at(&self, components: &[&str]) -> Option<PathBuf> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut current = 0usize;
        for component in components {
            current = *inner.nodes[current].children.get(*component)?;
        }
        let mut names = Vec::new();
        let mut walk = current;
        while let Some(parent) = inner.nodes[walk].parent {
            names.push(inner.nodes[walk].name.clone());
            walk = parent;
        }
        let mut path = inner.root_path.clone();
        for name in names.into_iter().rev() {
            path.push(name);
        }
        Some(path)
    }

    /// Leaf file names with the `.blob` extension stripped: the local
    /// blob inventory pushed during anti-entropy.
    pub fn hashes(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut hashes = Vec::with_capacity(inner.nodes[0].count as usize);
        let mut stack = vec![0usize];
        while let Some(id) = stack.pop() {
            let node = &inner.nodes[id];
            if node.children.is_empty() && id != 0 {
                let hash = node
                    .name
                    .strip_suffix(".blob")
                    .unwrap_or(&node.name)
                    .to_string();
                hashes.push(hash);
            } else {
                stack.extend(node.children.values().copied());
            }
        }
        hashes.sort_unstable();
        hashes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_roll_up_to_every_ancestor() {
        let tree = BlobTree::new("/store");
        tree.add_file(Path::new("/store/x/y/a.blob"), 10).unwrap();
        tree.add_file(Path::new("/store/x/z/b.blob"), 20).unwrap();

        assert_eq!(tree.summary(), TreeSummary { count: 2, size: 30 });
        assert_eq!(tree.count_at(&["x"]), Some(2));
        assert_eq!(tree.count_at(&["x", "y"]), Some(1));
        assert_eq!(tree.count_at(&["x", "z"]), Some(1));
        assert_eq!(tree.count_at(&["w"]), None);
    }

    #[test]
    fn paths_rebuild_through_parent_links() {
        let tree = BlobTree::new("/store");
        tree.add_file(Path::new("/store/x/y/a.blob"), 1).unwrap();
        assert_eq!(
            tree.path_at(&["x", "y", "a.blob"]).unwrap(),
            PathBuf::from("/store/x/y/a.blob")
        );
        assert_eq!(tree.path_at(&[]).unwrap(), PathBuf::from("/store"));
    }

    #[test]
    fn foreign_paths_are_rejected() {
        let tree = BlobTree::new("/store");
        let err = tree.add_file(Path::new("/elsewhere/a.blob"), 1).unwrap_err();
        assert_eq!(err.kind(), fluid_core::ErrorKind::InvalidArgument);
        assert_eq!(tree.summary().count, 0);
    }

    #[test]
    fn inventory_strips_extension() {
        let tree = BlobTree::new("/store");
        tree.add_file(Path::new("/store/ab/cdef.blob"), 1).unwrap();
        tree.add_file(Path::new("/store/zz/ghij.blob"), 1).unwrap();
        assert_eq!(tree.hashes(), vec!["cdef".to_string(), "ghij".to_string()]);
    }

    #[tokio::test]
    async fn build_walks_disk_and_skips_hidden() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("x/y")).unwrap();
        std::fs::create_dir_all(root.join("x/z")).unwrap();
        std::fs::write(root.join("x/y/a.blob"), b"aaaa").unwrap();
        std::fs::write(root.join("x/z/b.blob"), b"bb").unwrap();
        std::fs::write(root.join("x/.hidden.tmp"), b"nope").unwrap();

        let tree = BlobTree::build(root).await.unwrap();
        assert_eq!(tree.summary(), TreeSummary { count: 2, size: 6 });
        assert_eq!(tree.count_at(&["x"]), Some(2));
        assert_eq!(tree.count_at(&["x", "y"]), Some(1));
    }

    #[tokio::test]
    async fn build_tolerates_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let tree = BlobTree::build(dir.path().join("not-yet")).await.unwrap();
        assert_eq!(tree.summary().count, 0);
    }
}
