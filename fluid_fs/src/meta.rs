//! Persistent metadata records and the two-phase lookup.
//!
//! The `names` keyspace maps every fluid path to a small [`NodeType`]
//! record; its `key` then resolves in `prefixes` (directory snapshots) or
//! `versions` (file revision records). Records are stored as JSON; only
//! round-trip consistency with ourselves is required.

use std::collections::BTreeMap;
use std::sync::Arc;

use fluid_core::error::{Error, Result};
use fluid_core::kv::{Engine, Keyspace};
use fluid_core::version::Version;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::attrs::NodeAttrs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Dir,
    File,
    Root,
}

/// The first-phase record stored under the fluid path in `names`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeType {
    pub kind: NodeKind,
    pub key: String,
}

/// Directory snapshot stored in `prefixes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirMeta {
    pub path: String,
    pub attrs: NodeAttrs,
    #[serde(default)]
    pub xattrs: BTreeMap<String, Vec<u8>>,
    /// Child name to fluid path.
    pub children: BTreeMap<String, String>,
}

/// File revision record stored in `versions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMeta {
    pub path: String,
    pub attrs: NodeAttrs,
    #[serde(default)]
    pub xattrs: BTreeMap<String, Vec<u8>>,
    pub version: Version,
    pub previous: Option<Version>,
    /// Blob signatures, in file order.
    pub blobs: Vec<String>,
}

/// Result of a successful two-phase lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeMeta {
    Dir(DirMeta),
    File(FileMeta),
}

/// Key of a file revision in the `versions` keyspace.
pub fn version_key(path: &str, version: &Version) -> String {
    format!("({path}, {}, {})", version.scalar, version.pid)
}

fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(record).map_err(|err| Error::Internal(format!("metadata encode: {err}")))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|err| Error::Internal(format!("metadata decode: {err}")))
}

/// Metadata store over an ordered KV engine.
#[derive(Clone)]
pub struct MetaStore {
    engine: Arc<dyn Engine>,
}

impl MetaStore {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        MetaStore { engine }
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// First lookup phase only: the NodeType under the fluid path.
    pub async fn node_type(&self, path: &str) -> Result<Option<NodeType>> {
        match self.engine.get(path.as_bytes(), Keyspace::Names).await? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Two-phase lookup: resolve the fluid path through `names`, then load
    /// the snapshot from the keyspace the record points into.
    pub async fn lookup(&self, path: &str) -> Result<Option<NodeMeta>> {
        let Some(node_type) = self.node_type(path).await? else {
            return Ok(None);
        };
        match node_type.kind {
            NodeKind::Dir | NodeKind::Root => {
                let bytes = self
                    .engine
                    .get(node_type.key.as_bytes(), Keyspace::Prefixes)
                    .await?
                    .ok_or_else(|| {
                        Error::NotFound(format!("directory snapshot for {path} is missing"))
                    })?;
                Ok(Some(NodeMeta::Dir(decode(&bytes)?)))
            }
            NodeKind::File => {
                let bytes = self
                    .engine
                    .get(node_type.key.as_bytes(), Keyspace::Versions)
                    .await?
                    .ok_or_else(|| {
                        Error::NotFound(format!("version record for {path} is missing"))
                    })?;
                Ok(Some(NodeMeta::File(decode(&bytes)?)))
            }
        }
    }

    /// Persists a directory snapshot and its NodeType.
    pub async fn put_dir(&self, dir: &DirMeta, root: bool) -> Result<()> {
        self.engine
            .put(dir.path.as_bytes(), &encode(dir)?, Keyspace::Prefixes)
            .await?;
        let node_type = NodeType {
            kind: if root { NodeKind::Root } else { NodeKind::Dir },
            key: dir.path.clone(),
        };
        self.engine
            .put(dir.path.as_bytes(), &encode(&node_type)?, Keyspace::Names)
            .await?;
        debug!(path = %dir.path, children = dir.children.len(), "directory stored");
        Ok(())
    }

    /// Persists a file revision and points `names` at it. The caller has
    /// already saved the referenced blobs, so a recovered record never
    /// names data that is not on disk.
    pub async fn put_file(&self, file: &FileMeta) -> Result<()> {
        let key = version_key(&file.path, &file.version);
        self.engine
            .put(key.as_bytes(), &encode(file)?, Keyspace::Versions)
            .await?;
        let node_type = NodeType {
            kind: NodeKind::File,
            key,
        };
        self.engine
            .put(file.path.as_bytes(), &encode(&node_type)?, Keyspace::Names)
            .await?;
        debug!(path = %file.path, version = %file.version, blobs = file.blobs.len(), "file stored");
        Ok(())
    }

    /// Unlinks a fluid path from the namespace. Secondary records stay
    /// behind for lazy cleanup.
    pub async fn remove(&self, path: &str) -> Result<()> {
        self.engine.delete(path.as_bytes(), Keyspace::Names).await
    }

    /// Loads one historical file revision by its version key.
    pub async fn file_revision(&self, key: &str) -> Result<Option<FileMeta>> {
        match self.engine.get(key.as_bytes(), Keyspace::Versions).await? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs;
    use fluid_kv_memory::MemoryEngine;

    fn store() -> MetaStore {
        MetaStore::new(Arc::new(MemoryEngine::new()))
    }

    fn dir_meta(path: &str) -> DirMeta {
        DirMeta {
            path: path.into(),
            attrs: attrs::NodeAttrs::new_dir(0o755, 1000, 1000),
            xattrs: BTreeMap::new(),
            children: BTreeMap::new(),
        }
    }

    fn file_meta(path: &str, scalar: u64) -> FileMeta {
        FileMeta {
            path: path.into(),
            attrs: attrs::NodeAttrs::new_file(0o644, 1000, 1000),
            xattrs: BTreeMap::new(),
            version: Version {
                pid: 7,
                scalar,
                latest: scalar,
            },
            previous: None,
            blobs: vec!["abc".into()],
        }
    }

    #[tokio::test]
    async fn absent_path_resolves_to_none() {
        assert!(store().lookup("/alpha/none").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn directory_round_trip() {
        let store = store();
        let mut dir = dir_meta("/alpha");
        dir.children
            .insert("notes.txt".into(), "/alpha/notes.txt".into());
        store.put_dir(&dir, true).await.unwrap();

        let node_type = store.node_type("/alpha").await.unwrap().unwrap();
        assert_eq!(node_type.kind, NodeKind::Root);
        assert_eq!(node_type.key, "/alpha");

        match store.lookup("/alpha").await.unwrap().unwrap() {
            NodeMeta::Dir(loaded) => assert_eq!(loaded, dir),
            other => panic!("expected dir, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn file_node_type_points_at_version_key() {
        let store = store();
        let file = file_meta("/alpha/notes.txt", 3);
        store.put_file(&file).await.unwrap();

        let node_type = store.node_type("/alpha/notes.txt").await.unwrap().unwrap();
        assert_eq!(node_type.kind, NodeKind::File);
        assert_eq!(node_type.key, "(/alpha/notes.txt, 3, 7)");

        match store.lookup("/alpha/notes.txt").await.unwrap().unwrap() {
            NodeMeta::File(loaded) => assert_eq!(loaded, file),
            other => panic!("expected file, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn old_revisions_stay_addressable() {
        let store = store();
        let first = file_meta("/alpha/a", 1);
        store.put_file(&first).await.unwrap();
        let mut second = file_meta("/alpha/a", 2);
        second.previous = Some(first.version);
        store.put_file(&second).await.unwrap();

        // names points at the newest revision...
        let node_type = store.node_type("/alpha/a").await.unwrap().unwrap();
        assert_eq!(node_type.key, "(/alpha/a, 2, 7)");
        // ...while the superseded one remains readable by key.
        let kept = store
            .file_revision(&version_key("/alpha/a", &first.version))
            .await
            .unwrap();
        assert_eq!(kept.unwrap().version.scalar, 1);
    }

    #[tokio::test]
    async fn remove_unlinks_name_only() {
        let store = store();
        let file = file_meta("/alpha/b", 1);
        store.put_file(&file).await.unwrap();
        store.remove("/alpha/b").await.unwrap();
        assert!(store.node_type("/alpha/b").await.unwrap().is_none());
        // Version record is left for lazy cleanup.
        let key = version_key("/alpha/b", &file.version);
        assert!(store.file_revision(&key).await.unwrap().is_some());
    }
}
