//! The mounted filesystem tree.
//!
//! One [`Filesystem`] per mount point. Nodes live in an arena owned by the
//! tree; every externally triggered operation acquires the filesystem-wide
//! mutex, does its work, and releases on every exit path. Operations may
//! suspend on blob I/O and KV access while holding their own lock, never
//! another tree's.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use fluid_core::blob::chunker::Chunker;
use fluid_core::blob::store::BlobStore;
use fluid_core::config::StorageConfig;
use fluid_core::error::{Error, Result};
use fluid_core::signature::signature;
use fluid_core::version::Version;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::attrs::{ATTR_BLOCK_SIZE, NodeAttrs};
use crate::meta::{DirMeta, FileMeta, MetaStore, NodeMeta};
use crate::node::{Dir, DirEntry, EntryKind, File, Node, NodeBody, NodeId};
use crate::path;

/// Shared wiring handed to every mounted tree: the metadata store, the
/// blob store, the chunking configuration, and the local replica
/// precedence. Passed explicitly instead of living in process globals.
pub struct FsContext {
    pub meta: MetaStore,
    pub blobs: BlobStore,
    pub storage: StorageConfig,
    /// Local replica precedence, the `pid` of new versions.
    pub pid: u64,
}

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub prefix: String,
    pub uid: u32,
    pub gid: u32,
    pub read_only: bool,
}

/// Attribute changes applied by `setattr`; `None` fields are untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttrs {
    pub size: Option<u64>,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<DateTime<Utc>>,
    pub mtime: Option<DateTime<Utc>>,
    pub archive: Option<bool>,
}

/// `statfs` summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub nfiles: u64,
    pub ndirs: u64,
    pub block_size: u64,
    /// Blocks held by files resident in memory.
    pub blocks_used: u64,
}

/// A mounted filesystem: the tree plus its exclusive lock.
pub struct Filesystem {
    prefix: String,
    inner: Mutex<FsTree>,
}

impl Filesystem {
    /// Mounts the named prefix, loading its root directory from the
    /// metadata store or creating it on first mount.
    pub async fn mount(ctx: Arc<FsContext>, options: MountOptions) -> Result<Filesystem> {
        let tree = FsTree::open(ctx, &options).await?;
        Ok(Filesystem {
            prefix: options.prefix,
            inner: Mutex::new(tree),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub async fn root(&self) -> Result<(NodeId, NodeAttrs)> {
        let tree = self.inner.lock().await;
        let attrs = tree.node(tree.root)?.attrs;
        Ok((tree.root, attrs))
    }

    pub async fn lookup(&self, parent: NodeId, name: &str) -> Result<(NodeId, NodeAttrs)> {
        self.inner.lock().await.lookup(parent, name).await
    }

    pub async fn readdir(&self, dir: NodeId) -> Result<Vec<DirEntry>> {
        self.inner.lock().await.readdir(dir).await
    }

    pub async fn getattr(&self, id: NodeId) -> Result<NodeAttrs> {
        let tree = self.inner.lock().await;
        Ok(tree.node(id)?.attrs)
    }

    pub async fn setattr(&self, id: NodeId, set: SetAttrs) -> Result<NodeAttrs> {
        self.inner.lock().await.setattr(id, set).await
    }

    pub async fn create(
        &self,
        parent: NodeId,
        name: &str,
        perm: u32,
        uid: u32,
        gid: u32,
    ) -> Result<(NodeId, NodeAttrs)> {
        self.inner.lock().await.create(parent, name, perm, uid, gid)
    }

    pub async fn mkdir(
        &self,
        parent: NodeId,
        name: &str,
        perm: u32,
        uid: u32,
        gid: u32,
    ) -> Result<(NodeId, NodeAttrs)> {
        self.inner.lock().await.mkdir(parent, name, perm, uid, gid)
    }

    pub async fn remove(&self, parent: NodeId, name: &str) -> Result<()> {
        self.inner.lock().await.remove(parent, name).await
    }

    pub async fn rename(
        &self,
        src_parent: NodeId,
        src_name: &str,
        dst_parent: NodeId,
        dst_name: &str,
    ) -> Result<()> {
        self.inner
            .lock()
            .await
            .rename(src_parent, src_name, dst_parent, dst_name)
            .await
    }

    pub async fn link(&self, parent: NodeId, name: &str, target: NodeId) -> Result<NodeAttrs> {
        self.inner.lock().await.link(parent, name, target)
    }

    pub async fn symlink(
        &self,
        parent: NodeId,
        name: &str,
        target: &str,
        uid: u32,
        gid: u32,
    ) -> Result<(NodeId, NodeAttrs)> {
        self.inner.lock().await.symlink(parent, name, target, uid, gid)
    }

    pub async fn readlink(&self, id: NodeId) -> Result<String> {
        self.inner.lock().await.readlink(id).await
    }

    pub async fn read(&self, id: NodeId, offset: u64, size: u32) -> Result<Bytes> {
        self.inner.lock().await.read(id, offset, size).await
    }

    pub async fn write(&self, id: NodeId, offset: u64, data: &[u8]) -> Result<usize> {
        self.inner.lock().await.write(id, offset, data).await
    }

    /// Persists a node if it is dirty; returns whether anything was stored.
    pub async fn flush(&self, id: NodeId) -> Result<bool> {
        self.inner.lock().await.flush(id).await
    }

    pub async fn fsync(&self, id: NodeId) -> Result<bool> {
        self.inner.lock().await.flush(id).await
    }

    pub async fn getxattr(&self, id: NodeId, name: &str, size: u32) -> Result<Vec<u8>> {
        self.inner.lock().await.getxattr(id, name, size)
    }

    pub async fn setxattr(&self, id: NodeId, name: &str, value: &[u8]) -> Result<()> {
        self.inner.lock().await.setxattr(id, name, value)
    }

    pub async fn listxattr(&self, id: NodeId) -> Result<Vec<String>> {
        self.inner.lock().await.listxattr(id)
    }

    pub async fn removexattr(&self, id: NodeId, name: &str) -> Result<()> {
        self.inner.lock().await.removexattr(id, name)
    }

    /// Access check against the mount, not per-user ACLs: write intents are
    /// refused on read-only mounts and archived nodes.
    pub async fn access(&self, id: NodeId, write: bool) -> Result<()> {
        let tree = self.inner.lock().await;
        if write {
            tree.check_writable(id)?;
        } else {
            tree.node(id)?;
        }
        Ok(())
    }

    pub async fn statfs(&self) -> FsStats {
        self.inner.lock().await.statfs()
    }

    /// Walks the tree post-order and stores every dirty node. Returns the
    /// number of nodes persisted.
    pub async fn flush_all(&self) -> Result<u64> {
        self.inner.lock().await.flush_all().await
    }

    /// Evicts clean materialized entities, keeping dirty subtrees resident.
    pub async fn free(&self) -> u64 {
        self.inner.lock().await.free()
    }
}

struct FsTree {
    ctx: Arc<FsContext>,
    prefix: String,
    read_only: bool,
    arena: Vec<Option<Node>>,
    free_ids: Vec<usize>,
    root: NodeId,
    next_ino: u64,
    nfiles: u64,
    ndirs: u64,
}

impl FsTree {
    async fn open(ctx: Arc<FsContext>, options: &MountOptions) -> Result<FsTree> {
        let root_path = path::prefix_root(&options.prefix);
        let mut tree = FsTree {
            ctx,
            prefix: options.prefix.clone(),
            read_only: options.read_only,
            arena: Vec::new(),
            free_ids: Vec::new(),
            root: NodeId(0),
            next_ino: 1,
            nfiles: 0,
            ndirs: 1,
        };

        let root_node = match tree.ctx.meta.lookup(&root_path).await? {
            Some(NodeMeta::Dir(dm)) => Node {
                ino: tree.next_inode(),
                name: options.prefix.clone(),
                path: root_path,
                parent: None,
                attrs: dm.attrs,
                xattrs: dm.xattrs,
                metadirty: false,
                body: NodeBody::Dir(Dir {
                    children: dm.children,
                    entities: BTreeMap::new(),
                    expanded: false,
                }),
            },
            Some(NodeMeta::File(_)) => {
                return Err(Error::InvalidArgument(format!(
                    "prefix {} resolves to a file",
                    options.prefix
                )));
            }
            None => {
                debug!(prefix = %options.prefix, "initializing new prefix root");
                Node {
                    ino: tree.next_inode(),
                    name: options.prefix.clone(),
                    path: root_path,
                    parent: None,
                    attrs: NodeAttrs::new_dir(0o755, options.uid, options.gid),
                    xattrs: BTreeMap::new(),
                    metadirty: true,
                    body: NodeBody::Dir(Dir {
                        children: BTreeMap::new(),
                        entities: BTreeMap::new(),
                        expanded: true,
                    }),
                }
            }
        };
        let root = tree.alloc(root_node);
        tree.root = root;

        // Persist a fresh root eagerly so the prefix resolves immediately.
        if tree.node(root)?.metadirty && !tree.read_only {
            tree.store_dir(root).await?;
        }
        Ok(tree)
    }

    fn next_inode(&mut self) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        ino
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        if let Some(slot) = self.free_ids.pop() {
            self.arena[slot] = Some(node);
            NodeId(slot)
        } else {
            self.arena.push(Some(node));
            NodeId(self.arena.len() - 1)
        }
    }

    fn dealloc(&mut self, id: NodeId) {
        if self.arena[id.0].take().is_some() {
            self.free_ids.push(id.0);
        }
    }

    fn node(&self, id: NodeId) -> Result<&Node> {
        self.arena
            .get(id.0)
            .and_then(|slot| slot.as_ref())
            .ok_or_else(|| Error::NotFound(format!("node {} is gone", id.0)))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.arena
            .get_mut(id.0)
            .and_then(|slot| slot.as_mut())
            .ok_or_else(|| Error::NotFound(format!("node {} is gone", id.0)))
    }

    fn dir_of(&self, id: NodeId) -> Result<&Dir> {
        let node = self.node(id)?;
        node.as_dir()
            .ok_or_else(|| Error::InvalidArgument(format!("{} is not a directory", node.path)))
    }

    fn check_writable(&self, id: NodeId) -> Result<()> {
        if self.read_only {
            return Err(Error::Permission(format!(
                "filesystem {} is read-only",
                self.prefix
            )));
        }
        let node = self.node(id)?;
        if node.attrs.archive {
            return Err(Error::Permission(format!("{} is archived", node.path)));
        }
        Ok(())
    }

    /// Materializes one child from the metadata store and attaches it.
    async fn fetch_child(&mut self, parent: NodeId, name: &str, child_path: &str) -> Result<NodeId> {
        let meta = self
            .ctx
            .meta
            .lookup(child_path)
            .await?
            .ok_or_else(|| Error::NotFound(child_path.to_string()))?;
        let ino = self.next_inode();
        let node = match meta {
            NodeMeta::Dir(dm) => Node {
                ino,
                name: name.to_string(),
                path: child_path.to_string(),
                parent: Some(parent),
                attrs: dm.attrs,
                xattrs: dm.xattrs,
                metadirty: false,
                body: NodeBody::Dir(Dir {
                    children: dm.children,
                    entities: BTreeMap::new(),
                    expanded: false,
                }),
            },
            NodeMeta::File(fm) => {
                let expanded = fm.blobs.is_empty();
                Node {
                    ino,
                    name: name.to_string(),
                    path: child_path.to_string(),
                    parent: Some(parent),
                    attrs: fm.attrs,
                    xattrs: fm.xattrs,
                    metadirty: false,
                    body: NodeBody::File(File {
                        version: fm.version,
                        previous: fm.previous,
                        blobs: fm.blobs,
                        data: Vec::new(),
                        dirty: false,
                        expanded,
                    }),
                }
            }
        };
        let id = self.alloc(node);
        if let Some(dir) = self.node_mut(parent)?.as_dir_mut() {
            dir.entities.insert(name.to_string(), id);
        }
        trace!(path = child_path, "child materialized");
        Ok(id)
    }

    /// Materializes every direct child of a directory.
    async fn expand_dir(&mut self, id: NodeId) -> Result<()> {
        let pending: Vec<(String, String)> = {
            let dir = self.dir_of(id)?;
            if dir.expanded {
                return Ok(());
            }
            dir.children
                .iter()
                .filter(|(name, _)| !dir.entities.contains_key(*name))
                .map(|(name, child)| (name.clone(), child.clone()))
                .collect()
        };
        for (name, child_path) in pending {
            self.fetch_child(id, &name, &child_path).await?;
        }
        if let Some(dir) = self.node_mut(id)?.as_dir_mut() {
            dir.expanded = true;
        }
        Ok(())
    }

    /// Loads and verifies a file's blobs into its data buffer.
    async fn expand_file(&mut self, id: NodeId) -> Result<()> {
        let hashes: Vec<String> = {
            let node = self.node(id)?;
            let file = node
                .as_file()
                .ok_or_else(|| Error::InvalidArgument(format!("{} is a directory", node.path)))?;
            if file.expanded {
                return Ok(());
            }
            file.blobs.clone()
        };
        let alg = self.ctx.storage.hashing;
        let mut data = Vec::new();
        for hash in &hashes {
            let blob = match self.ctx.blobs.fetch(hash).await {
                Ok(blob) => blob,
                Err(Error::NotFound(_)) => {
                    // Not yet replicated locally; anti-entropy will carry it
                    // over. Surface as transient I/O for now.
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("blob {hash} not available"),
                    )));
                }
                Err(err) => return Err(err),
            };
            if signature(alg, blob.data()) != *hash {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("blob {hash} is corrupted"),
                )));
            }
            data.extend_from_slice(blob.data());
        }
        let node = self.node_mut(id)?;
        node.attrs.set_size(data.len() as u64);
        if let Some(file) = node.as_file_mut() {
            file.data = data;
            file.expanded = true;
        }
        Ok(())
    }

    async fn lookup(&mut self, parent: NodeId, name: &str) -> Result<(NodeId, NodeAttrs)> {
        let parent_path = self.node(parent)?.path.clone();
        let child_path = {
            let dir = self.dir_of(parent)?;
            if let Some(&id) = dir.entities.get(name) {
                return Ok((id, self.node(id)?.attrs));
            }
            dir.children
                .get(name)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("{name} in {parent_path}")))?
        };
        let id = self.fetch_child(parent, name, &child_path).await?;
        Ok((id, self.node(id)?.attrs))
    }

    async fn readdir(&mut self, id: NodeId) -> Result<Vec<DirEntry>> {
        self.expand_dir(id).await?;
        let node = self.node_mut(id)?;
        node.attrs.atime = Utc::now();
        let dir = self.dir_of(id)?;
        let mut entries = Vec::with_capacity(dir.entities.len());
        for (name, &child) in &dir.entities {
            let child_node = self.node(child)?;
            entries.push(DirEntry {
                name: name.clone(),
                ino: child_node.ino,
                kind: if child_node.is_dir() {
                    EntryKind::Dir
                } else {
                    EntryKind::File
                },
            });
        }
        Ok(entries)
    }

    async fn setattr(&mut self, id: NodeId, set: SetAttrs) -> Result<NodeAttrs> {
        self.check_writable(id)?;
        if let Some(size) = set.size {
            let is_file = !self.node(id)?.is_dir();
            if is_file {
                self.expand_file(id).await?;
                let node = self.node_mut(id)?;
                let attrs_size = node.attrs.size;
                if let Some(file) = node.as_file_mut() {
                    if size != attrs_size {
                        file.data.resize(size as usize, 0);
                        file.dirty = true;
                    }
                }
                self.node_mut(id)?.attrs.set_size(size);
            }
        }
        let node = self.node_mut(id)?;
        if let Some(mode) = set.mode {
            // Type bits are fixed at creation.
            node.attrs.mode = (node.attrs.mode & crate::attrs::MODE_TYPE_MASK)
                | (mode & !crate::attrs::MODE_TYPE_MASK);
        }
        if let Some(uid) = set.uid {
            node.attrs.uid = uid;
        }
        if let Some(gid) = set.gid {
            node.attrs.gid = gid;
        }
        if let Some(atime) = set.atime {
            node.attrs.atime = atime;
        }
        if let Some(mtime) = set.mtime {
            node.attrs.mtime = mtime;
        }
        if let Some(archive) = set.archive {
            node.attrs.archive = archive;
        }
        node.attrs.ctime = Utc::now();
        node.metadirty = true;
        Ok(node.attrs)
    }

    fn create(
        &mut self,
        parent: NodeId,
        name: &str,
        perm: u32,
        uid: u32,
        gid: u32,
    ) -> Result<(NodeId, NodeAttrs)> {
        let path = self.prepare_insert(parent, name)?;
        let node = Node {
            ino: self.next_inode(),
            name: name.to_string(),
            path,
            parent: Some(parent),
            attrs: NodeAttrs::new_file(perm, uid, gid),
            xattrs: BTreeMap::new(),
            metadirty: true,
            body: NodeBody::File(File {
                version: Version::new(self.ctx.pid),
                previous: None,
                blobs: Vec::new(),
                data: Vec::new(),
                dirty: false,
                expanded: true,
            }),
        };
        let attrs = node.attrs;
        let id = self.attach(parent, name, node);
        self.nfiles += 1;
        Ok((id, attrs))
    }

    fn mkdir(
        &mut self,
        parent: NodeId,
        name: &str,
        perm: u32,
        uid: u32,
        gid: u32,
    ) -> Result<(NodeId, NodeAttrs)> {
        let path = self.prepare_insert(parent, name)?;
        let node = Node {
            ino: self.next_inode(),
            name: name.to_string(),
            path,
            parent: Some(parent),
            attrs: NodeAttrs::new_dir(perm, uid, gid),
            xattrs: BTreeMap::new(),
            metadirty: true,
            body: NodeBody::Dir(Dir {
                children: BTreeMap::new(),
                entities: BTreeMap::new(),
                expanded: true,
            }),
        };
        let attrs = node.attrs;
        let id = self.attach(parent, name, node);
        if let Ok(parent_node) = self.node_mut(parent) {
            parent_node.attrs.nlink += 1;
        }
        self.ndirs += 1;
        Ok((id, attrs))
    }

    /// Writability and uniqueness checks shared by the insert operations;
    /// returns the child's fluid path.
    fn prepare_insert(&self, parent: NodeId, name: &str) -> Result<String> {
        self.check_writable(parent)?;
        if name.is_empty() || name.contains('/') {
            return Err(Error::InvalidArgument(format!("invalid name '{name}'")));
        }
        let parent_node = self.node(parent)?;
        let dir = parent_node.as_dir().ok_or_else(|| {
            Error::InvalidArgument(format!("{} is not a directory", parent_node.path))
        })?;
        if dir.children.contains_key(name) {
            return Err(Error::AlreadyExists(path::join(&parent_node.path, name)));
        }
        Ok(path::join(&parent_node.path, name))
    }

    fn attach(&mut self, parent: NodeId, name: &str, node: Node) -> NodeId {
        let child_path = node.path.clone();
        let id = self.alloc(node);
        if let Ok(parent_node) = self.node_mut(parent) {
            let now = Utc::now();
            parent_node.attrs.mtime = now;
            parent_node.attrs.ctime = now;
            parent_node.metadirty = true;
            if let Some(dir) = parent_node.as_dir_mut() {
                dir.children.insert(name.to_string(), child_path);
                dir.entities.insert(name.to_string(), id);
            }
        }
        id
    }

    async fn remove(&mut self, parent: NodeId, name: &str) -> Result<()> {
        self.check_writable(parent)?;
        // Materialize the target so emptiness and link count are known.
        let (child, child_path) = {
            let dir = self.dir_of(parent)?;
            match dir.entities.get(name) {
                Some(&id) => (Some(id), dir.children.get(name).cloned()),
                None => (None, dir.children.get(name).cloned()),
            }
        };
        let child_path =
            child_path.ok_or_else(|| Error::NotFound(format!("{name} not in directory")))?;
        let child = match child {
            Some(id) => id,
            None => self.fetch_child(parent, name, &child_path).await?,
        };
        self.check_writable(child)?;

        let (is_dir, remaining_links) = {
            let node = self.node(child)?;
            if let Some(dir) = node.as_dir() {
                if !dir.children.is_empty() {
                    return Err(Error::InvalidArgument(format!(
                        "directory {} is not empty",
                        node.path
                    )));
                }
                (true, 0)
            } else {
                (false, node.attrs.nlink.saturating_sub(1))
            }
        };

        if let Ok(parent_node) = self.node_mut(parent) {
            let now = Utc::now();
            parent_node.attrs.mtime = now;
            parent_node.attrs.ctime = now;
            parent_node.metadirty = true;
            if is_dir {
                parent_node.attrs.nlink = parent_node.attrs.nlink.saturating_sub(1);
            }
            if let Some(dir) = parent_node.as_dir_mut() {
                dir.children.remove(name);
                dir.entities.remove(name);
            }
        }

        if is_dir {
            self.ndirs = self.ndirs.saturating_sub(1);
            self.ctx.meta.remove(&child_path).await?;
            self.dealloc(child);
        } else {
            let node = self.node_mut(child)?;
            node.attrs.nlink = remaining_links;
            if remaining_links == 0 {
                // Last name gone: unlink the namespace entry. Version and
                // blob records stay behind for lazy cleanup.
                self.nfiles = self.nfiles.saturating_sub(1);
                self.ctx.meta.remove(&child_path).await?;
                self.dealloc(child);
            }
        }
        Ok(())
    }

    async fn rename(
        &mut self,
        src_parent: NodeId,
        src_name: &str,
        dst_parent: NodeId,
        dst_name: &str,
    ) -> Result<()> {
        self.check_writable(src_parent)?;
        self.check_writable(dst_parent)?;
        if dst_name.is_empty() || dst_name.contains('/') {
            return Err(Error::InvalidArgument(format!("invalid name '{dst_name}'")));
        }
        {
            let dst_dir = self.dir_of(dst_parent)?;
            if dst_dir.children.contains_key(dst_name) {
                return Err(Error::AlreadyExists(format!(
                    "{dst_name} already exists in destination"
                )));
            }
        }
        // Materialize the moving entity and, for directories, the whole
        // subtree: every descendant's fluid path changes with the move.
        let (child, _) = self.lookup(src_parent, src_name).await?;
        let mut stack = vec![child];
        while let Some(id) = stack.pop() {
            if self.node(id)?.is_dir() {
                self.expand_dir(id).await?;
                stack.extend(self.dir_of(id)?.entities.values().copied());
            }
        }
        self.check_writable(child)?;

        // Detach from the source.
        let old_path = self.node(child)?.path.clone();
        {
            let src_node = self.node_mut(src_parent)?;
            let now = Utc::now();
            src_node.attrs.mtime = now;
            src_node.attrs.ctime = now;
            src_node.metadirty = true;
            if let Some(dir) = src_node.as_dir_mut() {
                dir.children.remove(src_name);
                dir.entities.remove(src_name);
            }
        }

        // Attach under the destination name.
        let new_path = {
            let dst_path = self.node(dst_parent)?.path.clone();
            path::join(&dst_path, dst_name)
        };
        {
            let dst_node = self.node_mut(dst_parent)?;
            let now = Utc::now();
            dst_node.attrs.mtime = now;
            dst_node.attrs.ctime = now;
            dst_node.metadirty = true;
            if let Some(dir) = dst_node.as_dir_mut() {
                dir.children.insert(dst_name.to_string(), new_path.clone());
                dir.entities.insert(dst_name.to_string(), child);
            }
        }
        if self.node(child)?.is_dir() {
            let src_links = self.node(src_parent)?.attrs.nlink.saturating_sub(1);
            self.node_mut(src_parent)?.attrs.nlink = src_links;
            self.node_mut(dst_parent)?.attrs.nlink += 1;
        }

        // Re-path the moved node and its descendants; stale namespace
        // entries are unlinked so the old names stop resolving.
        let mut moved = vec![(child, new_path)];
        {
            let node = self.node_mut(child)?;
            node.name = dst_name.to_string();
            node.parent = Some(dst_parent);
        }
        while let Some((id, new_path)) = moved.pop() {
            let old = {
                let node = self.node_mut(id)?;
                let old = std::mem::replace(&mut node.path, new_path.clone());
                node.attrs.ctime = Utc::now();
                node.metadirty = true;
                old
            };
            self.ctx.meta.remove(&old).await?;
            let children: Vec<(String, NodeId)> = match self.node(id)?.as_dir() {
                Some(dir) => dir
                    .entities
                    .iter()
                    .map(|(name, &cid)| (name.clone(), cid))
                    .collect(),
                None => Vec::new(),
            };
            if !children.is_empty() {
                let mut renamed = BTreeMap::new();
                for (name, _) in &children {
                    renamed.insert(name.clone(), path::join(&new_path, name));
                }
                if let Some(dir) = self.node_mut(id)?.as_dir_mut() {
                    dir.children = renamed.clone();
                }
                for (name, cid) in children {
                    if let Some(child_path) = renamed.remove(&name) {
                        moved.push((cid, child_path));
                    }
                }
            }
        }
        debug!(from = %old_path, to = dst_name, "rename complete");
        Ok(())
    }

    fn link(&mut self, parent: NodeId, name: &str, target: NodeId) -> Result<NodeAttrs> {
        self.check_writable(parent)?;
        self.check_writable(target)?;
        if self.node(target)?.is_dir() {
            return Err(Error::Permission("hard links to directories".into()));
        }
        let parent_node = self.node(parent)?;
        let dir = parent_node.as_dir().ok_or_else(|| {
            Error::InvalidArgument(format!("{} is not a directory", parent_node.path))
        })?;
        if dir.children.contains_key(name) {
            return Err(Error::AlreadyExists(path::join(&parent_node.path, name)));
        }
        // The alias shares the target's fluid path: hard links are not
        // tracked distinctly in the persistent model, so both names resolve
        // through the same record. Re-resolution after eviction yields
        // independent entities.
        let target_path = self.node(target)?.path.clone();
        {
            let parent_node = self.node_mut(parent)?;
            parent_node.metadirty = true;
            if let Some(dir) = parent_node.as_dir_mut() {
                dir.children.insert(name.to_string(), target_path);
                dir.entities.insert(name.to_string(), target);
            }
        }
        let target_node = self.node_mut(target)?;
        target_node.attrs.nlink += 1;
        target_node.attrs.ctime = Utc::now();
        Ok(target_node.attrs)
    }

    fn symlink(
        &mut self,
        parent: NodeId,
        name: &str,
        target: &str,
        uid: u32,
        gid: u32,
    ) -> Result<(NodeId, NodeAttrs)> {
        let link_path = self.prepare_insert(parent, name)?;
        let mut attrs = NodeAttrs::new_symlink(uid, gid);
        attrs.set_size(target.len() as u64);
        let node = Node {
            ino: self.next_inode(),
            name: name.to_string(),
            path: link_path,
            parent: Some(parent),
            attrs,
            xattrs: BTreeMap::new(),
            metadirty: true,
            body: NodeBody::File(File {
                version: Version::new(self.ctx.pid),
                previous: None,
                blobs: Vec::new(),
                data: target.as_bytes().to_vec(),
                dirty: true,
                expanded: true,
            }),
        };
        let attrs = node.attrs;
        let id = self.attach(parent, name, node);
        self.nfiles += 1;
        Ok((id, attrs))
    }

    async fn readlink(&mut self, id: NodeId) -> Result<String> {
        if !self.node(id)?.attrs.is_symlink() {
            return Err(Error::InvalidArgument(format!(
                "{} is not a symlink",
                self.node(id)?.path
            )));
        }
        self.expand_file(id).await?;
        let node = self.node(id)?;
        let file = node
            .as_file()
            .ok_or_else(|| Error::Internal(format!("symlink {} has no data", node.path)))?;
        String::from_utf8(file.data.clone())
            .map_err(|_| Error::Internal(format!("symlink {} target is not UTF-8", node.path)))
    }

    async fn read(&mut self, id: NodeId, offset: u64, size: u32) -> Result<Bytes> {
        self.expand_file(id).await?;
        let node = self.node_mut(id)?;
        node.attrs.atime = Utc::now();
        let file = node
            .as_file()
            .ok_or_else(|| Error::InvalidArgument("read on a directory".into()))?;
        let start = (offset as usize).min(file.data.len());
        let end = (start + size as usize).min(file.data.len());
        Ok(Bytes::copy_from_slice(&file.data[start..end]))
    }

    async fn write(&mut self, id: NodeId, offset: u64, data: &[u8]) -> Result<usize> {
        self.check_writable(id)?;
        if data.is_empty() {
            // A no-op write leaves the file clean.
            return Ok(0);
        }
        self.expand_file(id).await?;
        let node = self.node_mut(id)?;
        let file = node
            .as_file_mut()
            .ok_or_else(|| Error::InvalidArgument("write on a directory".into()))?;
        let offset = offset as usize;
        let end = offset + data.len();
        if end > file.data.len() {
            // Grow, preserving the existing prefix; gaps read as zeros.
            file.data.resize(end, 0);
        }
        file.data[offset..end].copy_from_slice(data);
        file.dirty = true;
        let len = file.data.len() as u64;
        node.attrs.set_size(len);
        // mtime is stamped on flush, not here.
        Ok(data.len())
    }

    async fn flush(&mut self, id: NodeId) -> Result<bool> {
        let (is_dir, data_dirty, meta_dirty) = {
            let node = self.node(id)?;
            match &node.body {
                NodeBody::File(file) => (false, file.dirty, node.metadirty),
                NodeBody::Dir(_) => (true, false, node.metadirty),
            }
        };
        if is_dir {
            if meta_dirty {
                self.store_dir(id).await?;
                return Ok(true);
            }
            return Ok(false);
        }
        if data_dirty {
            self.store_file(id).await?;
            Ok(true)
        } else if meta_dirty {
            self.store_file_meta(id).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Chunk-and-save path for dirty file data: bump the version, persist
    /// blobs first, then the version record.
    async fn store_file(&mut self, id: NodeId) -> Result<()> {
        let (data, pid) = {
            let node = self.node(id)?;
            let file = node
                .as_file()
                .ok_or_else(|| Error::Internal(format!("{} is not a file", node.path)))?;
            (Bytes::copy_from_slice(&file.data), self.ctx.pid)
        };

        let chunker = Chunker::new(data, &self.ctx.storage)?;
        let mut hashes = Vec::new();
        for blob in chunker.blobs() {
            self.ctx.blobs.save(&blob).await?;
            hashes.push(blob.hash().to_string());
        }

        {
            let node = self.node_mut(id)?;
            node.attrs.mtime = Utc::now();
            if let Some(file) = node.as_file_mut() {
                let previous = file.version;
                let mut bumped = previous;
                file.version = bumped.next(pid);
                file.previous = Some(previous);
                file.blobs = hashes;
                file.dirty = false;
            }
        }
        self.store_file_meta(id).await
    }

    /// Persists the file's current metadata record without a version bump.
    async fn store_file_meta(&mut self, id: NodeId) -> Result<()> {
        let record = {
            let node = self.node(id)?;
            let file = node
                .as_file()
                .ok_or_else(|| Error::Internal(format!("{} is not a file", node.path)))?;
            FileMeta {
                path: node.path.clone(),
                attrs: node.attrs,
                xattrs: node.xattrs.clone(),
                version: file.version,
                previous: file.previous,
                blobs: file.blobs.clone(),
            }
        };
        self.ctx.meta.put_file(&record).await?;
        self.node_mut(id)?.metadirty = false;
        Ok(())
    }

    async fn store_dir(&mut self, id: NodeId) -> Result<()> {
        let (record, is_root) = {
            let node = self.node(id)?;
            let dir = node
                .as_dir()
                .ok_or_else(|| Error::Internal(format!("{} is not a directory", node.path)))?;
            (
                DirMeta {
                    path: node.path.clone(),
                    attrs: node.attrs,
                    xattrs: node.xattrs.clone(),
                    children: dir.children.clone(),
                },
                node.parent.is_none(),
            )
        };
        self.ctx.meta.put_dir(&record, is_root).await?;
        self.node_mut(id)?.metadirty = false;
        Ok(())
    }

    fn getxattr(&self, id: NodeId, name: &str, size: u32) -> Result<Vec<u8>> {
        let node = self.node(id)?;
        let value = node
            .xattrs
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("xattr {name} on {}", node.path)))?;
        if size == 0 {
            Ok(value.clone())
        } else {
            Ok(value[..value.len().min(size as usize)].to_vec())
        }
    }

    fn setxattr(&mut self, id: NodeId, name: &str, value: &[u8]) -> Result<()> {
        self.check_writable(id)?;
        let node = self.node_mut(id)?;
        node.xattrs.insert(name.to_string(), value.to_vec());
        node.metadirty = true;
        Ok(())
    }

    fn listxattr(&self, id: NodeId) -> Result<Vec<String>> {
        Ok(self.node(id)?.xattrs.keys().cloned().collect())
    }

    fn removexattr(&mut self, id: NodeId, name: &str) -> Result<()> {
        self.check_writable(id)?;
        let node = self.node_mut(id)?;
        if node.xattrs.remove(name).is_none() {
            return Err(Error::NotFound(format!("xattr {name} on {}", node.path)));
        }
        node.metadirty = true;
        Ok(())
    }

    fn statfs(&self) -> FsStats {
        let blocks_used = self
            .arena
            .iter()
            .flatten()
            .filter(|node| !node.is_dir())
            .map(|node| node.attrs.blocks)
            .sum();
        FsStats {
            nfiles: self.nfiles,
            ndirs: self.ndirs,
            block_size: ATTR_BLOCK_SIZE,
            blocks_used,
        }
    }

    async fn flush_all(&mut self) -> Result<u64> {
        // Pre-order collection, then reversed: children store before their
        // parents so a directory snapshot never precedes its entries.
        let mut order = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            order.push(id);
            if let Some(dir) = self.node(id)?.as_dir() {
                stack.extend(dir.entities.values().copied());
            }
        }
        let mut stored = 0u64;
        for id in order.into_iter().rev() {
            if self.flush(id).await? {
                stored += 1;
            }
        }
        Ok(stored)
    }

    /// Evicts clean materialized subtrees; dirty nodes stay resident.
    fn free(&mut self) -> u64 {
        self.free_dir(self.root)
    }

    fn free_dir(&mut self, id: NodeId) -> u64 {
        let entries: Vec<(String, NodeId)> = match self.node(id).ok().and_then(|n| n.as_dir()) {
            Some(dir) => dir
                .entities
                .iter()
                .map(|(name, &cid)| (name.clone(), cid))
                .collect(),
            None => return 0,
        };
        let mut evicted = 0;
        for (name, cid) in entries {
            let is_dir = self.node(cid).map(|n| n.is_dir()).unwrap_or(false);
            if is_dir {
                evicted += self.free_dir(cid);
            }
            let keep = match self.node(cid) {
                Ok(node) => match &node.body {
                    NodeBody::File(file) => file.dirty || node.metadirty,
                    // A directory stays resident while it is dirty or still
                    // shelters dirty descendants.
                    NodeBody::Dir(dir) => node.metadirty || !dir.entities.is_empty(),
                },
                Err(_) => false,
            };
            if !keep {
                if let Ok(parent_node) = self.node_mut(id) {
                    if let Some(dir) = parent_node.as_dir_mut() {
                        dir.entities.remove(&name);
                        dir.expanded = false;
                    }
                }
                self.dealloc(cid);
                evicted += 1;
            }
        }
        evicted
    }
}
