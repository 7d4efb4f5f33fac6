//! # FluidFS filesystem layer
//!
//! The in-memory tree behind every mount point plus the persistent
//! metadata index it flushes into.
//!
//! ## Layers
//! 1. [`meta`] – persistent records and the two-phase lookup through the
//!    `names` keyspace.
//! 2. [`node`] – the node vocabulary shared by directories and files.
//! 3. [`tree`] – the mounted tree: lazy expansion, dirty tracking, and the
//!    full operation set a mount bridge drives.
//!
//! The mount bridge itself is an external collaborator; this crate speaks
//! its operation vocabulary and maps error kinds to POSIX codes at that
//! edge via [`errno`].

pub mod attrs;
pub mod meta;
pub mod node;
pub mod path;
pub mod tree;

pub use attrs::NodeAttrs;
pub use meta::{DirMeta, FileMeta, MetaStore, NodeKind, NodeMeta, NodeType, version_key};
pub use node::{DirEntry, EntryKind, NodeId};
pub use tree::{Filesystem, FsContext, FsStats, MountOptions, SetAttrs};

use fluid_core::error::{Error, ErrorKind};

/// Maps an error kind to the POSIX code the mount bridge reports.
pub fn errno(err: &Error) -> i32 {
    match err.kind() {
        ErrorKind::NotFound => libc::ENOENT,
        ErrorKind::AlreadyExists => libc::EEXIST,
        ErrorKind::Permission => libc::EPERM,
        ErrorKind::InvalidArgument => libc::EINVAL,
        ErrorKind::Io
        | ErrorKind::Network
        | ErrorKind::Chunking
        | ErrorKind::Config
        | ErrorKind::InvalidReplica
        | ErrorKind::Uninitialized
        | ErrorKind::Internal => libc::EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn posix_mapping() {
        assert_eq!(errno(&Error::NotFound("x".into())), libc::ENOENT);
        assert_eq!(errno(&Error::AlreadyExists("x".into())), libc::EEXIST);
        assert_eq!(errno(&Error::Permission("x".into())), libc::EPERM);
        assert_eq!(errno(&Error::Internal("x".into())), libc::EIO);
    }
}
