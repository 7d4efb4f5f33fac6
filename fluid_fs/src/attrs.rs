//! POSIX-style node attributes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Block unit reported in attributes.
pub const ATTR_BLOCK_SIZE: u64 = 512;

/// Mode bit for directories.
pub const MODE_DIR: u32 = 0o040000;
/// Mode bit for regular files.
pub const MODE_FILE: u32 = 0o100000;
/// Mode bit for symbolic links.
pub const MODE_SYMLINK: u32 = 0o120000;
/// Mask selecting the file-type bits of a mode.
pub const MODE_TYPE_MASK: u32 = 0o170000;

pub const DEFAULT_DIR_PERM: u32 = 0o755;
pub const DEFAULT_FILE_PERM: u32 = 0o644;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAttrs {
    pub size: u64,
    pub blocks: u64,
    pub atime: DateTime<Utc>,
    pub mtime: DateTime<Utc>,
    pub ctime: DateTime<Utc>,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    /// Archived nodes reject every mutating operation.
    pub archive: bool,
}

impl NodeAttrs {
    pub fn new_dir(perm: u32, uid: u32, gid: u32) -> Self {
        let now = Utc::now();
        NodeAttrs {
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            mode: MODE_DIR | (perm & !MODE_TYPE_MASK),
            uid,
            gid,
            nlink: 2,
            archive: false,
        }
    }

    pub fn new_file(perm: u32, uid: u32, gid: u32) -> Self {
        let now = Utc::now();
        NodeAttrs {
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            mode: MODE_FILE | (perm & !MODE_TYPE_MASK),
            uid,
            gid,
            nlink: 1,
            archive: false,
        }
    }

    pub fn new_symlink(uid: u32, gid: u32) -> Self {
        let mut attrs = NodeAttrs::new_file(0o777, uid, gid);
        attrs.mode = MODE_SYMLINK | 0o777;
        attrs
    }

    pub fn is_dir(&self) -> bool {
        self.mode & MODE_TYPE_MASK == MODE_DIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & MODE_TYPE_MASK == MODE_SYMLINK
    }

    /// Updates size and derived block count together.
    pub fn set_size(&mut self, size: u64) {
        self.size = size;
        self.blocks = size.div_ceil(ATTR_BLOCK_SIZE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_bits() {
        let dir = NodeAttrs::new_dir(0o755, 0, 0);
        assert!(dir.is_dir());
        assert!(!dir.is_symlink());
        let file = NodeAttrs::new_file(0o644, 0, 0);
        assert!(!file.is_dir());
        let link = NodeAttrs::new_symlink(0, 0);
        assert!(link.is_symlink());
    }

    #[test]
    fn block_count_tracks_size() {
        let mut attrs = NodeAttrs::new_file(0o644, 0, 0);
        attrs.set_size(1);
        assert_eq!(attrs.blocks, 1);
        attrs.set_size(512);
        assert_eq!(attrs.blocks, 1);
        attrs.set_size(513);
        assert_eq!(attrs.blocks, 2);
        attrs.set_size(0);
        assert_eq!(attrs.blocks, 0);
    }
}
