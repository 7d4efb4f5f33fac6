//! Ordered key-value engine abstraction.
//!
//! The metadata index lives in three logical keyspaces over one engine:
//! `names` maps fluid paths to node-type records, `prefixes` holds directory
//! snapshots, and `versions` holds file revision records. Engines are
//! pluggable; each backend lives in its own crate under `kv_engines/`.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyspace {
    Names,
    Prefixes,
    Versions,
}

impl Keyspace {
    pub const ALL: [Keyspace; 3] = [Keyspace::Names, Keyspace::Prefixes, Keyspace::Versions];

    pub fn name(&self) -> &'static str {
        match self {
            Keyspace::Names => "names",
            Keyspace::Prefixes => "prefixes",
            Keyspace::Versions => "versions",
        }
    }
}

impl std::fmt::Display for Keyspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Single-pass scan cursor.
///
/// Entries arrive in byte-lexicographic key order, filtered to the scan
/// prefix. The backing transaction is finished before the cursor is handed
/// out, so dropping a cursor mid-iteration never pins engine resources.
/// A fault that interrupted the scan is surfaced through [`Cursor::error`].
#[derive(Debug, Default)]
pub struct Cursor {
    entries: std::collections::VecDeque<(Bytes, Bytes)>,
    error: Option<Error>,
}

impl Cursor {
    pub fn new(entries: Vec<(Bytes, Bytes)>) -> Self {
        Cursor {
            entries: entries.into(),
            error: None,
        }
    }

    /// A cursor that yields the entries gathered before `error` struck.
    pub fn interrupted(entries: Vec<(Bytes, Bytes)>, error: Error) -> Self {
        Cursor {
            entries: entries.into(),
            error: Some(error),
        }
    }

    pub fn next_entry(&mut self) -> Option<(Bytes, Bytes)> {
        self.entries.pop_front()
    }

    /// Any fault hit while the scan was materialized.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Iterator for Cursor {
    type Item = (Bytes, Bytes);

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry()
    }
}

/// Ordered byte-key store with three named keyspaces.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Engine driver name, e.g. `redb`.
    fn name(&self) -> &'static str;

    /// Absent keys are `Ok(None)`, never an error.
    async fn get(&self, key: &[u8], ks: Keyspace) -> Result<Option<Bytes>>;

    /// Overwrite semantics.
    async fn put(&self, key: &[u8], value: &[u8], ks: Keyspace) -> Result<()>;

    /// Idempotent; deleting an absent key succeeds.
    async fn delete(&self, key: &[u8], ks: Keyspace) -> Result<()>;

    /// Writes every pair or none. Mismatched array lengths are an
    /// `InvalidArgument` error before anything is written.
    async fn batch(&self, keys: &[Vec<u8>], values: &[Vec<u8>], ks: Keyspace) -> Result<()>;

    /// Number of keys in the keyspace.
    async fn count(&self, ks: Keyspace) -> Result<u64>;

    /// Prefix scan in byte-lexicographic key order.
    async fn scan(&self, prefix: &[u8], ks: Keyspace) -> Result<Cursor>;

    /// Releases underlying resources; further calls may fail.
    async fn close(&self) -> Result<()>;
}

/// Guard shared by engine implementations for the batch length contract.
pub fn check_batch_lengths(keys: &[Vec<u8>], values: &[Vec<u8>]) -> Result<()> {
    if keys.len() != values.len() {
        return Err(Error::InvalidArgument(format!(
            "batch of {} keys against {} values",
            keys.len(),
            values.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_drains_in_order() {
        let mut cursor = Cursor::new(vec![
            (Bytes::from_static(b"a"), Bytes::from_static(b"1")),
            (Bytes::from_static(b"b"), Bytes::from_static(b"2")),
        ]);
        assert_eq!(cursor.len(), 2);
        assert_eq!(cursor.next_entry().unwrap().0.as_ref(), b"a");
        assert_eq!(cursor.next_entry().unwrap().0.as_ref(), b"b");
        assert!(cursor.next_entry().is_none());
        assert!(cursor.error().is_none());
    }

    #[test]
    fn interrupted_cursor_surfaces_fault() {
        let cursor = Cursor::interrupted(Vec::new(), Error::Internal("txn lost".into()));
        assert!(cursor.error().is_some());
    }

    #[test]
    fn batch_length_guard() {
        assert!(check_batch_lengths(&[vec![1]], &[vec![2]]).is_ok());
        assert!(check_batch_lengths(&[vec![1]], &[]).is_err());
    }
}
