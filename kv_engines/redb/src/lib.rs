//! `RedbEngine` - the durable KV engine backed by redb.
//!
//! Each keyspace maps to its own redb table. All transaction work runs in
//! `spawn_blocking`; scans materialize the prefix range while the read
//! transaction is live and release it before the cursor is handed out.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use fluid_core::error::{Error, Result};
use fluid_core::kv::{Cursor, Engine, Keyspace, check_batch_lengths};
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::debug;

const NAMES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("names");
const PREFIXES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("prefixes");
const VERSIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("versions");

fn table(ks: Keyspace) -> TableDefinition<'static, &'static [u8], &'static [u8]> {
    match ks {
        Keyspace::Names => NAMES,
        Keyspace::Prefixes => PREFIXES,
        Keyspace::Versions => VERSIONS,
    }
}

fn engine_err(err: impl std::fmt::Display) -> Error {
    Error::Internal(format!("redb: {err}"))
}

fn join_err(err: tokio::task::JoinError) -> Error {
    Error::Internal(format!("redb task failed: {err}"))
}

#[derive(Clone)]
pub struct RedbEngine {
    db: Arc<Database>,
}

impl RedbEngine {
    /// Opens (or creates) the database file and bootstraps all three
    /// keyspace tables, so the first access may safely be a read.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = Database::create(path.as_ref()).map_err(engine_err)?;
        {
            let write_txn = db.begin_write().map_err(engine_err)?;
            for ks in Keyspace::ALL {
                // `open_table` on a write transaction creates the table
                // if it does not already exist.
                let _ = write_txn.open_table(table(ks)).map_err(engine_err)?;
            }
            write_txn.commit().map_err(engine_err)?;
        }
        Ok(RedbEngine { db: Arc::new(db) })
    }
}

impl std::fmt::Debug for RedbEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbEngine").finish()
    }
}

#[async_trait]
impl Engine for RedbEngine {
    fn name(&self) -> &'static str {
        "redb"
    }

    async fn get(&self, key: &[u8], ks: Keyspace) -> Result<Option<Bytes>> {
        let db = self.db.clone();
        let key = key.to_vec();
        tokio::task::spawn_blocking(move || -> Result<Option<Bytes>> {
            let read_txn = db.begin_read().map_err(engine_err)?;
            let table = read_txn.open_table(table(ks)).map_err(engine_err)?;
            let value = table
                .get(key.as_slice())
                .map_err(engine_err)?
                .map(|guard| Bytes::copy_from_slice(guard.value()));
            Ok(value)
        })
        .await
        .map_err(join_err)?
    }

    async fn put(&self, key: &[u8], value: &[u8], ks: Keyspace) -> Result<()> {
        let db = self.db.clone();
        let key = key.to_vec();
        let value = value.to_vec();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let write_txn = db.begin_write().map_err(engine_err)?;
            {
                let mut table = write_txn.open_table(table(ks)).map_err(engine_err)?;
                table
                    .insert(key.as_slice(), value.as_slice())
                    .map_err(engine_err)?;
            }
            write_txn.commit().map_err(engine_err)?;
            Ok(())
        })
        .await
        .map_err(join_err)?
    }

    async fn delete(&self, key: &[u8], ks: Keyspace) -> Result<()> {
        let db = self.db.clone();
        let key = key.to_vec();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let write_txn = db.begin_write().map_err(engine_err)?;
            {
                let mut table = write_txn.open_table(table(ks)).map_err(engine_err)?;
                table.remove(key.as_slice()).map_err(engine_err)?;
            }
            write_txn.commit().map_err(engine_err)?;
            Ok(())
        })
        .await
        .map_err(join_err)?
    }

    async fn batch(&self, keys: &[Vec<u8>], values: &[Vec<u8>], ks: Keyspace) -> Result<()> {
        check_batch_lengths(keys, values)?;
        let db = self.db.clone();
        let keys = keys.to_vec();
        let values = values.to_vec();
        tokio::task::spawn_blocking(move || -> Result<()> {
            // One transaction: either every pair commits or none does.
            let write_txn = db.begin_write().map_err(engine_err)?;
            {
                let mut table = write_txn.open_table(table(ks)).map_err(engine_err)?;
                for (key, value) in keys.iter().zip(&values) {
                    table
                        .insert(key.as_slice(), value.as_slice())
                        .map_err(engine_err)?;
                }
            }
            write_txn.commit().map_err(engine_err)?;
            Ok(())
        })
        .await
        .map_err(join_err)?
    }

    async fn count(&self, ks: Keyspace) -> Result<u64> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<u64> {
            let read_txn = db.begin_read().map_err(engine_err)?;
            let table = read_txn.open_table(table(ks)).map_err(engine_err)?;
            table.len().map_err(engine_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn scan(&self, prefix: &[u8], ks: Keyspace) -> Result<Cursor> {
        let db = self.db.clone();
        let prefix = prefix.to_vec();
        tokio::task::spawn_blocking(move || -> Result<Cursor> {
            let read_txn = db.begin_read().map_err(engine_err)?;
            let table = read_txn.open_table(table(ks)).map_err(engine_err)?;
            let mut entries = Vec::new();
            let range = match table.range(prefix.as_slice()..) {
                Ok(range) => range,
                Err(err) => return Ok(Cursor::interrupted(entries, engine_err(err))),
            };
            for item in range {
                match item {
                    Ok((key, value)) => {
                        if !key.value().starts_with(&prefix) {
                            break;
                        }
                        entries.push((
                            Bytes::copy_from_slice(key.value()),
                            Bytes::copy_from_slice(value.value()),
                        ));
                    }
                    // Keep what was gathered, surface the fault.
                    Err(err) => return Ok(Cursor::interrupted(entries, engine_err(err))),
                }
            }
            Ok(Cursor::new(entries))
        })
        .await
        .map_err(join_err)?
    }

    async fn close(&self) -> Result<()> {
        // redb flushes committed transactions on drop; nothing to tear down
        // beyond releasing our handle.
        debug!("redb engine closing");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RedbEngine) {
        let dir = tempfile::tempdir().unwrap();
        let engine = RedbEngine::open(dir.path().join("meta.redb")).unwrap();
        (dir, engine)
    }

    #[tokio::test]
    async fn get_after_put_and_delete() {
        let (_dir, engine) = open_temp();
        assert!(engine.get(b"/p", Keyspace::Names).await.unwrap().is_none());
        engine.put(b"/p", b"one", Keyspace::Names).await.unwrap();
        engine.put(b"/p", b"two", Keyspace::Names).await.unwrap();
        assert_eq!(
            engine.get(b"/p", Keyspace::Names).await.unwrap().unwrap(),
            Bytes::from_static(b"two")
        );
        engine.delete(b"/p", Keyspace::Names).await.unwrap();
        engine.delete(b"/p", Keyspace::Names).await.unwrap();
        assert!(engine.get(b"/p", Keyspace::Names).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn batch_commits_atomically() {
        let (_dir, engine) = open_temp();
        let keys: Vec<Vec<u8>> = (0..32).map(|i| format!("/k/{i:02}").into_bytes()).collect();
        let values: Vec<Vec<u8>> = (0..32).map(|i| format!("v{i}").into_bytes()).collect();
        engine.batch(&keys, &values, Keyspace::Versions).await.unwrap();
        assert_eq!(engine.count(Keyspace::Versions).await.unwrap(), 32);

        let err = engine
            .batch(&keys, &values[..3], Keyspace::Versions)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), fluid_core::ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn scan_orders_bytewise() {
        let (_dir, engine) = open_temp();
        for key in ["/a/10", "/a/2", "/a/1", "/b/1"] {
            engine
                .put(key.as_bytes(), key.as_bytes(), Keyspace::Prefixes)
                .await
                .unwrap();
        }
        let keys: Vec<String> = engine
            .scan(b"/a/", Keyspace::Prefixes)
            .await
            .unwrap()
            .map(|(key, _)| String::from_utf8(key.to_vec()).unwrap())
            .collect();
        // Byte-lexicographic, not numeric.
        assert_eq!(keys, vec!["/a/1", "/a/10", "/a/2"]);
    }

    #[tokio::test]
    async fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.redb");
        {
            let engine = RedbEngine::open(&path).unwrap();
            engine.put(b"/keep", b"me", Keyspace::Names).await.unwrap();
            engine.close().await.unwrap();
        }
        let engine = RedbEngine::open(&path).unwrap();
        assert_eq!(
            engine.get(b"/keep", Keyspace::Names).await.unwrap().unwrap(),
            Bytes::from_static(b"me")
        );
    }
}
