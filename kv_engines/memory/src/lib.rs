//! In-memory `Engine` backed by ordered maps, for tests and replicas that
//! opt out of durability.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use fluid_core::error::{Error, Result};
use fluid_core::kv::{Cursor, Engine, Keyspace, check_batch_lengths};
use tokio::sync::RwLock;

#[derive(Default)]
struct Spaces {
    names: BTreeMap<Vec<u8>, Bytes>,
    prefixes: BTreeMap<Vec<u8>, Bytes>,
    versions: BTreeMap<Vec<u8>, Bytes>,
}

impl Spaces {
    fn space(&self, ks: Keyspace) -> &BTreeMap<Vec<u8>, Bytes> {
        match ks {
            Keyspace::Names => &self.names,
            Keyspace::Prefixes => &self.prefixes,
            Keyspace::Versions => &self.versions,
        }
    }

    fn space_mut(&mut self, ks: Keyspace) -> &mut BTreeMap<Vec<u8>, Bytes> {
        match ks {
            Keyspace::Names => &mut self.names,
            Keyspace::Prefixes => &mut self.prefixes,
            Keyspace::Versions => &mut self.versions,
        }
    }
}

#[derive(Default)]
pub struct MemoryEngine {
    spaces: RwLock<Spaces>,
    closed: AtomicBool,
}

impl MemoryEngine {
    pub fn new() -> Self {
        MemoryEngine::default()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Uninitialized("memory engine is closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &[u8], ks: Keyspace) -> Result<Option<Bytes>> {
        self.check_open()?;
        let spaces = self.spaces.read().await;
        Ok(spaces.space(ks).get(key).cloned())
    }

    async fn put(&self, key: &[u8], value: &[u8], ks: Keyspace) -> Result<()> {
        self.check_open()?;
        let mut spaces = self.spaces.write().await;
        spaces
            .space_mut(ks)
            .insert(key.to_vec(), Bytes::copy_from_slice(value));
        Ok(())
    }

    async fn delete(&self, key: &[u8], ks: Keyspace) -> Result<()> {
        self.check_open()?;
        let mut spaces = self.spaces.write().await;
        spaces.space_mut(ks).remove(key);
        Ok(())
    }

    async fn batch(&self, keys: &[Vec<u8>], values: &[Vec<u8>], ks: Keyspace) -> Result<()> {
        self.check_open()?;
        check_batch_lengths(keys, values)?;
        // One write-lock hold makes the batch all-or-nothing.
        let mut spaces = self.spaces.write().await;
        let space = spaces.space_mut(ks);
        for (key, value) in keys.iter().zip(values) {
            space.insert(key.clone(), Bytes::copy_from_slice(value));
        }
        Ok(())
    }

    async fn count(&self, ks: Keyspace) -> Result<u64> {
        self.check_open()?;
        let spaces = self.spaces.read().await;
        Ok(spaces.space(ks).len() as u64)
    }

    async fn scan(&self, prefix: &[u8], ks: Keyspace) -> Result<Cursor> {
        self.check_open()?;
        let spaces = self.spaces.read().await;
        let entries: Vec<(Bytes, Bytes)> = spaces
            .space(ks)
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (Bytes::copy_from_slice(key), value.clone()))
            .collect();
        Ok(Cursor::new(entries))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_put_delete() {
        let engine = MemoryEngine::new();
        assert!(
            engine
                .get(b"/alpha", Keyspace::Names)
                .await
                .unwrap()
                .is_none()
        );
        engine.put(b"/alpha", b"dir", Keyspace::Names).await.unwrap();
        assert_eq!(
            engine.get(b"/alpha", Keyspace::Names).await.unwrap().unwrap(),
            Bytes::from_static(b"dir")
        );
        engine.delete(b"/alpha", Keyspace::Names).await.unwrap();
        assert!(
            engine
                .get(b"/alpha", Keyspace::Names)
                .await
                .unwrap()
                .is_none()
        );
        // Idempotent delete.
        engine.delete(b"/alpha", Keyspace::Names).await.unwrap();
    }

    #[tokio::test]
    async fn keyspaces_are_disjoint() {
        let engine = MemoryEngine::new();
        engine.put(b"k", b"n", Keyspace::Names).await.unwrap();
        engine.put(b"k", b"p", Keyspace::Prefixes).await.unwrap();
        assert_eq!(
            engine.get(b"k", Keyspace::Names).await.unwrap().unwrap(),
            Bytes::from_static(b"n")
        );
        assert_eq!(
            engine.get(b"k", Keyspace::Prefixes).await.unwrap().unwrap(),
            Bytes::from_static(b"p")
        );
        assert!(engine.get(b"k", Keyspace::Versions).await.unwrap().is_none());
        assert_eq!(engine.count(Keyspace::Versions).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn scan_is_ordered_and_prefix_filtered() {
        let engine = MemoryEngine::new();
        for key in ["/b/2", "/a/2", "/a/1", "/c"] {
            engine
                .put(key.as_bytes(), b"x", Keyspace::Names)
                .await
                .unwrap();
        }
        let keys: Vec<Bytes> = engine
            .scan(b"/a", Keyspace::Names)
            .await
            .unwrap()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, vec![Bytes::from_static(b"/a/1"), Bytes::from_static(b"/a/2")]);

        let all = engine.scan(b"", Keyspace::Names).await.unwrap();
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn batch_rejects_mismatched_lengths() {
        let engine = MemoryEngine::new();
        let err = engine
            .batch(&[b"a".to_vec()], &[], Keyspace::Names)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), fluid_core::ErrorKind::InvalidArgument);
        assert_eq!(engine.count(Keyspace::Names).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn closed_engine_rejects_operations() {
        let engine = MemoryEngine::new();
        engine.close().await.unwrap();
        assert!(engine.get(b"k", Keyspace::Names).await.is_err());
    }
}
