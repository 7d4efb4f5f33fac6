//! Content-addressed blob storage on the local filesystem.
//!
//! Blobs land at `<root>/<s0>/<s1>/…/<sk>/<hash>.blob` where the `s_i` are
//! fixed-width strides of the signature. Writes go to a temporary file in
//! the final directory and are renamed into place, so concurrent writers
//! producing the same content race the same path idempotently.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::debug;

use crate::blob::{BLOB_EXT, Blob, stride_path};
use crate::error::{Error, Result};

/// Mode for stride directories.
pub const DIR_MODE: u32 = 0o755;

/// Mode for blob files.
pub const FILE_MODE: u32 = 0o644;

/// Callback invoked after each new blob lands on disk, with its final
/// path and byte length. Lets the owner keep an index (the blob tree)
/// current without the store knowing about it.
pub type SaveObserver = std::sync::Arc<dyn Fn(&Path, u64) + Send + Sync>;

#[derive(Clone)]
pub struct BlobStore {
    root: PathBuf,
    observer: Option<SaveObserver>,
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore").field("root", &self.root).finish()
    }
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        BlobStore {
            root: root.into(),
            observer: None,
        }
    }

    /// A store that reports every newly written blob to `observer`.
    pub fn with_observer(root: impl Into<PathBuf>, observer: SaveObserver) -> Self {
        BlobStore {
            root: root.into(),
            observer: Some(observer),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path a blob with this signature is stored at.
    pub fn path_for(&self, hash: &str) -> PathBuf {
        self.root.join(stride_path(hash))
    }

    /// Whether a blob with this signature is present on disk.
    pub async fn contains(&self, hash: &str) -> bool {
        tokio::fs::try_exists(self.path_for(hash))
            .await
            .unwrap_or(false)
    }

    /// Persists the blob, creating missing stride directories, and returns
    /// the final path. Saving an already-present blob is a no-op.
    pub async fn save(&self, blob: &Blob) -> Result<PathBuf> {
        if blob.hash().is_empty() {
            return Err(Error::InvalidArgument("cannot save an unsigned blob".into()));
        }
        let path = self.path_for(blob.hash());
        if tokio::fs::try_exists(&path).await? {
            debug!(hash = blob.hash(), "blob already stored");
            return Ok(path);
        }

        let dir = path.parent().ok_or_else(|| {
            Error::Internal(format!("blob path {} has no parent", path.display()))
        })?;
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(DIR_MODE);
        builder.create(dir).await?;

        // Temp-then-rename keeps partially written blobs invisible.
        let tmp = dir.join(format!(".{}.tmp", blob.hash()));
        {
            let mut options = tokio::fs::OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            options.mode(FILE_MODE);
            let mut file = options.open(&tmp).await?;
            tokio::io::AsyncWriteExt::write_all(&mut file, blob.data()).await?;
            tokio::io::AsyncWriteExt::flush(&mut file).await?;
        }
        tokio::fs::rename(&tmp, &path).await?;
        debug!(hash = blob.hash(), size = blob.len(), "blob saved");
        if let Some(observer) = &self.observer {
            observer(&path, blob.len() as u64);
        }
        Ok(path)
    }

    /// Loads a blob from an absolute path. When the path carries the
    /// `.blob` extension, the signature is the filename stem; otherwise the
    /// data is opaque and the hash is left empty.
    pub async fn load(&self, path: &Path) -> Result<Blob> {
        let data = match tokio::fs::read(path).await {
            Ok(data) => Bytes::from(data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("blob {}", path.display())));
            }
            Err(err) => return Err(err.into()),
        };
        let hash = if path.extension().and_then(|e| e.to_str()) == Some(BLOB_EXT) {
            path.file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string()
        } else {
            String::new()
        };
        Ok(Blob::from_parts(data, hash))
    }

    /// Loads a blob by signature.
    pub async fn fetch(&self, hash: &str) -> Result<Blob> {
        self.load(&self.path_for(hash)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::HashAlgorithm;

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let blob = Blob::new(&b"round trip me"[..], HashAlgorithm::Sha256);

        let path = store.save(&blob).await.unwrap();
        assert_eq!(path, store.path_for(blob.hash()));
        assert!(store.contains(blob.hash()).await);

        let loaded = store.load(&path).await.unwrap();
        assert_eq!(loaded, blob);
    }

    #[tokio::test]
    async fn save_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let blob = Blob::new(&b"same bytes"[..], HashAlgorithm::Sha1);
        let first = store.save(&blob).await.unwrap();
        let second = store.save(&blob).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn observer_sees_new_writes_once() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicU64, Ordering};

        let dir = tempfile::tempdir().unwrap();
        let seen = Arc::new(AtomicU64::new(0));
        let counter = seen.clone();
        let store = BlobStore::with_observer(
            dir.path(),
            Arc::new(move |_path, size| {
                counter.fetch_add(size, Ordering::Relaxed);
            }),
        );
        let blob = Blob::new(&b"watched"[..], HashAlgorithm::Sha256);
        store.save(&blob).await.unwrap();
        // A repeated save of the same content is not reported again.
        store.save(&blob).await.unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), blob.len() as u64);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn modes_match_layout_contract() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let blob = Blob::new(&b"mode check"[..], HashAlgorithm::Sha256);
        let path = store.save(&blob).await.unwrap();

        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, FILE_MODE);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, DIR_MODE);
    }

    #[tokio::test]
    async fn opaque_load_has_empty_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        tokio::fs::write(&path, b"opaque").await.unwrap();
        let store = BlobStore::new(dir.path());
        let blob = store.load(&path).await.unwrap();
        assert!(blob.hash().is_empty());
        assert_eq!(blob.data().as_ref(), b"opaque");
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let err = store.fetch("doesnotexist").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
