//! Immutable content-addressed blobs.

pub mod chunker;
pub mod store;

use std::path::PathBuf;

use bytes::Bytes;

use crate::signature::{HashAlgorithm, signature};

/// Width of one directory stride of a signature on disk.
pub const STRIDE_LEN: usize = 8;

/// File extension for blobs on disk.
pub const BLOB_EXT: &str = "blob";

/// An immutable byte sequence addressed by its content signature.
///
/// Two blobs with the same bytes and algorithm always carry the same hash,
/// which is why concurrent writers may race the same on-disk path
/// idempotently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    data: Bytes,
    hash: String,
}

impl Blob {
    /// Creates a blob by signing `data` with the given algorithm.
    pub fn new(data: impl Into<Bytes>, alg: HashAlgorithm) -> Blob {
        let data = data.into();
        let hash = signature(alg, &data);
        Blob { data, hash }
    }

    /// Reassembles a blob from bytes and a previously computed signature.
    /// An empty hash marks opaque data loaded from a non-blob path.
    pub fn from_parts(data: Bytes, hash: String) -> Blob {
        Blob { data, hash }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Path of this blob relative to a storage root:
    /// fixed-width strides of the signature, then `<hash>.blob`.
    pub fn rel_path(&self) -> PathBuf {
        stride_path(&self.hash)
    }
}

/// Splits a signature into full 8-character strides for the directory part
/// (a trailing remainder shorter than one stride is dropped) and appends
/// `<hash>.blob` as the filename.
pub fn stride_path(hash: &str) -> PathBuf {
    let mut path = PathBuf::new();
    let bytes = hash.as_bytes();
    for stride in bytes.chunks(STRIDE_LEN) {
        if stride.len() < STRIDE_LEN {
            break;
        }
        // Signatures are base64url, always valid UTF-8 on stride boundaries.
        path.push(std::str::from_utf8(stride).expect("base64url signature"));
    }
    path.push(format!("{hash}.{BLOB_EXT}"));
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_path_vector() {
        let blob = Blob::new(
            &b"I shot the elephant in my pajamas"[..],
            HashAlgorithm::Sha256,
        );
        assert_eq!(blob.hash(), "7rYjqdSaixrocwtlp86HAEYTMfPS71tObgYGVtR-SUI");
        assert_eq!(
            blob.rel_path(),
            PathBuf::from(
                "7rYjqdSa/ixrocwtl/p86HAEYT/MfPS71tO/bgYGVtR-/7rYjqdSaixrocwtlp86HAEYTMfPS71tObgYGVtR-SUI.blob"
            )
        );
    }

    #[test]
    fn filename_stem_is_hash() {
        let blob = Blob::new(&b"hello"[..], HashAlgorithm::Sha256);
        let path = blob.rel_path();
        assert_eq!(path.extension().unwrap(), BLOB_EXT);
        assert_eq!(path.file_stem().unwrap().to_str().unwrap(), blob.hash());
    }

    #[test]
    fn same_bytes_same_hash() {
        let a = Blob::new(&b"identical"[..], HashAlgorithm::Md5);
        let b = Blob::new(&b"identical"[..], HashAlgorithm::Md5);
        assert_eq!(a.hash(), b.hash());
    }
}
