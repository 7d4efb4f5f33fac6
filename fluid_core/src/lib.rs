//! # FluidFS core
//!
//! Types and traits shared by all FluidFS crates:
//!
//! - [`signature`] – the content digest family and base64url signatures.
//! - [`blob`] – immutable blobs, fixed/content-defined chunkers, and the
//!   content-addressed on-disk store.
//! - [`version`] – Lamport scalar versions ordering file revisions.
//! - [`kv`] – the ordered key-value engine abstraction with the three
//!   metadata keyspaces (backends live under `kv_engines/`).
//! - [`error`] – the crate-wide error taxonomy.

pub mod blob;
pub mod config;
pub mod error;
pub mod kv;
pub mod signature;
pub mod version;

pub use blob::chunker::{Blobs, Chunker};
pub use blob::store::BlobStore;
pub use blob::{Blob, stride_path};
pub use config::{ChunkingMethod, StorageConfig};
pub use error::{Error, ErrorKind, Result};
pub use kv::{Cursor, Engine, Keyspace};
pub use signature::{HashAlgorithm, signature};
pub use version::Version;
