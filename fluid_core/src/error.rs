//! Crate-wide error taxonomy.
//!
//! Every failure in FluidFS carries one of the kinds below. Background tasks
//! use [`Error::is_transient`] to decide between retrying next tick and
//! publishing a fatal error; the mount bridge maps kinds to POSIX codes at
//! its own edge.

use std::io;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("network error: {0}")]
    Network(String),

    #[error("chunking error: {0}")]
    Chunking(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid replica: {0}")]
    InvalidReplica(String),

    #[error("uninitialized: {0}")]
    Uninitialized(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Discriminant-only view of [`Error`], for matching without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Io,
    Network,
    Chunking,
    NotFound,
    AlreadyExists,
    Permission,
    InvalidArgument,
    InvalidReplica,
    Uninitialized,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::Io(_) => ErrorKind::Io,
            Error::Network(_) => ErrorKind::Network,
            Error::Chunking(_) => ErrorKind::Chunking,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::Permission(_) => ErrorKind::Permission,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::InvalidReplica(_) => ErrorKind::InvalidReplica,
            Error::Uninitialized(_) => ErrorKind::Uninitialized,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Transient failures are retried by background tasks on their next
    /// tick; everything else is published to the shutdown channel.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Io | ErrorKind::Network)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_round_trip() {
        assert_eq!(Error::Config("x".into()).kind(), ErrorKind::Config);
        assert_eq!(Error::NotFound("y".into()).kind(), ErrorKind::NotFound);
        assert!(Error::Network("peer gone".into()).is_transient());
        assert!(!Error::Uninitialized("no engine".into()).is_transient());
    }

    #[test]
    fn io_errors_convert() {
        fn read() -> Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "boom"))?;
            Ok(())
        }
        assert_eq!(read().unwrap_err().kind(), ErrorKind::Io);
    }
}
