//! Error taxonomy shared across the store and trimmer.

use std::io;

use thiserror::Error;

/// Errors surfaced by cache operations.
///
/// Filesystem races (a concurrent process removing an entry we were about to
/// read) are not errors: every `stat`/`unlink`/`link` call site distinguishes
/// `ENOENT` from other failures and recovers from the former.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Invalid configuration or arguments (non-absolute root, bad CLI flag).
    #[error("{0}")]
    User(String),

    /// A metadata entry is unparseable or references a missing file entry.
    #[error("corrupted cache entry: {0}")]
    Corrupt(String),

    /// Unexpected filesystem error (permissions, ENOSPC, EIO).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// True when `err` is `ENOENT` (entry disappeared under us).
pub fn is_not_found(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        let enoent = io::Error::from(io::ErrorKind::NotFound);
        let eperm = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(is_not_found(&enoent));
        assert!(!is_not_found(&eperm));
    }

    #[test]
    fn test_io_error_conversion() {
        let err: CacheError = io::Error::from(io::ErrorKind::Other).into();
        assert!(matches!(err, CacheError::Io(_)));
    }
}
