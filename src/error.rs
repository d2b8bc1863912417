//! Error types for the search engine.

use std::fmt;
use std::path::PathBuf;

/// Errors surfaced by engine operations.
#[derive(Debug)]
pub enum Error {
    /// Operation not available on the active backend
    Unsupported(&'static str),
    /// Missing privileges (volume access, unreadable path)
    PermissionDenied(String),
    /// Path does not exist
    NotFound(PathBuf),
    /// Underlying I/O failure
    Io(std::io::Error),
    /// Volume became unreadable mid-enumeration
    VolumeIo(String),
    /// Snapshot or on-disk record parse failure
    Format(String),
    /// String pool id space saturated; the engine must be rebuilt
    PoolFull,
    /// Cooperative cancellation observed
    Cancelled,
    /// Indexing already running
    Busy,
    /// Query validation failed (bad regex, conflicting flags)
    InvalidQuery(String),
    /// Watcher died and could not be reconnected
    WatcherLost(String),
    /// Engine poisoned by a prior fatal error
    Unavailable,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Unsupported(op) => write!(f, "operation not supported on this backend: {op}"),
            Error::PermissionDenied(msg) => write!(f, "permission denied: {msg}"),
            Error::NotFound(path) => write!(f, "not found: {}", path.display()),
            Error::Io(err) => write!(f, "I/O error: {err}"),
            Error::VolumeIo(msg) => write!(f, "volume I/O error: {msg}"),
            Error::Format(msg) => write!(f, "format error: {msg}"),
            Error::PoolFull => write!(f, "string pool exhausted"),
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::Busy => write!(f, "indexing already running"),
            Error::InvalidQuery(msg) => write!(f, "invalid query: {msg}"),
            Error::WatcherLost(msg) => write!(f, "watcher lost: {msg}"),
            Error::Unavailable => write!(f, "engine unavailable after fatal error"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => Error::PermissionDenied(err.to_string()),
            _ => Error::Io(err),
        }
    }
}

impl From<regex::Error> for Error {
    fn from(err: regex::Error) -> Self {
        Error::InvalidQuery(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_permission_maps_to_permission_denied() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no");
        assert!(matches!(Error::from(io), Error::PermissionDenied(_)));
    }

    #[test]
    fn display_is_human_readable() {
        let e = Error::NotFound(PathBuf::from("/x/y"));
        assert_eq!(e.to_string(), "not found: /x/y");
        assert_eq!(Error::PoolFull.to_string(), "string pool exhausted");
    }
}
