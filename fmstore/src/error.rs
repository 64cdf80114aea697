use std::io;

use thiserror::Error;

pub type Result<T, E = StorageError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    // Mutating call without overwrite permission hit an existing resource.
    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    // Transient network/connection failure. Never retried here.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(io::Error),

    #[error("{0}")]
    Other(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_))
    }

    /// Attach the resource a bare io error was about.
    pub fn from_io(err: io::Error, what: impl Into<String>) -> Self {
        let what = what.into();
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(what),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(what),
            io::ErrorKind::AlreadyExists => Self::AlreadyExists(what),
            io::ErrorKind::Unsupported => Self::UnsupportedOperation(what),
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::TimedOut => Self::BackendUnavailable(format!("{what}: {err}")),
            _ => Self::Io(err),
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        let what = err.to_string();
        Self::from_io(err, what)
    }
}
