//! Typed error hierarchy for dlpipe
//!
//! Errors never cross the control/I-O boundary as values a caller has to
//! unwind: file and network failures are folded into an [`InterruptReason`]
//! attached to the download, while everything else is reported through
//! [`EngineError`].

use crate::protocol::InterruptReason;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the download pipeline
#[derive(Debug, Error)]
pub enum EngineError {
    /// Network-related errors (connection, timeout, HTTP status)
    #[error("Network error: {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
        retryable: bool,
    },

    /// Storage/filesystem errors
    #[error("Storage error at {path:?}: {message}")]
    Storage {
        kind: StorageErrorKind,
        path: PathBuf,
        message: String,
    },

    /// Invalid input from the caller
    #[error("Invalid input for '{field}': {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },

    /// Download not found
    #[error("Download not found: {0}")]
    NotFound(String),

    /// Invalid state transition
    #[error("Invalid state: cannot {action} while {current_state}")]
    InvalidState {
        action: &'static str,
        current_state: String,
    },

    /// Manager is shutting down
    #[error("Download manager is shutting down")]
    Shutdown,

    /// History database error
    #[error("Database error: {0}")]
    Database(String),

    /// Internal error (bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Network error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Connection refused
    ConnectionRefused,
    /// Connection reset
    ConnectionReset,
    /// Connection timeout
    Timeout,
    /// Server returned error status
    HttpStatus(u16),
    /// Too many redirects
    TooManyRedirects,
    /// Other network error
    Other,
}

/// Storage error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// File/directory not found
    NotFound,
    /// Permission denied
    PermissionDenied,
    /// Disk full
    DiskFull,
    /// File name exceeds the filesystem limit
    NameTooLong,
    /// File exceeds the filesystem size limit
    FileTooLarge,
    /// Path is outside allowed directory (security)
    PathTraversal,
    /// File already exists
    AlreadyExists,
    /// Invalid path
    InvalidPath,
    /// I/O error
    Io,
}

impl StorageErrorKind {
    /// Classify an I/O error.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => Self::NotFound,
            ErrorKind::PermissionDenied => Self::PermissionDenied,
            ErrorKind::AlreadyExists => Self::AlreadyExists,
            ErrorKind::InvalidInput => Self::InvalidPath,
            _ => match err.raw_os_error() {
                // ENOSPC / EDQUOT
                Some(28) | Some(122) => Self::DiskFull,
                // ENAMETOOLONG
                Some(36) => Self::NameTooLong,
                // EFBIG
                Some(27) => Self::FileTooLarge,
                _ => Self::Io,
            },
        }
    }
}

impl EngineError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { retryable, .. } => *retryable,
            Self::Storage { kind, .. } => matches!(kind, StorageErrorKind::Io),
            _ => false,
        }
    }

    /// Create a network error
    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        let retryable = matches!(
            kind,
            NetworkErrorKind::Timeout | NetworkErrorKind::ConnectionReset
        );
        Self::Network {
            kind,
            message: message.into(),
            retryable,
        }
    }

    /// Create a storage error
    pub fn storage(
        kind: StorageErrorKind,
        path: impl Into<PathBuf>,
        message: impl Into<String>,
    ) -> Self {
        Self::Storage {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a storage error from an I/O error on `path`
    pub fn io(path: impl Into<PathBuf>, context: &str, err: std::io::Error) -> Self {
        Self::Storage {
            kind: StorageErrorKind::from_io(&err),
            path: path.into(),
            message: format!("{}: {}", context, err),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }

    /// The reason code recorded on a download interrupted by this error.
    pub fn interrupt_reason(&self) -> InterruptReason {
        match self {
            Self::Storage { kind, .. } => match kind {
                StorageErrorKind::PermissionDenied => InterruptReason::FileAccessDenied,
                StorageErrorKind::DiskFull => InterruptReason::FileNoSpace,
                StorageErrorKind::NameTooLong => InterruptReason::FileNameTooLong,
                StorageErrorKind::FileTooLarge => InterruptReason::FileTooLarge,
                StorageErrorKind::Io => InterruptReason::FileTransientError,
                _ => InterruptReason::FileFailed,
            },
            Self::Network { kind, .. } => match kind {
                NetworkErrorKind::Timeout => InterruptReason::NetworkTimeout,
                NetworkErrorKind::ConnectionReset => InterruptReason::NetworkDisconnected,
                NetworkErrorKind::HttpStatus(_) => InterruptReason::ServerFailed,
                _ => InterruptReason::NetworkFailed,
            },
            Self::Shutdown => InterruptReason::UserShutdown,
            _ => InterruptReason::FileFailed,
        }
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, EngineError>;

// Implement From traits for common error types

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage {
            kind: StorageErrorKind::from_io(&err),
            path: PathBuf::new(),
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            NetworkErrorKind::Timeout
        } else if err.is_connect() {
            NetworkErrorKind::ConnectionRefused
        } else if err.is_redirect() {
            NetworkErrorKind::TooManyRedirects
        } else if let Some(status) = err.status() {
            NetworkErrorKind::HttpStatus(status.as_u16())
        } else {
            NetworkErrorKind::Other
        };

        let retryable = matches!(
            kind,
            NetworkErrorKind::Timeout | NetworkErrorKind::ConnectionRefused
        );

        Self::Network {
            kind,
            message: err.to_string(),
            retryable,
        }
    }
}

impl From<url::ParseError> for EngineError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidInput {
            field: "url",
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "storage")]
impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {}", err))
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("Background task failed: {}", err))
    }
}
