//! Interrupt and deletion reason codes

use crate::error::{EngineError, StorageErrorKind};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Why a download stopped before completing.
///
/// `None` is the value of a download that was never interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptReason {
    #[default]
    None,

    // File errors
    FileFailed,
    FileAccessDenied,
    FileNoSpace,
    FileNameTooLong,
    FileTooLarge,
    FileVirusInfected,
    FileTransientError,

    // Network errors
    NetworkFailed,
    NetworkTimeout,
    NetworkDisconnected,

    // Server errors
    ServerFailed,

    // User actions
    UserCanceled,
    UserShutdown,

    /// The process died with the download in flight
    Crash,
}

impl InterruptReason {
    /// Classify an I/O error from the file layer
    pub fn from_io(err: &std::io::Error) -> Self {
        let kind = StorageErrorKind::from_io(err);
        EngineError::storage(kind, PathBuf::new(), String::new()).interrupt_reason()
    }

    pub fn is_file_error(&self) -> bool {
        matches!(
            self,
            Self::FileFailed
                | Self::FileAccessDenied
                | Self::FileNoSpace
                | Self::FileNameTooLong
                | Self::FileTooLarge
                | Self::FileVirusInfected
                | Self::FileTransientError
        )
    }

    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            Self::NetworkFailed | Self::NetworkTimeout | Self::NetworkDisconnected
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::FileFailed => "file_failed",
            Self::FileAccessDenied => "file_access_denied",
            Self::FileNoSpace => "file_no_space",
            Self::FileNameTooLong => "file_name_too_long",
            Self::FileTooLarge => "file_too_large",
            Self::FileVirusInfected => "file_virus_infected",
            Self::FileTransientError => "file_transient_error",
            Self::NetworkFailed => "network_failed",
            Self::NetworkTimeout => "network_timeout",
            Self::NetworkDisconnected => "network_disconnected",
            Self::ServerFailed => "server_failed",
            Self::UserCanceled => "user_canceled",
            Self::UserShutdown => "user_shutdown",
            Self::Crash => "crash",
        }
    }
}

impl std::fmt::Display for InterruptReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a download's file is being deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteReason {
    /// The user discarded a (usually dangerous) download
    UserDiscard,
    /// The manager is shutting down with the download unconfirmed
    BrowserShutdown,
}
