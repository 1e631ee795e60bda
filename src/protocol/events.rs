//! Download events
//!
//! Events broadcast by the download manager.

use super::interrupt::InterruptReason;
use super::types::{DownloadId, DownloadState};
use serde::{Deserialize, Serialize};

/// Events emitted by the download manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DownloadEvent {
    /// A download was added to the manager
    Created { id: DownloadId },
    /// A download's observable state changed
    Updated {
        id: DownloadId,
        state: DownloadState,
        received_bytes: i64,
        total_bytes: i64,
        last_reason: InterruptReason,
    },
    /// A completed download was opened
    Opened { id: DownloadId },
    /// A download is about to be destroyed
    Removed { id: DownloadId },
    /// The set of downloads changed
    ModelChanged,
    /// The manager is shutting down
    ManagerGoingDown,
}

impl DownloadEvent {
    /// The download this event is about, if any
    pub fn id(&self) -> Option<DownloadId> {
        match self {
            Self::Created { id }
            | Self::Updated { id, .. }
            | Self::Opened { id }
            | Self::Removed { id } => Some(*id),
            Self::ModelChanged | Self::ManagerGoingDown => None,
        }
    }
}
