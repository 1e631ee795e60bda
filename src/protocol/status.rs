//! Download status types
//!
//! Owned, serializable view of a download for callers outside the
//! control context.

use super::interrupt::InterruptReason;
use super::types::{DangerType, DownloadId, DownloadState, SafetyState, StoreHandle};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use url::Url;

/// Point-in-time copy of a download's state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSnapshot {
    pub id: DownloadId,
    pub db_handle: StoreHandle,
    pub url: Url,
    pub original_url: Url,
    pub referrer_url: Option<Url>,
    pub mime_type: String,
    pub state: DownloadState,
    pub danger_type: DangerType,
    pub safety_state: SafetyState,
    pub last_reason: InterruptReason,
    pub received_bytes: i64,
    pub total_bytes: i64,
    /// -1 when unknown
    pub percent_complete: i32,
    pub bytes_per_sec: i64,
    pub current_path: PathBuf,
    pub target_path: PathBuf,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub is_paused: bool,
    pub opened: bool,
    pub auto_opened: bool,
    pub is_temporary: bool,
    pub is_otr: bool,
    pub all_data_saved: bool,
    pub file_externally_removed: bool,
    /// Hex SHA-256 of the finished file, empty if not computed
    pub hash: String,
}

impl DownloadSnapshot {
    /// Name shown to the user
    pub fn display_name(&self) -> String {
        self.target_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}
