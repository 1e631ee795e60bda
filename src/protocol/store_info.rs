//! The subset of a download that survives a restart

use super::types::{DownloadState, StoreHandle};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use url::Url;

/// Record written to and read back from the history store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentStoreInfo {
    pub path: PathBuf,
    pub url: Url,
    pub referrer_url: Option<Url>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub received_bytes: i64,
    pub total_bytes: i64,
    pub state: DownloadState,
    pub db_handle: StoreHandle,
    pub opened: bool,
}
