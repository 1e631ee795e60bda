//! Observer interfaces
//!
//! Notifications are always delivered on the control context, from inside
//! the manager's message loop. Observers must not block.

use crate::item::DownloadItem;
use crate::protocol::DownloadId;

/// Receives changes to one download
pub trait DownloadItemObserver: Send + Sync {
    /// Any observable field changed
    fn on_download_updated(&self, item: &DownloadItem);

    /// The completed file was opened
    fn on_download_opened(&self, _item: &DownloadItem) {}

    /// Last notification before the download is destroyed
    fn on_download_destroyed(&self, _item: &DownloadItem) {}
}

/// Receives changes to the set of downloads
pub trait DownloadManagerObserver: Send + Sync {
    /// Downloads were added or removed
    fn model_changed(&self) {}

    /// The manager is shutting down; drop any references to it
    fn manager_going_down(&self) {}

    /// A save-location prompt is being shown for `id`
    fn select_file_dialog_displayed(&self, _id: DownloadId) {}
}
