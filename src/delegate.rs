//! Embedder hooks
//!
//! The manager asks its delegate at the few points where the embedding
//! application gets a say: where to save when the user must be asked,
//! whether a finished download may complete or open, and how to hand a
//! file to the OS shell.

use crate::item::DownloadItem;
use crate::protocol::DownloadId;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Hooks the manager calls into
#[async_trait]
pub trait DownloadManagerDelegate: Send + Sync {
    /// Ask the user where to save `id`. `suggested` is the pre-filled
    /// choice; `None` means the user dismissed the prompt.
    async fn choose_download_path(&self, _id: DownloadId, suggested: PathBuf) -> Option<PathBuf> {
        Some(suggested)
    }

    /// Returning false holds the download back; the delegate must call
    /// `DownloadManager::maybe_complete_download` once it is done.
    fn should_complete_download(&self, _item: &DownloadItem) -> bool {
        true
    }

    /// Returning false means the delegate opens the file itself and
    /// reports back through `DownloadManager::delayed_download_opened`.
    fn should_open_download(&self, _item: &DownloadItem) -> bool {
        true
    }

    /// Whether downloads should be hashed while they are written
    fn generate_file_hash(&self) -> bool {
        true
    }

    /// Open a completed file. Fire and forget.
    fn open_item(&self, path: &Path) {
        tracing::debug!("No shell integration, not opening {:?}", path);
    }

    /// Reveal a file in the platform file browser. Fire and forget.
    fn show_item_in_folder(&self, path: &Path) {
        tracing::debug!("No shell integration, not showing {:?}", path);
    }
}

/// Delegate that accepts every suggestion and has no shell integration
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDelegate;

impl DownloadManagerDelegate for DefaultDelegate {}
