//! Download Engine - Main entry point
//!
//! The `DownloadEngine` runs a [`DownloadManager`] on a task of its own
//! and exposes it through a thread-safe handle. Every call is a closure
//! sent to that task and answered over a oneshot channel, so the manager
//! itself never needs a lock.

use crate::config::ManagerConfig;
use crate::danger::DangerCheckService;
use crate::delegate::DownloadManagerDelegate;
use crate::error::{EngineError, Result};
use crate::file::{DownloadFileManager, FileManagerConfig};
use crate::history::DownloadHistory;
#[cfg(feature = "storage")]
use crate::history::SqliteHistory;
#[cfg(feature = "http")]
use crate::http::{DownloadRequest, HttpFetcher};
use crate::manager::DownloadManager;
use crate::observer::{DownloadItemObserver, DownloadManagerObserver};
use crate::protocol::{
    DeleteReason, DownloadCreateInfo, DownloadEvent, DownloadId, DownloadSnapshot,
};
use crate::stream::ByteStream;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long shutdown waits for the control task
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

type Command = Box<dyn FnOnce(&mut DownloadManager) + Send>;

/// Optional collaborators for [`DownloadEngine::with_hooks`]
#[derive(Default)]
pub struct EngineHooks {
    pub delegate: Option<Arc<dyn DownloadManagerDelegate>>,
    pub danger_service: Option<Arc<dyn DangerCheckService>>,
    /// Used instead of the database at `ManagerConfig::database_path`
    pub history: Option<Arc<dyn DownloadHistory>>,
}

/// The main download engine
pub struct DownloadEngine {
    config: ManagerConfig,

    /// Work for the control task
    commands: mpsc::UnboundedSender<Command>,

    /// Event broadcaster, shared with the manager
    event_tx: broadcast::Sender<DownloadEvent>,

    #[cfg(feature = "http")]
    http: HttpFetcher,

    /// Shutdown flag
    shutdown: CancellationToken,

    task: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadEngine {
    /// Create an engine with the given configuration
    pub async fn new(config: ManagerConfig) -> Result<Arc<Self>> {
        Self::with_hooks(config, EngineHooks::default()).await
    }

    /// Create an engine with a custom delegate, danger service or history
    pub async fn with_hooks(config: ManagerConfig, hooks: EngineHooks) -> Result<Arc<Self>> {
        config.validate()?;

        #[cfg(feature = "http")]
        let http = HttpFetcher::new(&config)?;

        let history = match hooks.history {
            Some(history) => Some(history),
            None => open_history(&config).await,
        };

        let files = DownloadFileManager::spawn(FileManagerConfig::from(&config));
        let mut manager = DownloadManager::new(config.clone(), files)?;
        if let Some(delegate) = hooks.delegate {
            manager = manager.with_delegate(delegate);
        }
        if let Some(service) = hooks.danger_service {
            manager = manager.with_danger_service(service);
        }
        if let Some(history) = history {
            manager = manager.with_history(history);
        }
        manager.init();

        let event_tx = manager.event_sender();
        let (commands, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(manager, rx, shutdown.clone()));

        tracing::info!("Download engine started in {:?}", config.download_dir);
        Ok(Arc::new(Self {
            config,
            commands,
            event_tx,
            #[cfg(feature = "http")]
            http,
            shutdown,
            task: Mutex::new(Some(task)),
        }))
    }

    /// Run `f` on the control task and return its result
    pub async fn with_manager<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut DownloadManager) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply, wait) = oneshot::channel();
        self.commands
            .send(Box::new(move |manager| {
                let _ = reply.send(f(manager));
            }))
            .map_err(|_| EngineError::Shutdown)?;
        wait.await.map_err(|_| EngineError::Shutdown)
    }

    /// Hand over a response that is already streaming
    pub async fn start_download(&self, info: DownloadCreateInfo, stream: ByteStream) -> Result<DownloadId> {
        self.with_manager(move |m| m.start_download(info, stream))
            .await?
    }

    /// Fetch a URL and download the response
    #[cfg(feature = "http")]
    pub async fn download(&self, request: DownloadRequest) -> Result<DownloadId> {
        let (info, stream) = self.http.fetch(&request).await?;
        self.start_download(info, stream).await
    }

    /// Fetch a URL with default request settings
    #[cfg(feature = "http")]
    pub async fn download_url(&self, url: &str) -> Result<DownloadId> {
        self.download(DownloadRequest::parse(url)?).await
    }

    pub async fn cancel(&self, id: DownloadId) -> Result<bool> {
        self.with_manager(move |m| m.cancel_download(id)).await
    }

    pub async fn pause(&self, id: DownloadId) -> Result<bool> {
        self.with_manager(move |m| m.pause_download(id, true)).await
    }

    pub async fn resume(&self, id: DownloadId) -> Result<bool> {
        self.with_manager(move |m| m.pause_download(id, false)).await
    }

    /// Remove a download, cancelling it first if needed
    pub async fn remove(&self, id: DownloadId) -> Result<bool> {
        self.with_manager(move |m| m.remove_item(id)).await
    }

    /// Delete the download's file and remove it
    pub async fn discard(&self, id: DownloadId) -> Result<bool> {
        self.with_manager(move |m| m.delete_download(id, DeleteReason::UserDiscard))
            .await
    }

    /// Accept a download flagged as dangerous
    pub async fn validate_dangerous(&self, id: DownloadId) -> Result<bool> {
        self.with_manager(move |m| m.dangerous_download_validated(id))
            .await
    }

    pub async fn open(&self, id: DownloadId) -> Result<bool> {
        self.with_manager(move |m| m.open_download(id)).await
    }

    pub async fn show_in_folder(&self, id: DownloadId) -> Result<bool> {
        self.with_manager(move |m| m.show_download_in_shell(id)).await
    }

    /// Remove finished downloads started in `[begin, end)`
    pub async fn remove_between(
        &self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        self.with_manager(move |m| m.remove_downloads_between(begin, end))
            .await
    }

    pub async fn remove_all(&self) -> Result<usize> {
        self.with_manager(DownloadManager::remove_all_downloads).await
    }

    /// Notice completed downloads whose files were deleted behind our back
    pub async fn check_for_removed_files(&self) -> Result<()> {
        self.with_manager(|m| m.check_for_history_files_removal())
            .await
    }

    /// Get the status of a download
    pub async fn status(&self, id: DownloadId) -> Result<Option<DownloadSnapshot>> {
        self.with_manager(move |m| m.get_download(id).map(|item| item.snapshot()))
            .await
    }

    /// List user-visible downloads
    pub async fn list(&self) -> Result<Vec<DownloadSnapshot>> {
        self.with_manager(|m| snapshots(m.get_all_downloads(None)))
            .await
    }

    /// Downloads still in progress or awaiting confirmation
    pub async fn current(&self) -> Result<Vec<DownloadSnapshot>> {
        self.with_manager(|m| snapshots(m.get_current_downloads(None)))
            .await
    }

    pub async fn search(&self, query: &str) -> Result<Vec<DownloadSnapshot>> {
        let query = query.to_string();
        self.with_manager(move |m| snapshots(m.search_downloads(&query)))
            .await
    }

    /// Wait until a download reaches a terminal state
    pub async fn wait_for(&self, id: DownloadId) -> Result<DownloadSnapshot> {
        // Subscribe first so no transition slips between check and wait
        let mut events = self.subscribe();
        loop {
            match self.status(id).await? {
                Some(snapshot) if snapshot.state.is_terminal() => return Ok(snapshot),
                Some(_) => {}
                None => return Err(EngineError::NotFound(id.to_string())),
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Err(EngineError::Shutdown),
            }
        }
    }

    pub async fn add_observer(&self, observer: Arc<dyn DownloadManagerObserver>) -> Result<()> {
        self.with_manager(move |m| m.add_observer(observer)).await
    }

    pub async fn add_download_observer(
        &self,
        id: DownloadId,
        observer: Arc<dyn DownloadItemObserver>,
    ) -> Result<bool> {
        self.with_manager(move |m| m.add_download_observer(id, observer))
            .await
    }

    /// Subscribe to download events
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Graceful shutdown. In-progress downloads are cancelled and recorded
    /// in history; the call returns once history writes are done.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await.is_err() {
                tracing::warn!("Download engine did not stop within {:?}", SHUTDOWN_TIMEOUT);
            }
        }
        Ok(())
    }
}

impl Drop for DownloadEngine {
    fn drop(&mut self) {
        // Signal shutdown on drop
        self.shutdown.cancel();
    }
}

fn snapshots(items: Vec<&crate::item::DownloadItem>) -> Vec<DownloadSnapshot> {
    items.into_iter().map(|item| item.snapshot()).collect()
}

#[cfg(feature = "storage")]
async fn open_history(config: &ManagerConfig) -> Option<Arc<dyn DownloadHistory>> {
    if config.off_the_record {
        return None;
    }
    let db_path = config.database_path.as_ref()?;
    match SqliteHistory::new(db_path).await {
        Ok(history) => Some(Arc::new(history)),
        Err(e) => {
            tracing::warn!(
                "Failed to open download history: {}. Downloads will not be persisted.",
                e
            );
            None
        }
    }
}

#[cfg(not(feature = "storage"))]
async fn open_history(_config: &ManagerConfig) -> Option<Arc<dyn DownloadHistory>> {
    None
}

async fn run(
    mut manager: DownloadManager,
    mut commands: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
) {
    // Commands queue up until persisted downloads are in place
    manager.run_until(DownloadManager::is_history_loaded).await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => command(&mut manager),
                None => break,
            },
            alive = manager.pump() => {
                if !alive {
                    break;
                }
            }
        }
    }

    manager.shutdown();
    manager.history_barrier().await;
    tracing::debug!("Download engine stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryHistory;
    use crate::protocol::{DownloadState, PersistentStoreInfo, StoreHandle};
    use crate::stream;
    use tempfile::tempdir;
    use url::Url;

    async fn engine_in(dir: &std::path::Path, history: Arc<MemoryHistory>) -> Arc<DownloadEngine> {
        let config = ManagerConfig::new()
            .download_dir(dir)
            .progress_interval(Duration::ZERO);
        DownloadEngine::with_hooks(
            config,
            EngineHooks {
                history: Some(history),
                ..Default::default()
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn streamed_download_completes() {
        let dir = tempdir().unwrap();
        let engine = engine_in(dir.path(), Arc::new(MemoryHistory::new())).await;

        let info = DownloadCreateInfo::new(Url::parse("https://example.com/a.txt").unwrap());
        let id = engine
            .start_download(info, stream::from_chunks(["abc"]))
            .await
            .unwrap();
        let snapshot = engine.wait_for(id).await.unwrap();

        assert_eq!(snapshot.state, DownloadState::Complete);
        assert_eq!(snapshot.target_path, dir.path().join("a.txt"));
        assert_eq!(engine.list().await.unwrap().len(), 1);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn history_is_visible_right_after_start() {
        let dir = tempdir().unwrap();
        let history = Arc::new(MemoryHistory::new());
        history
            .add_entry(&PersistentStoreInfo {
                path: dir.path().join("old.txt"),
                url: Url::parse("https://example.com/old.txt").unwrap(),
                referrer_url: None,
                start_time: Utc::now(),
                end_time: Some(Utc::now()),
                received_bytes: 3,
                total_bytes: 3,
                state: DownloadState::Complete,
                db_handle: StoreHandle::UNINITIALIZED,
                opened: false,
            })
            .await
            .unwrap();

        let engine = engine_in(dir.path(), history).await;
        let listed = engine.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].display_name(), "old.txt");
    }

    #[tokio::test]
    async fn calls_after_shutdown_fail() {
        let dir = tempdir().unwrap();
        let engine = engine_in(dir.path(), Arc::new(MemoryHistory::new())).await;
        engine.shutdown().await.unwrap();

        assert!(matches!(engine.list().await, Err(EngineError::Shutdown)));
        let info = DownloadCreateInfo::new(Url::parse("https://example.com/b.txt").unwrap());
        assert!(engine
            .start_download(info, stream::from_chunks(["b"]))
            .await
            .is_err());
    }
}
