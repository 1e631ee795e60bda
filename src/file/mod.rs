//! File I/O side of the pipeline
//!
//! A single worker task owns every live [`DownloadFile`] and processes
//! commands strictly in the order they were sent. Each download's byte
//! stream is pumped by its own reader task, which queues writes on the
//! same channel, so writes, renames and cancels for one download can
//! never overtake each other. Results travel back through the
//! per-download [`FileEventSink`].

mod download_file;

pub use download_file::{speed_from, DownloadFile};

use crate::config::ManagerConfig;
use crate::protocol::{DownloadId, InterruptReason};
use crate::stream::ByteStream;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

/// Result reported by the file worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    /// The temporary file exists
    Created { id: DownloadId, path: PathBuf },
    /// Throttled progress report
    Progress {
        id: DownloadId,
        bytes_so_far: u64,
        bytes_per_sec: i64,
        hash_state: String,
    },
    /// The stream ended and the file is closed
    ResponseCompleted {
        id: DownloadId,
        bytes_so_far: u64,
        /// Hex SHA-256, empty when hashing is off
        hash: String,
    },
    /// In-progress rename done
    Renamed { id: DownloadId, path: PathBuf },
    /// Final rename done
    RenamedToFinalName {
        id: DownloadId,
        path: PathBuf,
        uniquifier: u32,
    },
    /// The file or the stream failed
    Error {
        id: DownloadId,
        bytes_so_far: u64,
        reason: InterruptReason,
    },
}

impl FileEvent {
    pub fn id(&self) -> DownloadId {
        match self {
            Self::Created { id, .. }
            | Self::Progress { id, .. }
            | Self::ResponseCompleted { id, .. }
            | Self::Renamed { id, .. }
            | Self::RenamedToFinalName { id, .. }
            | Self::Error { id, .. } => *id,
        }
    }
}

/// Where a download's file events are delivered
pub type FileEventSink = Arc<dyn Fn(FileEvent) + Send + Sync>;

/// Everything needed to start writing a download
pub struct CreateFileRequest {
    pub id: DownloadId,
    /// Directory for the temporary file
    pub dir: PathBuf,
    pub calculate_hash: bool,
    pub url: Url,
    pub referrer: Option<Url>,
    pub stream: ByteStream,
    pub sink: FileEventSink,
}

/// Tunables for the worker
#[derive(Debug, Clone)]
pub struct FileManagerConfig {
    pub intermediate_suffix: String,
    pub progress_interval: Duration,
    pub max_buffered_chunks: usize,
}

impl From<&ManagerConfig> for FileManagerConfig {
    fn from(config: &ManagerConfig) -> Self {
        Self {
            intermediate_suffix: config.intermediate_suffix.clone(),
            progress_interval: config.progress_interval_duration(),
            max_buffered_chunks: config.max_buffered_chunks,
        }
    }
}

impl Default for FileManagerConfig {
    fn default() -> Self {
        Self::from(&ManagerConfig::default())
    }
}

enum FileCommand {
    Create(Box<CreateFileRequest>),
    Data {
        id: DownloadId,
        chunk: Bytes,
        _permit: OwnedSemaphorePermit,
    },
    StreamEnded {
        id: DownloadId,
        result: std::result::Result<(), InterruptReason>,
    },
    Rename {
        id: DownloadId,
        path: PathBuf,
    },
    RenameCompleting {
        id: DownloadId,
        path: PathBuf,
        uniquifier: u32,
        overwrite: bool,
    },
    Complete {
        id: DownloadId,
    },
    Cancel {
        id: DownloadId,
    },
    Pause {
        id: DownloadId,
        paused: bool,
    },
    DeleteFile {
        path: PathBuf,
    },
    ManagerShutdown {
        domain: Uuid,
    },
    Barrier {
        done: oneshot::Sender<()>,
    },
}

/// Handle for posting work to the file worker
#[derive(Clone)]
pub struct DownloadFileManager {
    tx: mpsc::UnboundedSender<FileCommand>,
}

impl std::fmt::Debug for DownloadFileManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadFileManager")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl DownloadFileManager {
    /// Start the worker task. Must be called inside a Tokio runtime.
    pub fn spawn(config: FileManagerConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = FileWorker {
            files: HashMap::new(),
            rx,
            tx: tx.downgrade(),
            config,
        };
        tokio::spawn(worker.run());
        Self { tx }
    }

    fn post(&self, command: FileCommand) {
        if self.tx.send(command).is_err() {
            tracing::warn!("File worker is gone, dropping command");
        }
    }

    /// Create the temporary file and start consuming the stream
    pub fn create_download_file(&self, request: CreateFileRequest) {
        self.post(FileCommand::Create(Box::new(request)));
    }

    /// Move an in-progress file to its intermediate name
    pub fn rename_in_progress_download_file(&self, id: DownloadId, path: PathBuf) {
        self.post(FileCommand::Rename { id, path });
    }

    /// Move a finished file to its final name. Without `overwrite` an
    /// existing file at `path` is kept and the download fails instead.
    /// `uniquifier` is echoed back in the rename result.
    pub fn rename_completing_download_file(
        &self,
        id: DownloadId,
        path: PathBuf,
        uniquifier: u32,
        overwrite: bool,
    ) {
        self.post(FileCommand::RenameCompleting {
            id,
            path,
            uniquifier,
            overwrite,
        });
    }

    /// Annotate and release the finished file
    pub fn complete_download(&self, id: DownloadId) {
        self.post(FileCommand::Complete { id });
    }

    /// Stop the stream and delete the partial file
    pub fn cancel_download(&self, id: DownloadId) {
        self.post(FileCommand::Cancel { id });
    }

    /// Stop or resume reading from the stream
    pub fn pause_download(&self, id: DownloadId, paused: bool) {
        self.post(FileCommand::Pause { id, paused });
    }

    /// Delete a file no longer owned by any download. Directories are left
    /// alone.
    pub fn delete_file(&self, path: PathBuf) {
        self.post(FileCommand::DeleteFile { path });
    }

    /// Cancel every file belonging to the manager with this domain
    pub fn on_download_manager_shutdown(&self, domain: Uuid) {
        self.post(FileCommand::ManagerShutdown { domain });
    }

    /// Wait until everything posted so far has been processed
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        self.post(FileCommand::Barrier { done });
        let _ = wait.await;
    }
}

struct ActiveFile {
    file: DownloadFile,
    sink: FileEventSink,
    url: Url,
    referrer: Option<Url>,
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
    last_progress: Instant,
}

impl ActiveFile {
    fn report(&self, event: FileEvent) {
        (self.sink)(event);
    }
}

struct FileWorker {
    files: HashMap<DownloadId, ActiveFile>,
    rx: mpsc::UnboundedReceiver<FileCommand>,
    tx: mpsc::WeakUnboundedSender<FileCommand>,
    config: FileManagerConfig,
}

impl FileWorker {
    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            self.handle(command).await;
        }
        // Every handle is gone; nobody can finish these
        for (_, mut active) in self.files.drain() {
            active.cancel.cancel();
            active.file.cancel().await;
        }
        tracing::debug!("File worker stopped");
    }

    async fn handle(&mut self, command: FileCommand) {
        match command {
            FileCommand::Create(request) => self.create(*request).await,
            FileCommand::Data { id, chunk, .. } => self.write(id, &chunk).await,
            FileCommand::StreamEnded { id, result } => self.stream_ended(id, result).await,
            FileCommand::Rename { id, path } => self.rename(id, &path).await,
            FileCommand::RenameCompleting {
                id,
                path,
                uniquifier,
                overwrite,
            } => self.rename_completing(id, path, uniquifier, overwrite).await,
            FileCommand::Complete { id } => self.complete(id).await,
            FileCommand::Cancel { id } => self.cancel(id).await,
            FileCommand::Pause { id, paused } => {
                if let Some(active) = self.files.get(&id) {
                    active.pause.send_replace(paused);
                }
            }
            FileCommand::DeleteFile { path } => delete_file(&path).await,
            FileCommand::ManagerShutdown { domain } => {
                let ids: Vec<_> = self
                    .files
                    .keys()
                    .filter(|id| id.domain() == domain)
                    .copied()
                    .collect();
                tracing::debug!("Manager shutdown: cancelling {} files", ids.len());
                for id in ids {
                    self.cancel(id).await;
                }
            }
            FileCommand::Barrier { done } => {
                let _ = done.send(());
            }
        }
    }

    async fn create(&mut self, request: CreateFileRequest) {
        let CreateFileRequest {
            id,
            dir,
            calculate_hash,
            url,
            referrer,
            stream,
            sink,
        } = request;

        if self.files.contains_key(&id) {
            tracing::warn!("Download {} already has a file", id);
            return;
        }

        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            tracing::warn!("Failed to create {:?}: {}", dir, e);
        }

        let mut file = DownloadFile::new(id, PathBuf::new(), calculate_hash);
        if let Err(e) = file
            .initialize_unconfirmed(&dir, &self.config.intermediate_suffix)
            .await
        {
            tracing::warn!("Download {} could not create its file: {}", id, e);
            sink(FileEvent::Error {
                id,
                bytes_so_far: 0,
                reason: e.interrupt_reason(),
            });
            return;
        }
        sink(FileEvent::Created {
            id,
            path: file.full_path().to_path_buf(),
        });

        let cancel = CancellationToken::new();
        let (pause, pause_rx) = watch::channel(false);
        if let Some(tx) = self.tx.upgrade() {
            let permits = Arc::new(Semaphore::new(self.config.max_buffered_chunks));
            tokio::spawn(pump(id, stream, tx, cancel.clone(), pause_rx, permits));
        }

        self.files.insert(
            id,
            ActiveFile {
                file,
                sink,
                url,
                referrer,
                cancel,
                pause,
                last_progress: Instant::now(),
            },
        );
    }

    async fn write(&mut self, id: DownloadId, chunk: &[u8]) {
        let Some(active) = self.files.get_mut(&id) else {
            // Cancelled with data still queued
            return;
        };
        if let Err(e) = active.file.append_data(chunk).await {
            tracing::warn!("Download {} write failed: {}", id, e);
            let reason = e.interrupt_reason();
            self.fail(id, reason).await;
            return;
        }
        if active.last_progress.elapsed() >= self.config.progress_interval {
            active.last_progress = Instant::now();
            active.report(FileEvent::Progress {
                id,
                bytes_so_far: active.file.bytes_so_far(),
                bytes_per_sec: active.file.current_speed(),
                hash_state: active.file.hash_state(),
            });
        }
    }

    async fn stream_ended(
        &mut self,
        id: DownloadId,
        result: std::result::Result<(), InterruptReason>,
    ) {
        let Some(active) = self.files.get_mut(&id) else {
            return;
        };
        let bytes_so_far = active.file.bytes_so_far();
        match result {
            Ok(()) => match active.file.finish().await {
                Ok(()) => {
                    let hash = active.file.hash().unwrap_or_default().to_string();
                    tracing::debug!("Download {} received all {} bytes", id, bytes_so_far);
                    active.report(FileEvent::ResponseCompleted {
                        id,
                        bytes_so_far,
                        hash,
                    });
                }
                Err(e) => {
                    let reason = e.interrupt_reason();
                    self.fail(id, reason).await;
                }
            },
            // The owner decides what happens to the partial file
            Err(reason) => {
                tracing::debug!("Download {} stream failed: {}", id, reason);
                active.report(FileEvent::Error {
                    id,
                    bytes_so_far,
                    reason,
                });
            }
        }
    }

    async fn rename(&mut self, id: DownloadId, path: &Path) {
        let Some(active) = self.files.get_mut(&id) else {
            return;
        };
        match active.file.rename(path, true).await {
            Ok(path) => active.report(FileEvent::Renamed { id, path }),
            Err(e) => {
                tracing::warn!("Download {} rename failed: {}", id, e);
                let reason = e.interrupt_reason();
                self.fail(id, reason).await;
            }
        }
    }

    async fn rename_completing(
        &mut self,
        id: DownloadId,
        target: PathBuf,
        uniquifier: u32,
        overwrite: bool,
    ) {
        let Some(active) = self.files.get_mut(&id) else {
            return;
        };

        match active.file.rename(&target, overwrite).await {
            Ok(path) => active.report(FileEvent::RenamedToFinalName {
                id,
                path,
                uniquifier,
            }),
            Err(e) => {
                tracing::warn!("Download {} final rename failed: {}", id, e);
                let reason = e.interrupt_reason();
                self.fail(id, reason).await;
            }
        }
    }

    async fn complete(&mut self, id: DownloadId) {
        let Some(mut active) = self.files.remove(&id) else {
            return;
        };
        active.cancel.cancel();
        // Provenance must be on the file before anyone else sees it
        if let Err(e) = active
            .file
            .annotate_with_source_information(&active.url, active.referrer.as_ref())
            .await
        {
            tracing::warn!("Download {} could not record its source: {}", id, e);
        }
        active.file.detach();
        tracing::debug!("Download {} released {:?}", id, active.file.full_path());
    }

    async fn cancel(&mut self, id: DownloadId) {
        let Some(mut active) = self.files.remove(&id) else {
            return;
        };
        active.cancel.cancel();
        active.file.cancel().await;
    }

    async fn fail(&mut self, id: DownloadId, reason: InterruptReason) {
        let Some(mut active) = self.files.remove(&id) else {
            return;
        };
        active.cancel.cancel();
        let bytes_so_far = active.file.bytes_so_far();
        active.file.cancel().await;
        active.report(FileEvent::Error {
            id,
            bytes_so_far,
            reason,
        });
    }
}

async fn delete_file(path: &Path) {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => {
            tracing::warn!("Refusing to delete directory {:?}", path);
        }
        Ok(_) => {
            if let Err(e) = tokio::fs::remove_file(path).await {
                tracing::warn!("Failed to delete {:?}: {}", path, e);
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to inspect {:?}: {}", path, e),
    }
}

async fn pump(
    id: DownloadId,
    mut stream: ByteStream,
    tx: mpsc::UnboundedSender<FileCommand>,
    cancel: CancellationToken,
    mut pause: watch::Receiver<bool>,
    permits: Arc<Semaphore>,
) {
    let result = loop {
        if *pause.borrow_and_update() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = pause.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
            }
        }

        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            changed = pause.changed() => {
                if changed.is_err() {
                    return;
                }
                continue;
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                if chunk.is_empty() {
                    continue;
                }
                let permit = tokio::select! {
                    _ = cancel.cancelled() => return,
                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                };
                let command = FileCommand::Data {
                    id,
                    chunk,
                    _permit: permit,
                };
                if tx.send(command).is_err() {
                    return;
                }
            }
            Some(Err(reason)) => break Err(reason),
            None => break Ok(()),
        }
    };
    let _ = tx.send(FileCommand::StreamEnded { id, result });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    type Events = Arc<Mutex<Vec<FileEvent>>>;

    fn recorder() -> (FileEventSink, Events, mpsc::UnboundedReceiver<()>) {
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let (notify, rx) = mpsc::unbounded_channel();
        let recorded = events.clone();
        let sink: FileEventSink = Arc::new(move |event| {
            recorded.lock().push(event);
            let _ = notify.send(());
        });
        (sink, events, rx)
    }

    async fn wait_for<F>(events: &Events, rx: &mut mpsc::UnboundedReceiver<()>, pred: F) -> FileEvent
    where
        F: Fn(&FileEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(found) = events.lock().iter().find(|e| pred(e)).cloned() {
                    return found;
                }
                rx.recv().await;
            }
        })
        .await
        .expect("timed out waiting for file event")
    }

    fn request(
        id: DownloadId,
        dir: &Path,
        stream: ByteStream,
        sink: FileEventSink,
    ) -> CreateFileRequest {
        CreateFileRequest {
            id,
            dir: dir.to_path_buf(),
            calculate_hash: true,
            url: Url::parse("http://example.com/file.bin").unwrap(),
            referrer: None,
            stream,
            sink,
        }
    }

    #[tokio::test]
    async fn writes_whole_stream_then_renames() {
        let dir = tempdir().unwrap();
        let fm = DownloadFileManager::spawn(FileManagerConfig::default());
        let (sink, events, mut rx) = recorder();
        let id = DownloadId::new(Uuid::new_v4(), 1);

        fm.create_download_file(request(
            id,
            dir.path(),
            stream::from_chunks(vec![vec![1u8; 400], vec![2u8; 600]]),
            sink,
        ));

        let done = wait_for(&events, &mut rx, |e| matches!(e, FileEvent::ResponseCompleted { .. })).await;
        match done {
            FileEvent::ResponseCompleted { bytes_so_far, hash, .. } => {
                assert_eq!(bytes_so_far, 1000);
                assert_eq!(hash.len(), 64);
            }
            _ => unreachable!(),
        }

        let target = dir.path().join("file.bin");
        fm.rename_completing_download_file(id, target.clone(), 0, false);
        wait_for(&events, &mut rx, |e| matches!(e, FileEvent::RenamedToFinalName { .. })).await;
        fm.complete_download(id);
        fm.flush().await;

        let data = std::fs::read(&target).unwrap();
        assert_eq!(data.len(), 1000);
        assert!(data[..400].iter().all(|b| *b == 1));
        assert!(data[400..].iter().all(|b| *b == 2));
    }

    #[tokio::test]
    async fn final_rename_without_overwrite_keeps_existing_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("x.txt"), b"existing").unwrap();
        let fm = DownloadFileManager::spawn(FileManagerConfig::default());
        let (sink, events, mut rx) = recorder();
        let id = DownloadId::new(Uuid::new_v4(), 1);

        fm.create_download_file(request(id, dir.path(), stream::from_chunks(vec![b"new".to_vec()]), sink));
        wait_for(&events, &mut rx, |e| matches!(e, FileEvent::ResponseCompleted { .. })).await;
        fm.rename_completing_download_file(id, dir.path().join("x.txt"), 0, false);

        let failed = wait_for(&events, &mut rx, |e| matches!(e, FileEvent::Error { .. })).await;
        assert_eq!(failed.id(), id);
        assert_eq!(std::fs::read(dir.path().join("x.txt")).unwrap(), b"existing");
    }

    #[tokio::test]
    async fn final_rename_reports_chosen_uniquifier() {
        let dir = tempdir().unwrap();
        let fm = DownloadFileManager::spawn(FileManagerConfig::default());
        let (sink, events, mut rx) = recorder();
        let id = DownloadId::new(Uuid::new_v4(), 1);

        fm.create_download_file(request(id, dir.path(), stream::from_chunks(vec![b"new".to_vec()]), sink));
        wait_for(&events, &mut rx, |e| matches!(e, FileEvent::ResponseCompleted { .. })).await;
        fm.rename_completing_download_file(id, dir.path().join("x (2).txt"), 2, false);

        let renamed = wait_for(&events, &mut rx, |e| matches!(e, FileEvent::RenamedToFinalName { .. })).await;
        assert_eq!(
            renamed,
            FileEvent::RenamedToFinalName {
                id,
                path: dir.path().join("x (2).txt"),
                uniquifier: 2
            }
        );
        assert_eq!(std::fs::read(dir.path().join("x (2).txt")).unwrap(), b"new");
    }

    #[tokio::test]
    async fn cancel_after_rename_deletes_renamed_file() {
        let dir = tempdir().unwrap();
        let fm = DownloadFileManager::spawn(FileManagerConfig::default());
        let (sink, events, _rx) = recorder();
        let id = DownloadId::new(Uuid::new_v4(), 1);
        let (tx, s) = stream::channel(4);

        fm.create_download_file(request(id, dir.path(), s, sink));
        assert!(tx.send(vec![0u8; 10]).await);
        let intermediate = dir.path().join("f.bin.crdownload");
        fm.rename_in_progress_download_file(id, intermediate.clone());
        fm.cancel_download(id);
        fm.cancel_download(id);
        fm.flush().await;

        assert!(!intermediate.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(events.lock().iter().all(|e| !matches!(e, FileEvent::Error { .. })));

        // The reader stopped pulling from the network
        tokio::time::timeout(Duration::from_secs(5), async {
            while !tx.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn stream_error_is_reported_and_file_kept_until_cancel() {
        let dir = tempdir().unwrap();
        let fm = DownloadFileManager::spawn(FileManagerConfig::default());
        let (sink, events, mut rx) = recorder();
        let id = DownloadId::new(Uuid::new_v4(), 1);
        let (tx, s) = stream::channel(4);

        fm.create_download_file(request(id, dir.path(), s, sink));
        tx.send(vec![7u8; 300]).await;
        tx.fail(InterruptReason::NetworkDisconnected).await;

        let err = wait_for(&events, &mut rx, |e| matches!(e, FileEvent::Error { .. })).await;
        assert_eq!(
            err,
            FileEvent::Error {
                id,
                bytes_so_far: 300,
                reason: InterruptReason::NetworkDisconnected
            }
        );
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        fm.cancel_download(id);
        fm.flush().await;
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn manager_shutdown_only_touches_its_own_files() {
        let dir = tempdir().unwrap();
        let fm = DownloadFileManager::spawn(FileManagerConfig::default());
        let (sink, events, mut rx) = recorder();
        let mine = DownloadId::new(Uuid::new_v4(), 1);
        let theirs = DownloadId::new(Uuid::new_v4(), 1);
        let (_tx_a, a) = stream::channel(1);
        let (_tx_b, b) = stream::channel(1);

        fm.create_download_file(request(mine, dir.path(), a, sink.clone()));
        fm.create_download_file(request(theirs, dir.path(), b, sink));
        wait_for(&events, &mut rx, |e| matches!(e, FileEvent::Created { id, .. } if *id == theirs)).await;

        fm.on_download_manager_shutdown(mine.domain());
        fm.flush().await;

        let remaining: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(remaining.len(), 1);
        let created_theirs = events
            .lock()
            .iter()
            .find_map(|e| match e {
                FileEvent::Created { id, path } if *id == theirs => Some(path.clone()),
                _ => None,
            })
            .unwrap();
        assert!(created_theirs.exists());
    }

    #[tokio::test]
    async fn paused_downloads_stop_reading() {
        let dir = tempdir().unwrap();
        let config = FileManagerConfig {
            progress_interval: Duration::ZERO,
            ..FileManagerConfig::default()
        };
        let fm = DownloadFileManager::spawn(config);
        let (sink, events, mut rx) = recorder();
        let id = DownloadId::new(Uuid::new_v4(), 1);
        let (tx, s) = stream::channel(1);

        fm.create_download_file(request(id, dir.path(), s, sink));
        wait_for(&events, &mut rx, |e| matches!(e, FileEvent::Created { .. })).await;
        fm.pause_download(id, true);
        fm.flush().await;

        // With the reader paused the one-slot channel fills up
        let mut blocked = false;
        for _ in 0..3 {
            let send = tokio::time::timeout(Duration::from_millis(200), tx.send(vec![1u8; 8]));
            if send.await.is_err() {
                blocked = true;
                break;
            }
        }
        assert!(blocked);

        fm.pause_download(id, false);
        let progressed = wait_for(&events, &mut rx, |e| {
            matches!(e, FileEvent::Progress { bytes_so_far, .. } if *bytes_so_far >= 8)
        })
        .await;
        assert_eq!(progressed.id(), id);
    }

    #[tokio::test]
    async fn delete_file_skips_directories() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();

        let fm = DownloadFileManager::spawn(FileManagerConfig::default());
        fm.delete_file(sub.clone());
        fm.delete_file(file.clone());
        fm.flush().await;
        assert!(sub.is_dir());
        assert!(!file.exists());
    }
}
