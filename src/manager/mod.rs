//! Download manager
//!
//! The manager owns every [`DownloadItem`] of one browsing session and is
//! the only code that mutates them. It lives on the control context: a
//! plain `&mut self` object driven by [`DownloadManager::pump`]. Work that
//! may block (file I/O, history writes, reservation probes, danger checks,
//! save prompts) runs elsewhere and reports back as a [`ControlMessage`].
//!
//! Bookkeeping, by download id:
//! - `items`: the owning set
//! - `active`: not yet complete, or terminal but still waiting for its
//!   history handle
//! - `in_progress`: target determined, completion not yet started
//! - `history_downloads`: by store handle, every download that has one
//!
//! Every id in the derived maps is also in `items`.

mod completion;
mod messages;
mod target;

pub use completion::ReadyCallback;
pub use messages::ControlMessage;

use crate::config::ManagerConfig;
use crate::danger::DangerCheckService;
use crate::delegate::{DefaultDelegate, DownloadManagerDelegate};
use crate::error::Result;
use crate::file::{DownloadFileManager, FileEventSink};
use crate::history::{in_range, DownloadHistory, HistoryClient};
use crate::item::DownloadItem;
use crate::observer::{DownloadItemObserver, DownloadManagerObserver};
use crate::protocol::{
    DeleteReason, DownloadEvent, DownloadId, DownloadState, PersistentStoreInfo, SafetyState,
    StoreHandle,
};
use crate::reservation::PathReservationTracker;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use target::PendingTarget;

/// Maximum number of events to buffer
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Republishes item notifications on the manager's event channel
struct EventForwarder {
    events: broadcast::Sender<DownloadEvent>,
}

impl DownloadItemObserver for EventForwarder {
    fn on_download_updated(&self, item: &DownloadItem) {
        let _ = self.events.send(DownloadEvent::Updated {
            id: item.id(),
            state: item.state(),
            received_bytes: item.received_bytes(),
            total_bytes: item.total_bytes(),
            last_reason: item.last_reason(),
        });
    }

    fn on_download_opened(&self, item: &DownloadItem) {
        let _ = self.events.send(DownloadEvent::Opened { id: item.id() });
    }

    fn on_download_destroyed(&self, item: &DownloadItem) {
        let _ = self.events.send(DownloadEvent::Removed { id: item.id() });
    }
}

/// Owner and coordinator of all downloads in a session
pub struct DownloadManager {
    domain: Uuid,
    next_local: u32,
    next_fake_handle: i64,
    config: ManagerConfig,

    items: HashMap<DownloadId, DownloadItem>,
    active: HashSet<DownloadId>,
    in_progress: HashSet<DownloadId>,
    history_downloads: HashMap<StoreHandle, DownloadId>,
    pending_targets: HashMap<DownloadId, PendingTarget>,
    ready_waiters: HashMap<DownloadId, ReadyCallback>,
    last_download_path: Option<PathBuf>,
    history_loaded: bool,

    reservations: PathReservationTracker,
    file_manager: DownloadFileManager,
    delegate: Arc<dyn DownloadManagerDelegate>,
    history: Option<HistoryClient>,
    danger_service: Option<Arc<dyn DangerCheckService>>,

    observers: Vec<Arc<dyn DownloadManagerObserver>>,
    events: broadcast::Sender<DownloadEvent>,
    forwarder: Arc<dyn DownloadItemObserver>,

    tx: mpsc::UnboundedSender<ControlMessage>,
    rx: mpsc::UnboundedReceiver<ControlMessage>,
    shut_down: bool,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("domain", &self.domain)
            .field("downloads", &self.items.len())
            .field("active", &self.active.len())
            .field("in_progress", &self.in_progress.len())
            .field("shut_down", &self.shut_down)
            .finish()
    }
}

impl DownloadManager {
    /// Create a manager writing through `file_manager`. Must be called
    /// inside a Tokio runtime.
    pub fn new(config: ManagerConfig, file_manager: DownloadFileManager) -> Result<Self> {
        config.validate()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let forwarder: Arc<dyn DownloadItemObserver> = Arc::new(EventForwarder {
            events: events.clone(),
        });
        let reservations = PathReservationTracker::new(
            config.max_unique_files,
            config.intermediate_suffix.clone(),
        );

        Ok(Self {
            domain: Uuid::new_v4(),
            next_local: 0,
            next_fake_handle: -1,
            config,
            items: HashMap::new(),
            active: HashSet::new(),
            in_progress: HashSet::new(),
            history_downloads: HashMap::new(),
            pending_targets: HashMap::new(),
            ready_waiters: HashMap::new(),
            last_download_path: None,
            history_loaded: false,
            reservations,
            file_manager,
            delegate: Arc::new(DefaultDelegate),
            history: None,
            danger_service: None,
            observers: Vec::new(),
            events,
            forwarder,
            tx,
            rx,
            shut_down: false,
        })
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn DownloadManagerDelegate>) -> Self {
        self.delegate = delegate;
        self
    }

    /// Persist downloads in `store`. Off-the-record managers never write
    /// to it.
    pub fn with_history(mut self, store: Arc<dyn DownloadHistory>) -> Self {
        self.history = Some(HistoryClient::spawn(store, self.tx.clone()));
        self
    }

    pub fn with_danger_service(mut self, service: Arc<dyn DangerCheckService>) -> Self {
        self.danger_service = Some(service);
        self
    }

    /// Start loading persisted downloads. They show up once the reply has
    /// been pumped; see [`is_history_loaded`](Self::is_history_loaded).
    pub fn init(&mut self) {
        match &self.history {
            Some(history) if !self.config.off_the_record => history.query_all(),
            _ => self.history_loaded = true,
        }
    }

    pub fn domain(&self) -> Uuid {
        self.domain
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn is_history_loaded(&self) -> bool {
        self.history_loaded
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    fn next_id(&mut self) -> DownloadId {
        self.next_local += 1;
        DownloadId::new(self.domain, self.next_local)
    }

    // Fake handles count down from -1 so they can't collide with real ones
    fn next_fake_handle(&mut self) -> StoreHandle {
        let handle = StoreHandle::new(self.next_fake_handle);
        self.next_fake_handle -= 1;
        handle
    }

    fn file_sink(&self) -> FileEventSink {
        let tx = self.tx.clone();
        Arc::new(move |event| {
            let _ = tx.send(ControlMessage::File(event));
        })
    }

    fn writes_history(&self) -> Option<&HistoryClient> {
        if self.config.off_the_record {
            None
        } else {
            self.history.as_ref()
        }
    }

    fn persist(&self, id: DownloadId) {
        if let (Some(history), Some(item)) = (&self.history, self.items.get(&id)) {
            history.update_entry(item.persistent_store_info());
        }
    }

    fn sync_reservation(&mut self, id: DownloadId) {
        if let Some(item) = self.items.get(&id) {
            self.reservations.on_download_updated(item);
        }
    }

    // ---- message loop ----

    /// Wait for one message and handle it. Returns false if the channel
    /// closed, which can't happen while the manager exists.
    pub async fn pump(&mut self) -> bool {
        match self.rx.recv().await {
            Some(message) => {
                self.handle_message(message);
                true
            }
            None => false,
        }
    }

    /// Handle every message already queued, without waiting
    pub fn pump_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(message) = self.rx.try_recv() {
            self.handle_message(message);
            handled += 1;
        }
        handled
    }

    /// Pump until `done` holds
    pub async fn run_until<F>(&mut self, mut done: F)
    where
        F: FnMut(&Self) -> bool,
    {
        while !done(self) {
            if !self.pump().await {
                break;
            }
        }
    }

    fn handle_message(&mut self, message: ControlMessage) {
        if self.shut_down {
            tracing::trace!("Dropping {:?} after shutdown", message);
            return;
        }
        match message {
            ControlMessage::File(event) => self.on_file_event(event),
            ControlMessage::TargetInputs {
                id,
                is_dangerous_url,
                visited_referrer_before,
            } => self.on_target_inputs(id, is_dangerous_url, visited_referrer_before),
            ControlMessage::PathReserved { request, outcome } => {
                self.on_path_reserved(request, outcome)
            }
            ControlMessage::FinalPathReserved { request, outcome } => {
                self.on_final_path_reserved(request, outcome)
            }
            ControlMessage::PathChosen { id, path } => self.on_path_chosen(id, path),
            ControlMessage::HistoryEntryCreated { id, handle } => {
                self.on_history_entry_created(id, handle)
            }
            ControlMessage::HistoryLoaded(entries) => self.on_history_loaded(entries),
            ControlMessage::ContentChecked { id, verdict } => self.on_content_checked(id, verdict),
            ControlMessage::FileExistence { id, exists } => {
                if exists {
                    return;
                }
                if let Some(item) = self.items.get_mut(&id) {
                    if item.is_complete() {
                        item.on_downloaded_file_removed();
                    }
                }
            }
        }
    }

    /// Resolves once every history write issued so far has been applied
    pub fn history_barrier(&self) -> impl Future<Output = ()> + Send + 'static {
        let wait = self.history.as_ref().map(HistoryClient::barrier);
        async move {
            if let Some(wait) = wait {
                let _ = wait.await;
            }
        }
    }

    // ---- history ----

    fn on_history_loaded(&mut self, entries: Vec<PersistentStoreInfo>) {
        let mut stale = Vec::new();
        for info in entries {
            if !info.db_handle.is_persisted() || self.history_downloads.contains_key(&info.db_handle)
            {
                tracing::warn!("Skipping history record with handle {}", info.db_handle);
                continue;
            }
            let id = self.next_id();
            let mut item = DownloadItem::from_history(id, &info);
            item.add_observer(self.forwarder.clone());
            if item.state() != info.state {
                stale.push(id);
            }
            self.history_downloads.insert(info.db_handle, id);
            self.items.insert(id, item);
        }
        tracing::debug!("Loaded {} downloads from history", self.history_downloads.len());
        // Records left in progress by a crash are stored as cancelled now
        for id in stale {
            self.persist(id);
        }
        self.history_loaded = true;
        self.notify_model_changed();
    }

    pub(crate) fn on_history_entry_created(&mut self, id: DownloadId, handle: Option<StoreHandle>) {
        let handle = match handle {
            Some(handle) if handle.is_assigned() => handle,
            _ => self.next_fake_handle(),
        };

        let Some(item) = self.items.get_mut(&id) else {
            // Removed while the add was in flight
            if let Some(history) = &self.history {
                history.remove_entry(handle);
            }
            return;
        };
        if item.db_handle().is_assigned() {
            tracing::warn!("Download {} already has handle {}", id, item.db_handle());
            return;
        }
        item.set_db_handle(handle);
        let still_running = item.is_in_progress();
        self.history_downloads.insert(handle, id);
        tracing::debug!("Download {} has store handle {}", id, handle);
        self.notify_model_changed();

        if still_running {
            self.on_completion_input_changed(id);
        } else {
            // Cancelled or interrupted before the handle arrived
            self.in_progress.remove(&id);
            self.active.remove(&id);
            self.persist(id);
            if let Some(item) = self.items.get(&id) {
                item.update_observers();
            }
        }
    }

    // ---- removal ----

    /// Cancel the download if needed and destroy it
    pub fn remove_item(&mut self, id: DownloadId) -> bool {
        let Some(item) = self.items.get(&id) else {
            return false;
        };
        let handle = item.db_handle();
        self.cancel_download(id);
        if self.history_downloads.contains_key(&handle) {
            return self.remove_download(handle);
        }
        self.destroy_item(id);
        self.notify_model_changed();
        true
    }

    /// Remove the download with this store handle and its history record
    pub fn remove_download(&mut self, handle: StoreHandle) -> bool {
        let Some(id) = self.history_downloads.get(&handle).copied() else {
            return false;
        };
        self.cancel_download(id);
        if let Some(history) = &self.history {
            history.remove_entry(handle);
        }
        self.destroy_item(id);
        self.notify_model_changed();
        true
    }

    /// Remove finished downloads started in `[begin, end)`; a missing
    /// bound is open. Returns how many were removed.
    pub fn remove_downloads_between(
        &mut self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> usize {
        if let Some(history) = self.writes_history() {
            history.remove_entries_between(begin, end);
        }

        let doomed: Vec<DownloadId> = self
            .history_downloads
            .values()
            .filter(|id| {
                self.items.get(id).is_some_and(|item| {
                    in_range(item.start_time(), begin, end)
                        && matches!(
                            item.state(),
                            DownloadState::Complete
                                | DownloadState::Cancelled
                                | DownloadState::Interrupted
                        )
                })
            })
            .copied()
            .collect();

        for id in &doomed {
            self.destroy_item(*id);
        }
        if !doomed.is_empty() {
            self.notify_model_changed();
        }
        doomed.len()
    }

    /// Remove finished downloads started at or after `begin`
    pub fn remove_downloads(&mut self, begin: DateTime<Utc>) -> usize {
        self.remove_downloads_between(Some(begin), None)
    }

    pub fn remove_all_downloads(&mut self) -> usize {
        self.remove_downloads_between(None, None)
    }

    /// Delete the download's file from disk, then remove the download
    pub fn delete_download(&mut self, id: DownloadId, reason: DeleteReason) -> bool {
        let Some(item) = self.items.get(&id) else {
            return false;
        };
        tracing::info!("Deleting download {} ({:?})", id, reason);
        let path = item.current_path().to_path_buf();
        if !path.as_os_str().is_empty() {
            self.file_manager.delete_file(path);
        }
        self.remove_item(id)
    }

    fn destroy_item(&mut self, id: DownloadId) {
        self.active.remove(&id);
        self.in_progress.remove(&id);
        self.pending_targets.remove(&id);
        self.ready_waiters.remove(&id);
        self.reservations.on_download_destroyed(id);
        if let Some(mut item) = self.items.remove(&id) {
            if item.db_handle().is_assigned() {
                self.history_downloads.remove(&item.db_handle());
            }
            item.transition_to_removing();
            item.notify_destroyed();
        }
    }

    // ---- user actions ----

    /// Open a completed download, or toggle open-when-complete on a
    /// partial one
    pub fn open_download(&mut self, id: DownloadId) -> bool {
        let Some(item) = self.items.get_mut(&id) else {
            return false;
        };
        if !item.open_download() {
            return false;
        }
        let path = item.current_path().to_path_buf();
        self.persist(id);
        self.delegate.open_item(&path);
        true
    }

    pub fn show_download_in_shell(&self, id: DownloadId) -> bool {
        match self.items.get(&id) {
            Some(item) if !item.current_path().as_os_str().is_empty() => {
                self.delegate.show_item_in_folder(item.current_path());
                true
            }
            _ => false,
        }
    }

    /// Check in the background whether a completed download's file is
    /// still on disk
    pub fn check_for_file_removal(&self, id: DownloadId) {
        let Some(item) = self.items.get(&id) else {
            return;
        };
        if !item.is_complete() || item.file_externally_removed() {
            return;
        }
        let path = item.current_path().to_path_buf();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let exists = tokio::fs::try_exists(&path).await.unwrap_or(true);
            let _ = tx.send(ControlMessage::FileExistence { id, exists });
        });
    }

    /// [`check_for_file_removal`](Self::check_for_file_removal) for every
    /// download in history
    pub fn check_for_history_files_removal(&self) {
        for id in self.history_downloads.values() {
            self.check_for_file_removal(*id);
        }
    }

    // ---- queries ----

    pub fn get_download(&self, id: DownloadId) -> Option<&DownloadItem> {
        self.items.get(&id)
    }

    pub fn get_download_by_handle(&self, handle: StoreHandle) -> Option<&DownloadItem> {
        self.history_downloads
            .get(&handle)
            .and_then(|id| self.items.get(id))
    }

    /// Every download, oldest first
    pub fn downloads(&self) -> Vec<&DownloadItem> {
        sorted(self.items.values())
    }

    fn history_items(&self) -> impl Iterator<Item = &DownloadItem> {
        self.history_downloads
            .values()
            .filter_map(|id| self.items.get(id))
    }

    /// Non-temporary downloads in history, optionally only those in `dir`
    pub fn get_all_downloads(&self, dir: Option<&Path>) -> Vec<&DownloadItem> {
        sorted(
            self.history_items()
                .filter(|item| !item.is_temporary() && in_dir(item, dir)),
        )
    }

    /// Temporary downloads in `dir`
    pub fn get_temporary_downloads(&self, dir: &Path) -> Vec<&DownloadItem> {
        sorted(
            self.history_items()
                .filter(|item| item.is_temporary() && in_dir(item, Some(dir))),
        )
    }

    /// Downloads that still need attention: partial or unconfirmed
    pub fn get_current_downloads(&self, dir: Option<&Path>) -> Vec<&DownloadItem> {
        sorted(self.history_items().filter(|item| {
            !item.is_temporary()
                && (item.is_partial_download() || item.safety_state() == SafetyState::Dangerous)
                && in_dir(item, dir)
        }))
    }

    /// Downloads whose URL or file name contains `query`
    pub fn search_downloads(&self, query: &str) -> Vec<&DownloadItem> {
        sorted(self.history_items().filter(|item| {
            !item.is_temporary()
                && !item.is_extension_install()
                && item.is_otr() == self.config.off_the_record
                && item.matches_query(query)
        }))
    }

    pub fn in_progress_count(&self) -> usize {
        self.in_progress.len()
    }

    pub fn received_download_bytes(&self) -> i64 {
        self.in_progress_items().map(DownloadItem::received_bytes).sum()
    }

    pub fn total_download_bytes(&self) -> i64 {
        self.in_progress_items().map(DownloadItem::total_bytes).sum()
    }

    /// Every in-progress download knows its size
    pub fn is_download_progress_known(&self) -> bool {
        self.in_progress_items().all(|item| item.total_bytes() > 0)
    }

    fn in_progress_items(&self) -> impl Iterator<Item = &DownloadItem> {
        self.in_progress.iter().filter_map(|id| self.items.get(id))
    }

    // ---- observers ----

    /// Register a manager observer; it is told about the current model
    /// right away
    pub fn add_observer(&mut self, observer: Arc<dyn DownloadManagerObserver>) {
        observer.model_changed();
        self.observers.push(observer);
    }

    pub fn remove_observer(&mut self, observer: &Arc<dyn DownloadManagerObserver>) {
        self.observers.retain(|o| !Arc::ptr_eq(o, observer));
    }

    pub fn add_download_observer(
        &mut self,
        id: DownloadId,
        observer: Arc<dyn DownloadItemObserver>,
    ) -> bool {
        match self.items.get_mut(&id) {
            Some(item) => {
                item.add_observer(observer);
                true
            }
            None => false,
        }
    }

    pub fn remove_download_observer(
        &mut self,
        id: DownloadId,
        observer: &Arc<dyn DownloadItemObserver>,
    ) {
        if let Some(item) = self.items.get_mut(&id) {
            item.remove_observer(observer);
        }
    }

    /// Events for every download of this manager
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<DownloadEvent> {
        self.events.clone()
    }

    fn notify_model_changed(&self) {
        for observer in &self.observers {
            observer.model_changed();
        }
        let _ = self.events.send(DownloadEvent::ModelChanged);
    }

    // ---- shutdown ----

    /// Cancel everything in flight and drop all downloads.
    ///
    /// Partial downloads the user never confirmed are deleted from disk
    /// and from history; other partial downloads are recorded as
    /// cancelled.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        tracing::info!("Download manager {} shutting down", self.domain);

        for observer in &self.observers {
            observer.manager_going_down();
        }
        let _ = self.events.send(DownloadEvent::ManagerGoingDown);
        self.file_manager.on_download_manager_shutdown(self.domain);

        let ids: Vec<DownloadId> = self.items.keys().copied().collect();
        for id in ids {
            let Some(item) = self.items.get_mut(&id) else {
                continue;
            };
            if !item.is_in_progress() {
                continue;
            }
            let unconfirmed = item.safety_state() == SafetyState::Dangerous;
            item.cancel(false);
            if unconfirmed {
                let path = item.current_path().to_path_buf();
                let handle = item.db_handle();
                if !path.as_os_str().is_empty() {
                    self.file_manager.delete_file(path);
                }
                if let Some(history) = &self.history {
                    history.remove_entry(handle);
                }
            } else {
                self.persist(id);
            }
        }

        for (_, item) in self.items.drain() {
            item.notify_destroyed();
        }
        self.active.clear();
        self.in_progress.clear();
        self.history_downloads.clear();
        self.pending_targets.clear();
        self.ready_waiters.clear();
        self.observers.clear();
        self.shut_down = true;
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn in_dir(item: &DownloadItem, dir: Option<&Path>) -> bool {
    match dir {
        None => true,
        Some(dir) => item.current_path().parent() == Some(dir),
    }
}

fn sorted<'a>(items: impl Iterator<Item = &'a DownloadItem>) -> Vec<&'a DownloadItem> {
    let mut items: Vec<_> = items.collect();
    items.sort_by_key(|item| (item.start_time(), item.id().local()));
    items
}
