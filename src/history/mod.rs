//! Download history
//!
//! Persists one record per download, keyed by a store handle the backend
//! assigns. The manager never talks to a backend directly: writes go
//! through a [`HistoryClient`] whose single worker applies them in the
//! order they were issued, and replies come back as control messages.

#[cfg(feature = "storage")]
pub mod sqlite;

#[cfg(feature = "storage")]
pub use sqlite::SqliteHistory;

use crate::error::{EngineError, Result};
use crate::manager::ControlMessage;
use crate::protocol::{DownloadId, DownloadState, PersistentStoreInfo, StoreHandle};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use url::Url;

/// Storage backend for download records
#[async_trait]
pub trait DownloadHistory: Send + Sync {
    /// Insert a record and return its new handle
    async fn add_entry(&self, info: &PersistentStoreInfo) -> Result<StoreHandle>;

    /// Overwrite the mutable fields of an existing record
    async fn update_entry(&self, info: &PersistentStoreInfo) -> Result<()>;

    async fn update_download_path(&self, handle: StoreHandle, path: &Path) -> Result<()>;

    async fn remove_entry(&self, handle: StoreHandle) -> Result<()>;

    /// Remove finished records started in `[begin, end)`. A missing bound
    /// is open. Returns how many records went away.
    async fn remove_entries_between(
        &self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<usize>;

    /// Every record, oldest first
    async fn query_all(&self) -> Result<Vec<PersistentStoreInfo>>;

    /// Whether the referrer's host was visited before today
    async fn check_visited_referrer_before(&self, referrer: &Url) -> Result<bool>;
}

/// Start of the current UTC day
pub(crate) fn today_midnight() -> DateTime<Utc> {
    let now = Utc::now();
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc())
        .unwrap_or(now)
}

pub(crate) fn in_range(
    t: DateTime<Utc>,
    begin: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> bool {
    begin.map_or(true, |b| t >= b) && end.map_or(true, |e| t < e)
}

#[derive(Debug, Default)]
struct MemoryInner {
    next_handle: i64,
    entries: BTreeMap<i64, PersistentStoreInfo>,
    visits: Vec<(String, DateTime<Utc>)>,
    unavailable: bool,
}

/// In-memory history for tests and embedders without a database
#[derive(Debug, Default)]
pub struct MemoryHistory {
    inner: parking_lot::RwLock<MemoryInner>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a page visit used by referrer checks
    pub fn record_visit(&self, url: &Url, at: DateTime<Utc>) {
        if let Some(host) = url.host_str() {
            self.inner.write().visits.push((host.to_ascii_lowercase(), at));
        }
    }

    /// Make every call fail, as a database that went offline would
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.write().unavailable = unavailable;
    }

    /// Copy of the stored records
    pub fn entries(&self) -> Vec<PersistentStoreInfo> {
        self.inner.read().entries.values().cloned().collect()
    }

    pub fn get(&self, handle: StoreHandle) -> Option<PersistentStoreInfo> {
        self.inner.read().entries.get(&handle.raw()).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    fn check_available(&self) -> Result<()> {
        if self.inner.read().unavailable {
            return Err(EngineError::Database("history is unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DownloadHistory for MemoryHistory {
    async fn add_entry(&self, info: &PersistentStoreInfo) -> Result<StoreHandle> {
        self.check_available()?;
        let mut inner = self.inner.write();
        inner.next_handle += 1;
        let handle = StoreHandle::new(inner.next_handle);
        let mut record = info.clone();
        record.db_handle = handle;
        inner.entries.insert(handle.raw(), record);
        Ok(handle)
    }

    async fn update_entry(&self, info: &PersistentStoreInfo) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.write();
        match inner.entries.get_mut(&info.db_handle.raw()) {
            Some(record) => {
                record.received_bytes = info.received_bytes;
                record.total_bytes = info.total_bytes;
                record.state = info.state;
                record.end_time = info.end_time;
                record.opened = info.opened;
                Ok(())
            }
            None => Err(EngineError::NotFound(format!("history entry {}", info.db_handle))),
        }
    }

    async fn update_download_path(&self, handle: StoreHandle, path: &Path) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.write();
        match inner.entries.get_mut(&handle.raw()) {
            Some(record) => {
                record.path = path.to_path_buf();
                Ok(())
            }
            None => Err(EngineError::NotFound(format!("history entry {}", handle))),
        }
    }

    async fn remove_entry(&self, handle: StoreHandle) -> Result<()> {
        self.check_available()?;
        self.inner.write().entries.remove(&handle.raw());
        Ok(())
    }

    async fn remove_entries_between(
        &self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        self.check_available()?;
        let mut inner = self.inner.write();
        let before = inner.entries.len();
        inner.entries.retain(|_, record| {
            !(in_range(record.start_time, begin, end) && record.state != DownloadState::InProgress)
        });
        Ok(before - inner.entries.len())
    }

    async fn query_all(&self) -> Result<Vec<PersistentStoreInfo>> {
        self.check_available()?;
        let mut all = self.entries();
        all.sort_by_key(|r| r.start_time);
        Ok(all)
    }

    async fn check_visited_referrer_before(&self, referrer: &Url) -> Result<bool> {
        self.check_available()?;
        let Some(host) = referrer.host_str() else {
            return Ok(false);
        };
        let host = host.to_ascii_lowercase();
        let midnight = today_midnight();
        Ok(self
            .inner
            .read()
            .visits
            .iter()
            .any(|(h, at)| *h == host && *at < midnight))
    }
}

enum HistoryCommand {
    Add {
        id: DownloadId,
        info: PersistentStoreInfo,
    },
    Update(PersistentStoreInfo),
    UpdatePath {
        handle: StoreHandle,
        path: PathBuf,
    },
    Remove(StoreHandle),
    RemoveBetween {
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    },
    QueryAll,
    Barrier(oneshot::Sender<()>),
}

/// Ordered, fire-and-forget access to a [`DownloadHistory`]
#[derive(Clone)]
pub(crate) struct HistoryClient {
    tx: mpsc::UnboundedSender<HistoryCommand>,
    store: Arc<dyn DownloadHistory>,
}

impl HistoryClient {
    pub(crate) fn spawn(
        store: Arc<dyn DownloadHistory>,
        replies: mpsc::UnboundedSender<ControlMessage>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(store.clone(), rx, replies));
        Self { tx, store }
    }

    fn post(&self, command: HistoryCommand) {
        if self.tx.send(command).is_err() {
            tracing::warn!("History worker is gone, dropping command");
        }
    }

    /// Reply arrives as [`ControlMessage::HistoryEntryCreated`]
    pub(crate) fn add_entry(&self, id: DownloadId, info: PersistentStoreInfo) {
        self.post(HistoryCommand::Add { id, info });
    }

    /// Records without a real handle are not in the store and are skipped
    pub(crate) fn update_entry(&self, info: PersistentStoreInfo) {
        if info.db_handle.is_persisted() {
            self.post(HistoryCommand::Update(info));
        }
    }

    pub(crate) fn update_download_path(&self, handle: StoreHandle, path: PathBuf) {
        if handle.is_persisted() {
            self.post(HistoryCommand::UpdatePath { handle, path });
        }
    }

    pub(crate) fn remove_entry(&self, handle: StoreHandle) {
        if handle.is_persisted() {
            self.post(HistoryCommand::Remove(handle));
        }
    }

    pub(crate) fn remove_entries_between(
        &self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) {
        self.post(HistoryCommand::RemoveBetween { begin, end });
    }

    /// Reply arrives as [`ControlMessage::HistoryLoaded`]
    pub(crate) fn query_all(&self) {
        self.post(HistoryCommand::QueryAll);
    }

    /// Resolves once everything posted so far has been applied
    pub(crate) fn barrier(&self) -> oneshot::Receiver<()> {
        let (done, wait) = oneshot::channel();
        self.post(HistoryCommand::Barrier(done));
        wait
    }

    /// Direct read access, used off the write path
    pub(crate) fn store(&self) -> Arc<dyn DownloadHistory> {
        self.store.clone()
    }
}

async fn run(
    store: Arc<dyn DownloadHistory>,
    mut rx: mpsc::UnboundedReceiver<HistoryCommand>,
    replies: mpsc::UnboundedSender<ControlMessage>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            HistoryCommand::Add { id, info } => {
                let handle = match store.add_entry(&info).await {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        tracing::warn!("Failed to add history entry for {}: {}", id, e);
                        None
                    }
                };
                let _ = replies.send(ControlMessage::HistoryEntryCreated { id, handle });
            }
            HistoryCommand::Update(info) => {
                if let Err(e) = store.update_entry(&info).await {
                    tracing::warn!("Failed to update history entry {}: {}", info.db_handle, e);
                }
            }
            HistoryCommand::UpdatePath { handle, path } => {
                if let Err(e) = store.update_download_path(handle, &path).await {
                    tracing::warn!("Failed to update path of history entry {}: {}", handle, e);
                }
            }
            HistoryCommand::Remove(handle) => {
                if let Err(e) = store.remove_entry(handle).await {
                    tracing::warn!("Failed to remove history entry {}: {}", handle, e);
                }
            }
            HistoryCommand::RemoveBetween { begin, end } => {
                match store.remove_entries_between(begin, end).await {
                    Ok(n) => tracing::debug!("Removed {} history entries", n),
                    Err(e) => tracing::warn!("Failed to remove history entries: {}", e),
                }
            }
            HistoryCommand::QueryAll => {
                let entries = match store.query_all().await {
                    Ok(entries) => entries,
                    Err(e) => {
                        tracing::warn!("Failed to load download history: {}", e);
                        Vec::new()
                    }
                };
                let _ = replies.send(ControlMessage::HistoryLoaded(entries));
            }
            HistoryCommand::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(state: DownloadState, start: DateTime<Utc>) -> PersistentStoreInfo {
        PersistentStoreInfo {
            path: PathBuf::from("/d/a.bin"),
            url: Url::parse("http://example.com/a.bin").unwrap(),
            referrer_url: None,
            start_time: start,
            end_time: None,
            received_bytes: 1,
            total_bytes: 2,
            state,
            db_handle: StoreHandle::UNINITIALIZED,
            opened: false,
        }
    }

    #[tokio::test]
    async fn add_update_remove() {
        let history = MemoryHistory::new();
        let h = history
            .add_entry(&record(DownloadState::InProgress, Utc::now()))
            .await
            .unwrap();
        assert!(h.is_persisted());

        let mut updated = history.get(h).unwrap();
        updated.state = DownloadState::Complete;
        updated.received_bytes = 2;
        history.update_entry(&updated).await.unwrap();
        history
            .update_download_path(h, Path::new("/d/final.bin"))
            .await
            .unwrap();

        let stored = history.get(h).unwrap();
        assert_eq!(stored.state, DownloadState::Complete);
        assert_eq!(stored.path, PathBuf::from("/d/final.bin"));

        history.remove_entry(h).await.unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn remove_between_keeps_in_progress_and_out_of_range() {
        let history = MemoryHistory::new();
        let now = Utc::now();
        history.add_entry(&record(DownloadState::Complete, now)).await.unwrap();
        history.add_entry(&record(DownloadState::InProgress, now)).await.unwrap();
        history
            .add_entry(&record(DownloadState::Cancelled, now - Duration::days(3)))
            .await
            .unwrap();

        let removed = history
            .remove_entries_between(Some(now - Duration::days(1)), None)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(history.len(), 2);

        assert_eq!(history.remove_entries_between(None, None).await.unwrap(), 1);
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn referrer_must_be_visited_before_today() {
        let history = MemoryHistory::new();
        let referrer = Url::parse("https://News.Example.com/article").unwrap();
        assert!(!history.check_visited_referrer_before(&referrer).await.unwrap());

        history.record_visit(&referrer, Utc::now());
        assert!(!history.check_visited_referrer_before(&referrer).await.unwrap());

        history.record_visit(
            &Url::parse("https://news.example.com/").unwrap(),
            today_midnight() - Duration::hours(1),
        );
        assert!(history.check_visited_referrer_before(&referrer).await.unwrap());
    }

    #[tokio::test]
    async fn unavailable_store_fails() {
        let history = MemoryHistory::new();
        history.set_unavailable(true);
        assert!(history
            .add_entry(&record(DownloadState::InProgress, Utc::now()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn client_applies_writes_in_order_and_replies() {
        let store = Arc::new(MemoryHistory::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = HistoryClient::spawn(store.clone(), tx);
        let id = DownloadId::new(uuid::Uuid::new_v4(), 1);

        client.add_entry(id, record(DownloadState::InProgress, Utc::now()));
        let handle = match rx.recv().await.unwrap() {
            ControlMessage::HistoryEntryCreated { id: got, handle } => {
                assert_eq!(got, id);
                handle.unwrap()
            }
            _ => panic!("unexpected reply"),
        };

        let mut info = store.get(handle).unwrap();
        info.state = DownloadState::Interrupted;
        client.update_entry(info.clone());
        info.state = DownloadState::Cancelled;
        client.update_entry(info);
        // Fake handles never reach the store
        let mut fake = record(DownloadState::Complete, Utc::now());
        fake.db_handle = StoreHandle::new(-1);
        client.update_entry(fake);
        client.barrier().await.unwrap();

        assert_eq!(store.get(handle).unwrap().state, DownloadState::Cancelled);
        assert_eq!(store.len(), 1);

        client.query_all();
        match rx.recv().await.unwrap() {
            ControlMessage::HistoryLoaded(entries) => assert_eq!(entries.len(), 1),
            _ => panic!("unexpected reply"),
        }
    }
}
