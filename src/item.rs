//! Per-download state machine
//!
//! A `DownloadItem` holds everything known about one download and decides
//! which transitions are legal. It performs no I/O: the manager owns the
//! item, applies transitions in response to file, history and user events,
//! and issues whatever side effects follow.
//!
//! ```text
//! IN_PROGRESS ──cancel──────▶ CANCELLED ─┐
//!      │  └────interrupt───▶ INTERRUPTED ─┼─remove─▶ REMOVING
//!      └────completed─────▶ COMPLETE ────┘
//! ```
//!
//! Calls that are illegal in the current state are ignored and logged;
//! they happen routinely when a message from the file worker arrives after
//! the user already cancelled.

use crate::observer::DownloadItemObserver;
use crate::protocol::{
    DangerCheckState, DangerType, DownloadCreateInfo, DownloadId, DownloadSnapshot,
    DownloadState, InterruptReason, PageTransition, PersistentStoreInfo, SafetyState,
    StoreHandle, TargetDisposition,
};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Outcome of target determination, applied in one step
#[derive(Debug, Clone)]
pub struct FileCheckResults {
    pub target_path: PathBuf,
    pub path_uniquifier: u32,
    pub target_disposition: TargetDisposition,
    pub prompt_user_for_save_location: bool,
    pub is_extension_install: bool,
    pub is_dangerous_file: bool,
    pub is_dangerous_url: bool,
}

/// What the caller has to do after [`DownloadItem::completed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionAction {
    /// The item was not in a state that can complete
    Refused,
    /// Completed; nothing else to do
    Done,
    /// Completed; open the file
    Open,
}

/// One download
pub struct DownloadItem {
    id: DownloadId,
    db_handle: StoreHandle,

    url_chain: Vec<Url>,
    referrer_url: Option<Url>,
    suggested_filename: Option<String>,
    content_disposition: Option<String>,
    mime_type: String,
    original_mime_type: String,
    referrer_charset: Option<String>,
    remote_address: Option<String>,
    etag: Option<String>,
    last_modified: Option<String>,

    total_bytes: i64,
    received_bytes: i64,
    bytes_per_sec: i64,
    hash_state: String,
    hash: String,

    current_path: PathBuf,
    target_path: PathBuf,
    forced_path: Option<PathBuf>,
    target_disposition: TargetDisposition,
    path_uniquifier: u32,
    target_determined: bool,
    prompt_user_for_save_location: bool,
    is_extension_install: bool,

    danger_type: DangerType,
    safety_state: SafetyState,
    danger_check: DangerCheckState,

    state: DownloadState,
    last_reason: InterruptReason,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,

    has_user_gesture: bool,
    transition: PageTransition,
    is_paused: bool,
    open_when_complete: bool,
    auto_opened: bool,
    opened: bool,
    is_temporary: bool,
    is_otr: bool,
    all_data_saved: bool,
    file_externally_removed: bool,
    delegate_delayed_complete: bool,

    observers: Vec<Arc<dyn DownloadItemObserver>>,
}

impl std::fmt::Debug for DownloadItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.debug_string(true))
    }
}

impl DownloadItem {
    /// A new in-progress download
    pub fn new(id: DownloadId, info: &DownloadCreateInfo, is_otr: bool) -> Self {
        let forced_path = info.save_info.file_path.clone();
        let target_disposition = if forced_path.is_some() {
            TargetDisposition::Overwrite
        } else if info.prompt_user_for_save_location {
            TargetDisposition::Prompt
        } else {
            TargetDisposition::Uniquify
        };
        let mut item = Self::blank(id, info.url_chain.clone(), info.start_time);
        item.referrer_url = info.referrer_url.clone();
        item.suggested_filename = info.save_info.suggested_name.clone();
        item.content_disposition = info.content_disposition.clone();
        item.mime_type = info.mime_type.clone();
        item.original_mime_type = info.original_mime_type.clone();
        item.referrer_charset = info.referrer_charset.clone();
        item.remote_address = info.remote_address.clone();
        item.etag = info.etag.clone();
        item.last_modified = info.last_modified.clone();
        item.total_bytes = info.total_bytes.max(0);
        item.has_user_gesture = info.has_user_gesture;
        item.transition = info.transition;
        item.prompt_user_for_save_location = info.prompt_user_for_save_location;
        item.is_temporary = forced_path.is_some();
        item.forced_path = forced_path;
        item.target_disposition = target_disposition;
        item.is_otr = is_otr;
        item
    }

    /// Rebuild a download from its history record.
    ///
    /// A record saved while in progress can't be resumed and comes back
    /// cancelled. A complete record has, by definition, all its data.
    pub fn from_history(id: DownloadId, info: &PersistentStoreInfo) -> Self {
        let mut item = Self::blank(id, vec![info.url.clone()], info.start_time);
        item.db_handle = info.db_handle;
        item.referrer_url = info.referrer_url.clone();
        item.current_path = info.path.clone();
        item.target_path = info.path.clone();
        item.target_determined = true;
        item.end_time = info.end_time;
        item.received_bytes = info.received_bytes;
        item.total_bytes = info.total_bytes;
        item.opened = info.opened;
        item.state = match info.state {
            DownloadState::InProgress => DownloadState::Cancelled,
            other => other,
        };
        if item.state == DownloadState::Cancelled {
            item.last_reason = InterruptReason::Crash;
        }
        item.all_data_saved = item.state == DownloadState::Complete;
        item
    }

    fn blank(id: DownloadId, url_chain: Vec<Url>, start_time: DateTime<Utc>) -> Self {
        Self {
            id,
            db_handle: StoreHandle::UNINITIALIZED,
            url_chain,
            referrer_url: None,
            suggested_filename: None,
            content_disposition: None,
            mime_type: String::new(),
            original_mime_type: String::new(),
            referrer_charset: None,
            remote_address: None,
            etag: None,
            last_modified: None,
            total_bytes: 0,
            received_bytes: 0,
            bytes_per_sec: 0,
            hash_state: String::new(),
            hash: String::new(),
            current_path: PathBuf::new(),
            target_path: PathBuf::new(),
            forced_path: None,
            target_disposition: TargetDisposition::Uniquify,
            path_uniquifier: 0,
            target_determined: false,
            prompt_user_for_save_location: false,
            is_extension_install: false,
            danger_type: DangerType::NotDangerous,
            safety_state: SafetyState::Safe,
            danger_check: DangerCheckState::NotRequested,
            state: DownloadState::InProgress,
            last_reason: InterruptReason::None,
            start_time,
            end_time: None,
            has_user_gesture: false,
            transition: PageTransition::Link,
            is_paused: false,
            open_when_complete: false,
            auto_opened: false,
            opened: false,
            is_temporary: false,
            is_otr: false,
            all_data_saved: false,
            file_externally_removed: false,
            delegate_delayed_complete: false,
            observers: Vec::new(),
        }
    }

    // ---- observers ----

    pub fn add_observer(&mut self, observer: Arc<dyn DownloadItemObserver>) {
        self.observers.push(observer);
    }

    pub fn remove_observer(&mut self, observer: &Arc<dyn DownloadItemObserver>) {
        self.observers.retain(|o| !Arc::ptr_eq(o, observer));
    }

    pub fn update_observers(&self) {
        for observer in &self.observers {
            observer.on_download_updated(self);
        }
    }

    fn notify_opened(&self) {
        for observer in &self.observers {
            observer.on_download_opened(self);
        }
    }

    /// Final notification; the item must be dropped right after
    pub fn notify_destroyed(&self) {
        for observer in &self.observers {
            observer.on_download_destroyed(self);
        }
    }

    // ---- transitions ----

    fn transition_to(&mut self, state: DownloadState) {
        if self.state == state {
            return;
        }
        tracing::debug!("Download {} {} -> {}", self.id, self.state, state);
        self.state = state;
        self.update_observers();
    }

    // total_bytes is reset to unknown when the server lied about it
    fn update_size(&mut self, bytes_so_far: i64) {
        self.received_bytes = bytes_so_far.max(0);
        if self.total_bytes > 0 && self.received_bytes > self.total_bytes {
            self.total_bytes = 0;
        }
    }

    /// New progress from the file layer
    pub fn update(&mut self, bytes_so_far: i64, bytes_per_sec: i64, hash_state: &str) -> bool {
        if !self.is_in_progress() {
            tracing::warn!("Ignoring progress for {} download {}", self.state, self.id);
            return false;
        }
        self.bytes_per_sec = bytes_per_sec;
        self.hash_state = hash_state.to_string();
        self.update_size(bytes_so_far);
        self.update_observers();
        true
    }

    /// Cancel an in-progress download. Returns false (and changes nothing,
    /// including the last reason) when the download already finished.
    pub fn cancel(&mut self, user_cancel: bool) -> bool {
        if !self.is_in_progress() {
            return false;
        }
        self.last_reason = if user_cancel {
            InterruptReason::UserCanceled
        } else {
            InterruptReason::UserShutdown
        };
        self.transition_to(DownloadState::Cancelled);
        true
    }

    /// Stop the download because of an error
    pub fn interrupt(&mut self, bytes_so_far: i64, hash_state: &str, reason: InterruptReason) -> bool {
        if !self.is_in_progress() {
            return false;
        }
        self.last_reason = reason;
        self.hash_state = hash_state.to_string();
        self.update_size(bytes_so_far);
        self.transition_to(DownloadState::Interrupted);
        true
    }

    /// The stream ended and the file holds every byte. Happens at most once.
    pub fn on_all_data_saved(&mut self, size: i64, final_hash: &str) -> bool {
        if self.all_data_saved {
            tracing::warn!("Download {} already saved all data", self.id);
            return false;
        }
        if !self.is_in_progress() {
            return false;
        }
        self.all_data_saved = true;
        self.update_size(size);
        self.hash = final_hash.to_string();
        self.hash_state.clear();
        self.bytes_per_sec = 0;
        self.update_observers();
        true
    }

    /// Move to COMPLETE. Requires all data to be saved.
    pub fn completed(&mut self, open_by_extension: bool) -> CompletionAction {
        if !self.all_data_saved || !self.is_in_progress() {
            tracing::warn!(
                "Download {} cannot complete (state {}, all_data_saved {})",
                self.id,
                self.state,
                self.all_data_saved
            );
            return CompletionAction::Refused;
        }
        self.end_time = Some(Utc::now());
        self.transition_to(DownloadState::Complete);

        if !self.auto_opened
            && (self.open_when_complete || open_by_extension || self.is_temporary)
        {
            self.auto_opened = true;
            if !self.is_temporary {
                return CompletionAction::Open;
            }
        }
        CompletionAction::Done
    }

    /// Record the outcome of target determination
    pub fn set_file_check_results(&mut self, results: FileCheckResults) {
        self.target_path = results.target_path;
        self.path_uniquifier = results.path_uniquifier;
        self.target_disposition = results.target_disposition;
        self.prompt_user_for_save_location = results.prompt_user_for_save_location;
        self.is_extension_install = results.is_extension_install;
        self.danger_type = DangerType::resolve(results.is_dangerous_file, results.is_dangerous_url);
        self.safety_state = if results.is_dangerous_file || results.is_dangerous_url {
            SafetyState::Dangerous
        } else {
            SafetyState::Safe
        };
        self.target_determined = true;
        self.update_observers();
    }

    /// The content check flagged the file
    pub fn mark_content_dangerous(&mut self) {
        self.danger_type = DangerType::DangerousContent;
        self.safety_state = SafetyState::Dangerous;
        self.update_observers();
    }

    /// The user accepted a dangerous download
    pub fn dangerous_download_validated(&mut self) -> bool {
        if self.safety_state != SafetyState::Dangerous {
            return false;
        }
        self.safety_state = SafetyState::DangerousButValidated;
        self.update_observers();
        true
    }

    /// Flip the paused flag; returns the new value
    pub fn toggle_pause(&mut self) -> bool {
        self.set_paused(!self.is_paused);
        self.is_paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        if !self.is_in_progress() || self.is_paused == paused {
            return;
        }
        self.is_paused = paused;
        self.update_observers();
    }

    /// Handle a user request to open. A partial download is flagged to open
    /// once it completes. Returns true when the caller should open the file
    /// now.
    pub fn open_download(&mut self) -> bool {
        if self.is_in_progress() {
            self.open_when_complete = !self.open_when_complete;
            self.update_observers();
            return false;
        }
        if !self.is_complete() || self.file_externally_removed {
            return false;
        }
        self.opened = true;
        self.notify_opened();
        self.update_observers();
        true
    }

    /// The completion was held back by the delegate and has now been opened
    pub fn delayed_download_opened(&mut self) {
        self.auto_opened = true;
        self.delegate_delayed_complete = false;
    }

    pub fn on_downloaded_file_removed(&mut self) {
        if self.file_externally_removed {
            return;
        }
        self.file_externally_removed = true;
        self.update_observers();
    }

    /// Last state before destruction
    pub fn transition_to_removing(&mut self) {
        self.transition_to(DownloadState::Removing);
    }

    pub fn set_db_handle(&mut self, handle: StoreHandle) {
        self.db_handle = handle;
    }

    /// The file now lives at `path`
    pub fn set_current_path(&mut self, path: PathBuf) {
        if self.current_path == path {
            return;
        }
        self.current_path = path;
        self.update_observers();
    }

    /// The final name changed (e.g. uniquified at rename time)
    pub fn set_target_path(&mut self, path: PathBuf, uniquifier: u32) {
        self.target_path = path;
        self.path_uniquifier = uniquifier;
    }

    pub fn set_danger_check_state(&mut self, state: DangerCheckState) {
        self.danger_check = state;
    }

    pub fn set_open_when_complete(&mut self, open: bool) {
        self.open_when_complete = open;
    }

    pub fn set_delegate_delayed_complete(&mut self, delayed: bool) {
        self.delegate_delayed_complete = delayed;
    }

    // ---- queries ----

    pub fn id(&self) -> DownloadId {
        self.id
    }

    pub fn db_handle(&self) -> StoreHandle {
        self.db_handle
    }

    pub fn state(&self) -> DownloadState {
        self.state
    }

    pub fn is_in_progress(&self) -> bool {
        self.state == DownloadState::InProgress
    }

    pub fn is_partial_download(&self) -> bool {
        self.is_in_progress()
    }

    pub fn is_complete(&self) -> bool {
        self.state == DownloadState::Complete
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == DownloadState::Cancelled
    }

    pub fn is_interrupted(&self) -> bool {
        self.state == DownloadState::Interrupted
    }

    pub fn last_reason(&self) -> InterruptReason {
        self.last_reason
    }

    /// Final URL after redirects
    pub fn url(&self) -> &Url {
        // The chain is seeded at construction and never shrinks
        &self.url_chain[self.url_chain.len() - 1]
    }

    pub fn original_url(&self) -> &Url {
        &self.url_chain[0]
    }

    pub fn url_chain(&self) -> &[Url] {
        &self.url_chain
    }

    pub fn referrer_url(&self) -> Option<&Url> {
        self.referrer_url.as_ref()
    }

    pub fn suggested_filename(&self) -> Option<&str> {
        self.suggested_filename.as_deref()
    }

    pub fn content_disposition(&self) -> Option<&str> {
        self.content_disposition.as_deref()
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn original_mime_type(&self) -> &str {
        &self.original_mime_type
    }

    pub fn referrer_charset(&self) -> Option<&str> {
        self.referrer_charset.as_deref()
    }

    pub fn remote_address(&self) -> Option<&str> {
        self.remote_address.as_deref()
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.last_modified.as_deref()
    }

    pub fn total_bytes(&self) -> i64 {
        self.total_bytes
    }

    pub fn received_bytes(&self) -> i64 {
        self.received_bytes
    }

    pub fn hash_state(&self) -> &str {
        &self.hash_state
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn current_path(&self) -> &Path {
        &self.current_path
    }

    pub fn target_path(&self) -> &Path {
        &self.target_path
    }

    /// Destination requested by the caller, if any
    pub fn forced_path(&self) -> Option<&Path> {
        self.forced_path.as_deref()
    }

    pub fn target_disposition(&self) -> TargetDisposition {
        self.target_disposition
    }

    pub fn path_uniquifier(&self) -> u32 {
        self.path_uniquifier
    }

    pub fn target_determined(&self) -> bool {
        self.target_determined
    }

    pub fn prompt_user_for_save_location(&self) -> bool {
        self.prompt_user_for_save_location
    }

    pub fn is_extension_install(&self) -> bool {
        self.is_extension_install
    }

    pub fn danger_type(&self) -> DangerType {
        self.danger_type
    }

    pub fn safety_state(&self) -> SafetyState {
        self.safety_state
    }

    pub fn danger_check_state(&self) -> DangerCheckState {
        self.danger_check
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn has_user_gesture(&self) -> bool {
        self.has_user_gesture
    }

    pub fn transition(&self) -> PageTransition {
        self.transition
    }

    pub fn is_paused(&self) -> bool {
        self.is_paused
    }

    pub fn open_when_complete(&self) -> bool {
        self.open_when_complete
    }

    pub fn auto_opened(&self) -> bool {
        self.auto_opened
    }

    pub fn opened(&self) -> bool {
        self.opened
    }

    pub fn is_temporary(&self) -> bool {
        self.is_temporary
    }

    pub fn is_otr(&self) -> bool {
        self.is_otr
    }

    pub fn all_data_saved(&self) -> bool {
        self.all_data_saved
    }

    pub fn file_externally_removed(&self) -> bool {
        self.file_externally_removed
    }

    pub fn delegate_delayed_complete(&self) -> bool {
        self.delegate_delayed_complete
    }

    /// The user has nothing left to confirm
    pub fn is_user_verified(&self) -> bool {
        self.safety_state != SafetyState::Dangerous
    }

    /// The file still has to move to its final name
    pub fn needs_rename(&self) -> bool {
        self.current_path != self.target_path
    }

    /// Name shown to the user
    pub fn display_name(&self) -> String {
        let path = if self.target_path.as_os_str().is_empty() {
            &self.current_path
        } else {
            &self.target_path
        };
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Progress in percent, -1 when the size is unknown or completion is
    /// being held back by the delegate
    pub fn percent_complete(&self) -> i32 {
        if self.delegate_delayed_complete || self.total_bytes <= 0 {
            return -1;
        }
        (self.received_bytes.saturating_mul(100) / self.total_bytes) as i32
    }

    /// Bytes per second, 0 while paused
    pub fn current_speed(&self) -> i64 {
        if self.is_paused {
            0
        } else {
            self.bytes_per_sec
        }
    }

    /// Estimate of the time left, `None` when it can't be computed
    pub fn time_remaining(&self) -> Option<Duration> {
        let speed = self.current_speed();
        if self.total_bytes <= 0 || speed <= 0 {
            return None;
        }
        let left = (self.total_bytes - self.received_bytes).max(0);
        Some(Duration::from_secs((left / speed) as u64))
    }

    /// Case-insensitive substring match on URL and file name; an empty
    /// query matches everything
    pub fn matches_query(&self, query: &str) -> bool {
        if query.is_empty() {
            return true;
        }
        let query = query.to_lowercase();
        self.url_chain
            .iter()
            .any(|u| u.as_str().to_lowercase().contains(&query))
            || self.display_name().to_lowercase().contains(&query)
            || self
                .current_path
                .to_string_lossy()
                .to_lowercase()
                .contains(&query)
    }

    /// The record stored in history
    pub fn persistent_store_info(&self) -> PersistentStoreInfo {
        let path = if self.is_complete() || self.current_path.as_os_str().is_empty() {
            self.target_path.clone()
        } else {
            self.current_path.clone()
        };
        PersistentStoreInfo {
            path,
            url: self.original_url().clone(),
            referrer_url: self.referrer_url.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            received_bytes: self.received_bytes,
            total_bytes: self.total_bytes,
            state: self.state,
            db_handle: self.db_handle,
            opened: self.opened,
        }
    }

    /// Owned copy of the observable state
    pub fn snapshot(&self) -> DownloadSnapshot {
        DownloadSnapshot {
            id: self.id,
            db_handle: self.db_handle,
            url: self.url().clone(),
            original_url: self.original_url().clone(),
            referrer_url: self.referrer_url.clone(),
            mime_type: self.mime_type.clone(),
            state: self.state,
            danger_type: self.danger_type,
            safety_state: self.safety_state,
            last_reason: self.last_reason,
            received_bytes: self.received_bytes,
            total_bytes: self.total_bytes,
            percent_complete: self.percent_complete(),
            bytes_per_sec: self.current_speed(),
            current_path: self.current_path.clone(),
            target_path: self.target_path.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            is_paused: self.is_paused,
            opened: self.opened,
            auto_opened: self.auto_opened,
            is_temporary: self.is_temporary,
            is_otr: self.is_otr,
            all_data_saved: self.all_data_saved,
            file_externally_removed: self.file_externally_removed,
            hash: self.hash.clone(),
        }
    }

    /// One-line description for logs and bug reports
    pub fn debug_string(&self, verbose: bool) -> String {
        let mut s = format!(
            "{{ id={} state={} reason={} received={} total={}",
            self.id, self.state, self.last_reason, self.received_bytes, self.total_bytes
        );
        if verbose {
            let chain: Vec<&str> = self.url_chain.iter().map(Url::as_str).collect();
            s.push_str(&format!(
                " db_handle={} paused={} otr={} safety={:?} danger={:?} all_data_saved={} \
                 url_chain=[{}] target={:?} current={:?}",
                self.db_handle,
                self.is_paused,
                self.is_otr,
                self.safety_state,
                self.danger_type,
                self.all_data_saved,
                chain.join(", "),
                self.target_path,
                self.current_path
            ));
        } else {
            s.push_str(&format!(" url={}", self.url()));
        }
        s.push_str(" }");
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use uuid::Uuid;

    fn item_with_total(total: i64) -> DownloadItem {
        let info = DownloadCreateInfo::new(Url::parse("http://example.com/foo.txt").unwrap())
            .total_bytes(total);
        DownloadItem::new(DownloadId::new(Uuid::new_v4(), 1), &info, false)
    }

    #[derive(Default)]
    struct CountingObserver {
        updates: Mutex<Vec<DownloadState>>,
        opened: Mutex<usize>,
        destroyed: Mutex<usize>,
    }

    impl DownloadItemObserver for CountingObserver {
        fn on_download_updated(&self, item: &DownloadItem) {
            self.updates.lock().push(item.state());
        }
        fn on_download_opened(&self, _item: &DownloadItem) {
            *self.opened.lock() += 1;
        }
        fn on_download_destroyed(&self, _item: &DownloadItem) {
            *self.destroyed.lock() += 1;
        }
    }

    fn check_size_invariant(item: &DownloadItem) {
        assert!(item.received_bytes() >= 0);
        assert!(item.total_bytes() <= 0 || item.received_bytes() <= item.total_bytes());
    }

    #[test]
    fn happy_path_reaches_complete_at_100_percent() {
        let mut item = item_with_total(1000);
        assert!(item.update(400, 100, "h1"));
        assert_eq!(item.percent_complete(), 40);
        assert!(item.update(1000, 100, "h2"));
        assert!(item.on_all_data_saved(1000, "final"));
        assert_eq!(item.completed(false), CompletionAction::Done);
        assert!(item.is_complete());
        assert_eq!(item.percent_complete(), 100);
        assert_eq!(item.hash(), "final");
        assert!(item.end_time().is_some());
    }

    #[test]
    fn unknown_size_reports_minus_one() {
        let mut item = item_with_total(0);
        item.update(500, 10, "");
        assert_eq!(item.percent_complete(), -1);
        assert!(item.time_remaining().is_none());
    }

    #[test]
    fn oversized_transfer_resets_total() {
        let mut item = item_with_total(100);
        item.update(50, 1, "");
        check_size_invariant(&item);
        item.update(150, 1, "");
        check_size_invariant(&item);
        assert_eq!(item.total_bytes(), 0);
        assert_eq!(item.received_bytes(), 150);
    }

    #[test]
    fn cancel_does_not_overwrite_interrupt_reason() {
        let mut item = item_with_total(1000);
        assert!(item.interrupt(300, "", InterruptReason::FileAccessDenied));
        assert_eq!(item.state(), DownloadState::Interrupted);
        assert_eq!(item.received_bytes(), 300);

        assert!(!item.cancel(true));
        assert_eq!(item.state(), DownloadState::Interrupted);
        assert_eq!(item.last_reason(), InterruptReason::FileAccessDenied);
    }

    #[test]
    fn cancel_twice_has_one_effect() {
        let observer = Arc::new(CountingObserver::default());
        let mut item = item_with_total(10);
        item.add_observer(observer.clone());

        assert!(item.cancel(true));
        assert!(!item.cancel(true));
        assert_eq!(item.state(), DownloadState::Cancelled);
        assert_eq!(item.last_reason(), InterruptReason::UserCanceled);
        assert_eq!(*observer.updates.lock(), vec![DownloadState::Cancelled]);
    }

    #[test]
    fn shutdown_cancel_uses_shutdown_reason() {
        let mut item = item_with_total(10);
        item.cancel(false);
        assert_eq!(item.last_reason(), InterruptReason::UserShutdown);
    }

    #[test]
    fn terminal_items_ignore_progress() {
        let mut item = item_with_total(10);
        item.cancel(true);
        assert!(!item.update(5, 1, ""));
        assert_eq!(item.received_bytes(), 0);
        assert!(!item.interrupt(5, "", InterruptReason::NetworkFailed));
        assert_eq!(item.last_reason(), InterruptReason::UserCanceled);
    }

    #[test]
    fn all_data_saved_is_set_once() {
        let mut item = item_with_total(10);
        assert!(!item.all_data_saved());
        assert!(item.on_all_data_saved(10, "a"));
        assert!(!item.on_all_data_saved(10, "b"));
        assert!(item.all_data_saved());
        assert_eq!(item.hash(), "a");
        item.cancel(true);
        assert!(item.all_data_saved());
    }

    #[test]
    fn complete_requires_all_data() {
        let mut item = item_with_total(10);
        assert_eq!(item.completed(false), CompletionAction::Refused);
        assert!(item.is_in_progress());
    }

    #[test]
    fn dangerous_url_takes_priority() {
        let mut item = item_with_total(10);
        item.set_file_check_results(FileCheckResults {
            target_path: PathBuf::from("/d/x.exe"),
            path_uniquifier: 0,
            target_disposition: TargetDisposition::Uniquify,
            prompt_user_for_save_location: false,
            is_extension_install: false,
            is_dangerous_file: true,
            is_dangerous_url: true,
        });
        assert_eq!(item.danger_type(), DangerType::DangerousUrl);
        assert_eq!(item.safety_state(), SafetyState::Dangerous);
        assert!(!item.is_user_verified());

        assert!(item.dangerous_download_validated());
        assert_eq!(item.safety_state(), SafetyState::DangerousButValidated);
        assert!(item.is_in_progress());
        assert!(!item.dangerous_download_validated());
    }

    #[test]
    fn open_partial_toggles_open_when_complete() {
        let mut item = item_with_total(10);
        assert!(!item.open_download());
        assert!(item.open_when_complete());
        assert!(!item.open_download());
        assert!(!item.open_when_complete());
        item.open_download();

        item.on_all_data_saved(10, "");
        assert_eq!(item.completed(false), CompletionAction::Open);
        assert!(item.auto_opened());
    }

    #[test]
    fn temporary_downloads_never_auto_open() {
        let info = DownloadCreateInfo::new(Url::parse("http://example.com/a.pdf").unwrap())
            .save_to("/tmp/a.pdf");
        let mut item = DownloadItem::new(DownloadId::new(Uuid::new_v4(), 1), &info, false);
        assert!(item.is_temporary());
        assert_eq!(item.target_disposition(), TargetDisposition::Overwrite);
        item.on_all_data_saved(0, "");
        assert_eq!(item.completed(true), CompletionAction::Done);
        assert!(item.auto_opened());
    }

    #[test]
    fn opening_complete_download_notifies() {
        let observer = Arc::new(CountingObserver::default());
        let mut item = item_with_total(1);
        item.add_observer(observer.clone());
        item.on_all_data_saved(1, "");
        item.completed(false);

        assert!(item.open_download());
        assert!(item.opened());
        assert_eq!(*observer.opened.lock(), 1);

        item.on_downloaded_file_removed();
        assert!(!item.open_download());
    }

    #[test]
    fn removed_observers_stop_hearing() {
        let observer = Arc::new(CountingObserver::default());
        let as_dyn: Arc<dyn DownloadItemObserver> = observer.clone();
        let mut item = item_with_total(1);
        item.add_observer(as_dyn.clone());
        item.update(1, 1, "");
        item.remove_observer(&as_dyn);
        item.update(1, 1, "");
        assert_eq!(observer.updates.lock().len(), 1);

        item.add_observer(as_dyn);
        item.transition_to_removing();
        item.notify_destroyed();
        assert_eq!(*observer.destroyed.lock(), 1);
    }

    #[test]
    fn history_round_trip_is_lossless() {
        let info = PersistentStoreInfo {
            path: PathBuf::from("/d/file.zip"),
            url: Url::parse("http://example.com/file.zip").unwrap(),
            referrer_url: Some(Url::parse("http://example.com/").unwrap()),
            start_time: Utc::now(),
            end_time: Some(Utc::now()),
            received_bytes: 77,
            total_bytes: 100,
            state: DownloadState::Interrupted,
            db_handle: StoreHandle::new(12),
            opened: true,
        };
        let item = DownloadItem::from_history(DownloadId::new(Uuid::new_v4(), 3), &info);
        assert_eq!(item.persistent_store_info(), info);
        assert!(!item.all_data_saved());
    }

    #[test]
    fn history_in_progress_comes_back_cancelled() {
        let info = PersistentStoreInfo {
            path: PathBuf::from("/d/file.zip"),
            url: Url::parse("http://example.com/file.zip").unwrap(),
            referrer_url: None,
            start_time: Utc::now(),
            end_time: None,
            received_bytes: 10,
            total_bytes: 100,
            state: DownloadState::InProgress,
            db_handle: StoreHandle::new(3),
            opened: false,
        };
        let item = DownloadItem::from_history(DownloadId::new(Uuid::new_v4(), 1), &info);
        assert_eq!(item.state(), DownloadState::Cancelled);

        let complete = PersistentStoreInfo {
            state: DownloadState::Complete,
            ..info
        };
        let item = DownloadItem::from_history(DownloadId::new(Uuid::new_v4(), 2), &complete);
        assert!(item.all_data_saved());
    }

    #[test]
    fn queries_and_speed() {
        let mut item = item_with_total(1000);
        item.update(200, 100, "");
        assert_eq!(item.time_remaining(), Some(Duration::from_secs(8)));
        item.set_paused(true);
        assert_eq!(item.current_speed(), 0);
        assert!(item.time_remaining().is_none());
        assert!(!item.toggle_pause());

        assert!(item.matches_query(""));
        assert!(item.matches_query("EXAMPLE.com"));
        assert!(!item.matches_query("nothing-like-this"));

        item.set_delegate_delayed_complete(true);
        assert_eq!(item.percent_complete(), -1);
    }

    #[test]
    fn debug_strings() {
        let item = item_with_total(5);
        let short = item.debug_string(false);
        assert!(short.contains("state=in_progress"));
        assert!(short.contains("url=http://example.com/foo.txt"));
        let verbose = item.debug_string(true);
        assert!(verbose.contains("url_chain=[http://example.com/foo.txt]"));
        assert!(verbose.contains("db_handle=0"));
    }
}
