//! Completion, cancellation and file-worker results
//!
//! A download completes only once every precondition holds: all bytes on
//! disk, target determined, history handle assigned, no unconfirmed
//! danger and no outstanding content check. Each of those arrives on its
//! own schedule, so every arrival re-evaluates readiness.

use super::{ControlMessage, DownloadManager};
use crate::danger::{verdict_or_safe, ContentCheckRequest, Verdict};
use crate::file::FileEvent;
use crate::item::{CompletionAction, DownloadItem};
use crate::protocol::{
    DangerCheckState, DangerType, DownloadId, InterruptReason, SafetyState, TargetDisposition,
};
use crate::reservation::{ProbeOutcome, ReservationRequest};
use std::path::PathBuf;

/// Called once when a download becomes ready to complete
pub type ReadyCallback = Box<dyn FnOnce(DownloadId) + Send>;

impl DownloadManager {
    pub(super) fn on_file_event(&mut self, event: FileEvent) {
        match event {
            FileEvent::Created { id, path } => {
                // A rename to the intermediate name may already be recorded
                if let Some(item) = self.items.get_mut(&id) {
                    if item.is_in_progress() && item.current_path().as_os_str().is_empty() {
                        item.set_current_path(path);
                    }
                }
            }
            FileEvent::Progress {
                id,
                bytes_so_far,
                bytes_per_sec,
                hash_state,
            } => self.update_download(id, bytes_so_far as i64, bytes_per_sec, &hash_state),
            FileEvent::ResponseCompleted {
                id,
                bytes_so_far,
                hash,
            } => self.on_response_completed(id, bytes_so_far as i64, &hash),
            FileEvent::Renamed { id, path } => {
                if let Some(item) = self.items.get_mut(&id) {
                    if item.is_in_progress() {
                        item.set_current_path(path);
                    }
                }
            }
            FileEvent::RenamedToFinalName {
                id,
                path,
                uniquifier,
            } => self.on_download_renamed_to_final_name(id, path, uniquifier),
            FileEvent::Error {
                id,
                bytes_so_far,
                reason,
            } => self.on_download_error(id, bytes_so_far as i64, reason),
        }
    }

    /// Progress from the file worker
    pub fn update_download(
        &mut self,
        id: DownloadId,
        bytes_so_far: i64,
        bytes_per_sec: i64,
        hash_state: &str,
    ) {
        if !self.active.contains(&id) {
            return;
        }
        let Some(item) = self.items.get_mut(&id) else {
            return;
        };
        if item.is_in_progress() && item.update(bytes_so_far, bytes_per_sec, hash_state) {
            self.persist(id);
        }
    }

    /// The response finished and every byte is on disk
    pub fn on_response_completed(&mut self, id: DownloadId, size: i64, hash: &str) {
        if !self.active.contains(&id) {
            return;
        }
        let Some(item) = self.items.get_mut(&id) else {
            return;
        };
        if !item.on_all_data_saved(size, hash) {
            return;
        }
        tracing::debug!("Download {} has all {} bytes on disk", id, size);

        if let Some(service) = self.danger_service.clone().filter(|_| !hash.is_empty()) {
            item.set_danger_check_state(DangerCheckState::Pending);
            let request = ContentCheckRequest {
                id,
                url_chain: item.url_chain().to_vec(),
                referrer_url: item.referrer_url().cloned(),
                path: item.current_path().to_path_buf(),
                hash: hash.to_string(),
                total_bytes: item.total_bytes(),
            };
            let timeout = self.config.danger_check_timeout_duration();
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let verdict = verdict_or_safe(timeout, service.check_content(request)).await;
                let _ = tx.send(ControlMessage::ContentChecked { id, verdict });
            });
        }
        self.on_completion_input_changed(id);
    }

    pub(super) fn on_content_checked(&mut self, id: DownloadId, verdict: Verdict) {
        let Some(item) = self.items.get_mut(&id) else {
            return;
        };
        if item.danger_check_state() != DangerCheckState::Pending {
            return;
        }
        item.set_danger_check_state(DangerCheckState::Done);
        if !item.is_in_progress() {
            return;
        }
        if verdict == Verdict::Dangerous {
            tracing::warn!("Content of download {} flagged as dangerous", id);
            item.mark_content_dangerous();
        }
        self.on_completion_input_changed(id);
    }

    /// The user accepted a dangerous download
    pub fn dangerous_download_validated(&mut self, id: DownloadId) -> bool {
        let Some(item) = self.items.get_mut(&id) else {
            return false;
        };
        if !item.dangerous_download_validated() {
            return false;
        }
        tracing::info!("Dangerous download {} accepted by the user", id);
        self.on_completion_input_changed(id);
        true
    }

    /// Whether `id` may complete now. If not, `on_ready` is kept and called
    /// once it can; a later callback replaces an earlier one.
    pub fn is_download_ready_for_completion(
        &mut self,
        id: DownloadId,
        on_ready: Option<ReadyCallback>,
    ) -> bool {
        if self.ready_for_completion(id) {
            return true;
        }
        if let Some(on_ready) = on_ready {
            if self.items.get(&id).is_some_and(DownloadItem::is_in_progress)
                && self.ready_waiters.insert(id, on_ready).is_some()
            {
                tracing::debug!("Replaced completion waiter of {}", id);
            }
        }
        false
    }

    fn ready_for_completion(&self, id: DownloadId) -> bool {
        let Some(item) = self.items.get(&id) else {
            return false;
        };
        item.is_in_progress()
            && item.all_data_saved()
            && item.safety_state() != SafetyState::Dangerous
            && item.target_determined()
            && item.db_handle().is_assigned()
            && item.danger_check_state() != DangerCheckState::Pending
            && self.active.contains(&id)
            && self.in_progress.contains(&id)
    }

    pub(super) fn on_completion_input_changed(&mut self, id: DownloadId) {
        if self.ready_for_completion(id) {
            if let Some(on_ready) = self.ready_waiters.remove(&id) {
                on_ready(id);
            }
        }
        self.maybe_complete_download(id);
    }

    /// Complete `id` if it is ready and the delegate agrees
    pub fn maybe_complete_download(&mut self, id: DownloadId) {
        if !self.ready_for_completion(id) {
            return;
        }
        let Some(item) = self.items.get(&id) else {
            return;
        };
        if !self.delegate.should_complete_download(item) {
            tracing::debug!("Delegate holds back completion of {}", id);
            return;
        }
        self.in_progress.remove(&id);
        self.persist(id);
        self.on_download_completing(id);
    }

    fn on_download_completing(&mut self, id: DownloadId) {
        let Some(item) = self.items.get(&id) else {
            return;
        };
        if !item.needs_rename() {
            self.download_completed(id);
            self.file_manager.complete_download(id);
            return;
        }
        // Names the user confirmed or that were never dangerous can replace
        // whatever took the spot since the reservation
        let overwrite = item.prompt_user_for_save_location()
            || item.danger_type() == DangerType::NotDangerous
            || item.target_disposition() == TargetDisposition::Overwrite;
        if overwrite {
            tracing::debug!("Download {} renaming to {:?}", id, item.target_path());
            self.file_manager.rename_completing_download_file(
                id,
                item.target_path().to_path_buf(),
                item.path_uniquifier(),
                true,
            );
            return;
        }

        // Everything else picks a name that is free on disk and not held by
        // another download
        let request = ReservationRequest::new(
            id,
            item.target_path(),
            self.config.download_dir.clone(),
            true,
        )
        .own_file(item.current_path());
        self.probe_final_path(request);
    }

    fn probe_final_path(&self, request: ReservationRequest) {
        let probe = self.reservations.probe(&request);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let outcome = probe.run_blocking().await;
            let _ = tx.send(ControlMessage::FinalPathReserved { request, outcome });
        });
    }

    pub(super) fn on_final_path_reserved(
        &mut self,
        mut request: ReservationRequest,
        outcome: ProbeOutcome,
    ) {
        let id = request.id;
        if !self.is_live(id) {
            return;
        }
        let Some(reserved) = self.reservations.finish(&mut request, outcome) else {
            self.probe_final_path(request);
            return;
        };
        let Some(item) = self.items.get_mut(&id) else {
            return;
        };
        if !reserved.verified {
            tracing::warn!("Download {} found no free name near {:?}", id, item.target_path());
            let received = item.received_bytes();
            self.on_download_error(id, received, InterruptReason::FileFailed);
            return;
        }
        if reserved.path != item.target_path() {
            item.set_target_path(reserved.path.clone(), reserved.uniquifier);
        }
        tracing::debug!("Download {} renaming to {:?}", id, reserved.path);
        self.file_manager
            .rename_completing_download_file(id, reserved.path, reserved.uniquifier, false);
    }

    fn on_download_renamed_to_final_name(&mut self, id: DownloadId, path: PathBuf, uniquifier: u32) {
        let Some(item) = self.items.get_mut(&id) else {
            return;
        };
        if !item.is_in_progress() {
            return;
        }
        self.file_manager.complete_download(id);
        if item.target_path() != path {
            item.set_target_path(path.clone(), uniquifier);
        }
        item.set_current_path(path.clone());
        let handle = item.db_handle();
        let open_now = self.delegate.should_open_download(item);
        if !open_now {
            item.set_delegate_delayed_complete(true);
        }

        if let Some(history) = &self.history {
            history.update_download_path(handle, path);
        }
        self.sync_reservation(id);
        if open_now {
            self.download_completed(id);
        }
    }

    /// The delegate finished opening a download it held back
    pub fn delayed_download_opened(&mut self, id: DownloadId) {
        let Some(item) = self.items.get_mut(&id) else {
            return;
        };
        if !item.delegate_delayed_complete() {
            return;
        }
        item.delayed_download_opened();
        self.download_completed(id);
    }

    fn download_completed(&mut self, id: DownloadId) {
        let policy = &self.config.danger_policy;
        let Some(item) = self.items.get_mut(&id) else {
            return;
        };
        let open_by_extension = policy.should_auto_open(item.target_path());
        let action = item.completed(open_by_extension);
        if action == CompletionAction::Refused {
            return;
        }
        tracing::info!("Download {} complete: {:?}", id, item.target_path());

        let open = action == CompletionAction::Open && item.open_download();
        let path = item.current_path().to_path_buf();
        self.active.remove(&id);
        self.persist(id);
        self.sync_reservation(id);
        if open {
            self.delegate.open_item(&path);
        }
    }

    /// Cancel an in-progress download at the user's request
    pub fn cancel_download(&mut self, id: DownloadId) -> bool {
        let Some(item) = self.items.get_mut(&id) else {
            return false;
        };
        // The file already sits at its final name
        if item.delegate_delayed_complete() {
            tracing::debug!("Download {} is waiting on its opener, not cancelling", id);
            return false;
        }
        if !item.cancel(true) {
            return false;
        }
        tracing::info!("Download {} cancelled", id);
        self.finish_early(id);
        true
    }

    /// The file worker failed
    pub fn on_download_error(&mut self, id: DownloadId, bytes_so_far: i64, reason: InterruptReason) {
        if !self.active.contains(&id) {
            return;
        }
        let Some(item) = self.items.get_mut(&id) else {
            return;
        };
        let hash_state = item.hash_state().to_string();
        if !item.interrupt(bytes_so_far, &hash_state, reason) {
            return;
        }
        tracing::warn!("Download {} interrupted: {}", id, reason);
        self.finish_early(id);
    }

    // Bookkeeping after cancel or interrupt. A download still waiting for
    // its history handle stays active; the handle reply finishes the job.
    fn finish_early(&mut self, id: DownloadId) {
        let awaiting_handle = self.in_progress.contains(&id)
            && self
                .items
                .get(&id)
                .is_some_and(|item| !item.db_handle().is_assigned());
        if !awaiting_handle {
            self.in_progress.remove(&id);
            self.active.remove(&id);
            self.persist(id);
        }
        self.pending_targets.remove(&id);
        self.ready_waiters.remove(&id);
        self.file_manager.cancel_download(id);
        self.sync_reservation(id);
    }

    /// Pause or resume writing. Returns false when nothing changed.
    pub fn pause_download(&mut self, id: DownloadId, pause: bool) -> bool {
        let Some(item) = self.items.get_mut(&id) else {
            return false;
        };
        if !item.is_in_progress() || item.is_paused() == pause {
            return false;
        }
        item.set_paused(pause);
        self.file_manager.pause_download(id, pause);
        true
    }

    pub fn toggle_pause(&mut self, id: DownloadId) -> bool {
        match self.items.get(&id) {
            Some(item) => self.pause_download(id, !item.is_paused()),
            None => false,
        }
    }
}
