//! Target determination
//!
//! From the moment a response is handed over until the download knows its
//! final name:
//!
//! 1. URL danger check and referrer lookup (background)
//! 2. name generation and file-type danger check
//! 3. path reservation (blocking pool, may retry)
//! 4. save prompt, if one is needed (delegate)
//! 5. attach: results recorded, file renamed to its intermediate name,
//!    history record added

use super::{ControlMessage, DownloadManager};
use crate::danger::{is_dangerous, is_extension_install, verdict_or_safe, TargetFacts, UrlCheckRequest, Verdict};
use crate::error::{EngineError, Result};
use crate::file::CreateFileRequest;
use crate::filename::{generate_file_name, intermediate_path};
use crate::history::DownloadHistory;
use crate::item::{DownloadItem, FileCheckResults};
use crate::protocol::{DownloadCreateInfo, DownloadEvent, DownloadId, TargetDisposition};
use crate::reservation::{ProbeOutcome, ReservationRequest};
use crate::stream::ByteStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Target inputs gathered while the download is still unattached
pub(super) struct PendingTarget {
    info: DownloadCreateInfo,
    suggested: PathBuf,
    prompt: bool,
    is_extension_install: bool,
    is_dangerous_file: bool,
    is_dangerous_url: bool,
    uniquifier: u32,
}

impl PendingTarget {
    fn new(info: DownloadCreateInfo) -> Self {
        let prompt = info.prompt_user_for_save_location;
        Self {
            info,
            suggested: PathBuf::new(),
            prompt,
            is_extension_install: false,
            is_dangerous_file: false,
            is_dangerous_url: false,
            uniquifier: 0,
        }
    }

    fn disposition(&self) -> TargetDisposition {
        if self.info.save_info.file_path.is_some() {
            TargetDisposition::Overwrite
        } else if self.prompt {
            TargetDisposition::Prompt
        } else {
            TargetDisposition::Uniquify
        }
    }
}

impl DownloadManager {
    /// Take over a response from the network layer.
    ///
    /// Bytes start flowing to a temporary file right away; the final name
    /// is worked out in the background.
    pub fn start_download(&mut self, info: DownloadCreateInfo, stream: ByteStream) -> Result<DownloadId> {
        if self.shut_down {
            return Err(EngineError::Shutdown);
        }
        if info.url_chain.is_empty() {
            return Err(EngineError::invalid_input("url_chain", "Download has no URL"));
        }

        let id = self.next_id();
        let mut item = DownloadItem::new(id, &info, self.config.off_the_record);
        item.add_observer(self.forwarder.clone());

        let dir = info
            .save_info
            .file_path
            .as_deref()
            .and_then(Path::parent)
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.download_dir.clone());
        let calculate_hash = self.config.calculate_hash && self.delegate.generate_file_hash();

        self.file_manager.create_download_file(CreateFileRequest {
            id,
            dir,
            calculate_hash,
            url: info.url().clone(),
            referrer: info.referrer_url.clone(),
            stream,
            sink: self.file_sink(),
        });

        tracing::info!("Download {} started: {}", id, info.url());
        self.items.insert(id, item);
        self.active.insert(id);
        let _ = self.events.send(DownloadEvent::Created { id });

        self.check_target_inputs(id, &info);
        self.pending_targets.insert(id, PendingTarget::new(info));
        Ok(id)
    }

    fn check_target_inputs(&self, id: DownloadId, info: &DownloadCreateInfo) {
        let tx = self.tx.clone();
        let service = self.danger_service.clone();
        let timeout = self.config.danger_check_timeout_duration();
        let history: Option<Arc<dyn DownloadHistory>> =
            self.writes_history().map(|history| history.store());
        let referrer = info.referrer_url.clone();
        let request = UrlCheckRequest {
            id,
            url_chain: info.url_chain.clone(),
            referrer_url: info.referrer_url.clone(),
        };

        tokio::spawn(async move {
            let is_dangerous_url = match service {
                Some(service) => {
                    verdict_or_safe(timeout, service.check_download_url(request)).await
                        == Verdict::Dangerous
                }
                None => false,
            };

            let visited_referrer_before = match (history, referrer) {
                (Some(history), Some(referrer)) => history
                    .check_visited_referrer_before(&referrer)
                    .await
                    .unwrap_or_else(|e| {
                        tracing::warn!("Referrer lookup for {} failed: {}", id, e);
                        false
                    }),
                _ => false,
            };

            let _ = tx.send(ControlMessage::TargetInputs {
                id,
                is_dangerous_url,
                visited_referrer_before,
            });
        });
    }

    pub(super) fn is_live(&self, id: DownloadId) -> bool {
        self.active.contains(&id)
            && self.items.get(&id).is_some_and(DownloadItem::is_in_progress)
    }

    pub(super) fn on_target_inputs(
        &mut self,
        id: DownloadId,
        is_dangerous_url: bool,
        visited_referrer_before: bool,
    ) {
        if !self.is_live(id) {
            self.pending_targets.remove(&id);
            return;
        }
        let Some(pending) = self.pending_targets.get_mut(&id) else {
            return;
        };
        let policy = &self.config.danger_policy;
        let info = &pending.info;
        pending.is_dangerous_url = is_dangerous_url;

        let is_extension = !info.prompt_user_for_save_location
            && is_extension_install(Path::new(info.url().path()), &info.mime_type);

        let forced = info.save_info.file_path.clone();
        let (suggested, uniquify) = match &forced {
            Some(path) => (path.clone(), false),
            None => {
                let name = generate_file_name(
                    info.url(),
                    info.content_disposition.as_deref(),
                    info.save_info.suggested_name.as_deref(),
                    &info.mime_type,
                );
                if self.config.prompt_for_download
                    && !is_extension
                    && !policy.should_auto_open(Path::new(&name))
                {
                    pending.prompt = true;
                }
                let dir = match (&self.last_download_path, pending.prompt) {
                    (Some(last), true) => last.clone(),
                    _ => self.config.download_dir.clone(),
                };
                (dir.join(name), !pending.prompt)
            }
        };

        if !pending.prompt && forced.is_none() {
            let facts = TargetFacts {
                target_path: suggested.clone(),
                is_extension_install: is_extension,
            };
            pending.is_dangerous_file =
                is_dangerous(&pending.info, &facts, policy, visited_referrer_before);
        }
        pending.is_extension_install = is_extension;
        pending.suggested = suggested.clone();

        tracing::debug!(
            "Download {} suggested {:?} (prompt {}, dangerous file {}, dangerous url {})",
            id,
            suggested,
            pending.prompt,
            pending.is_dangerous_file,
            pending.is_dangerous_url
        );

        let request =
            ReservationRequest::new(id, suggested, self.config.download_dir.clone(), uniquify);
        self.probe_reservation(request);
    }

    fn probe_reservation(&self, request: ReservationRequest) {
        let probe = self.reservations.probe(&request);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let outcome = probe.run_blocking().await;
            let _ = tx.send(ControlMessage::PathReserved { request, outcome });
        });
    }

    pub(super) fn on_path_reserved(&mut self, mut request: ReservationRequest, outcome: ProbeOutcome) {
        let id = request.id;
        if !self.is_live(id) {
            self.pending_targets.remove(&id);
            return;
        }
        let Some(reserved) = self.reservations.finish(&mut request, outcome) else {
            self.probe_reservation(request);
            return;
        };
        let Some(pending) = self.pending_targets.get_mut(&id) else {
            self.reservations.release(id);
            return;
        };

        let path = if reserved.verified {
            pending.uniquifier = reserved.uniquifier;
            reserved.path
        } else {
            tracing::debug!("Download {} has no usable location, asking the user", id);
            pending.prompt = true;
            match reserved.path.parent() {
                Some(dir) if !dir.as_os_str().is_empty() => reserved.path,
                _ => self
                    .config
                    .fallback_dir
                    .as_ref()
                    .unwrap_or(&self.config.download_dir)
                    .join(reserved.path),
            }
        };
        pending.suggested = path.clone();

        if pending.prompt {
            self.prompt_for_path(id, path);
        } else {
            self.attach_download_item(id, path);
        }
    }

    fn prompt_for_path(&self, id: DownloadId, suggested: PathBuf) {
        for observer in &self.observers {
            observer.select_file_dialog_displayed(id);
        }
        let delegate = self.delegate.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let path = delegate.choose_download_path(id, suggested).await;
            let _ = tx.send(ControlMessage::PathChosen { id, path });
        });
    }

    pub(super) fn on_path_chosen(&mut self, id: DownloadId, path: Option<PathBuf>) {
        if !self.is_live(id) {
            self.pending_targets.remove(&id);
            return;
        }
        match path {
            Some(path) => {
                if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
                    self.last_download_path = Some(dir.to_path_buf());
                }
                self.attach_download_item(id, path);
            }
            None => {
                tracing::info!("Save prompt for {} dismissed", id);
                self.cancel_download(id);
            }
        }
    }

    /// Record the final target and start the history record
    fn attach_download_item(&mut self, id: DownloadId, target: PathBuf) {
        let Some(pending) = self.pending_targets.remove(&id) else {
            tracing::warn!("Download {} attached without pending target", id);
            return;
        };
        let Some(item) = self.items.get_mut(&id) else {
            return;
        };

        item.set_file_check_results(FileCheckResults {
            target_path: target.clone(),
            path_uniquifier: pending.uniquifier,
            target_disposition: pending.disposition(),
            prompt_user_for_save_location: pending.prompt,
            is_extension_install: pending.is_extension_install,
            is_dangerous_file: pending.is_dangerous_file,
            is_dangerous_url: pending.is_dangerous_url,
        });

        let intermediate = intermediate_path(&target, &self.config.intermediate_suffix);
        self.file_manager
            .rename_in_progress_download_file(id, intermediate.clone());
        item.set_current_path(intermediate);
        let record = item.persistent_store_info();
        self.in_progress.insert(id);
        self.sync_reservation(id);

        tracing::info!("Download {} will be saved as {:?}", id, target);
        match self.writes_history() {
            Some(history) => history.add_entry(id, record),
            None => self.on_history_entry_created(id, None),
        }
    }
}
