//! Destination path reservation
//!
//! The tracker keeps the set of paths promised to live downloads. It is
//! owned by the control context; filesystem probes run on the blocking
//! pool against a snapshot of that set and report back. A probe result can
//! be stale by the time it arrives (another download reserved the same
//! name in between), in which case [`PathReservationTracker::finish`]
//! asks for another probe.

use crate::filename::{intermediate_path, with_uniquifier};
use crate::item::DownloadItem;
use crate::protocol::DownloadId;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// A request to reserve a destination
#[derive(Debug, Clone)]
pub struct ReservationRequest {
    pub id: DownloadId,
    pub candidate: PathBuf,
    pub default_dir: PathBuf,
    pub uniquify: bool,
    /// File the download itself is writing; it never blocks a name
    pub own_file: Option<PathBuf>,
    attempt: u32,
}

impl ReservationRequest {
    pub fn new(
        id: DownloadId,
        candidate: impl Into<PathBuf>,
        default_dir: impl Into<PathBuf>,
        uniquify: bool,
    ) -> Self {
        Self {
            id,
            candidate: candidate.into(),
            default_dir: default_dir.into(),
            uniquify,
            own_file: None,
            attempt: 0,
        }
    }

    pub fn own_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.own_file = Some(path.into());
        self
    }

    /// Probes already spent on this request
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Result of a reservation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedPath {
    /// The reserved path, or just the candidate's file name when the
    /// directory could not be verified
    pub path: PathBuf,
    /// False means the caller has to ask the user for a location
    pub verified: bool,
    /// The N in `name (N).ext`, 0 for the candidate itself
    pub uniquifier: u32,
}

/// What the filesystem probe found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// First name free both on disk and in the snapshot
    Free { path: PathBuf, uniquifier: u32 },
    /// Every name up to the limit is taken
    Exhausted,
    /// The directory is missing or not writable
    Unverified,
}

/// Filesystem work for one reservation. Runs off the control context.
#[derive(Debug)]
pub struct ReservationProbe {
    candidate: PathBuf,
    default_dir: PathBuf,
    uniquify: bool,
    own_file: Option<PathBuf>,
    reserved: HashSet<PathBuf>,
    max_unique_files: u32,
    intermediate_suffix: String,
}

impl ReservationProbe {
    /// Run the probe. Blocks on filesystem calls.
    pub fn run(&self) -> ProbeOutcome {
        let dir = match self.candidate.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => return ProbeOutcome::Unverified,
        };

        // Only the default directory is ever created on the caller's behalf
        if dir == self.default_dir && !dir.exists() {
            if let Err(e) = std::fs::create_dir_all(dir) {
                tracing::warn!("Failed to create download directory {:?}: {}", dir, e);
            }
        }

        if !is_writable_dir(dir) {
            tracing::debug!("Directory {:?} is not writable", dir);
            return ProbeOutcome::Unverified;
        }

        if !self.uniquify {
            return ProbeOutcome::Free {
                path: self.candidate.clone(),
                uniquifier: 0,
            };
        }

        for n in 0..=self.max_unique_files {
            let path = with_uniquifier(&self.candidate, n);
            if self.reserved.contains(&path) {
                continue;
            }
            if self.on_disk(&path) || self.on_disk(&intermediate_path(&path, &self.intermediate_suffix)) {
                continue;
            }
            return ProbeOutcome::Free {
                path,
                uniquifier: n,
            };
        }
        ProbeOutcome::Exhausted
    }

    fn on_disk(&self, path: &Path) -> bool {
        self.own_file.as_deref() != Some(path) && path.exists()
    }

    /// Run the probe on the blocking pool
    pub async fn run_blocking(self) -> ProbeOutcome {
        match tokio::task::spawn_blocking(move || self.run()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("Reservation probe panicked: {}", e);
                ProbeOutcome::Unverified
            }
        }
    }
}

fn is_writable_dir(dir: &Path) -> bool {
    dir.is_dir()
        && tempfile::Builder::new()
            .prefix(".dlpipe-probe-")
            .tempfile_in(dir)
            .is_ok()
}

/// Control-context registry of reserved destination paths
#[derive(Debug)]
pub struct PathReservationTracker {
    by_path: HashMap<PathBuf, DownloadId>,
    by_download: HashMap<DownloadId, PathBuf>,
    max_unique_files: u32,
    intermediate_suffix: String,
}

impl PathReservationTracker {
    pub fn new(max_unique_files: u32, intermediate_suffix: impl Into<String>) -> Self {
        Self {
            by_path: HashMap::new(),
            by_download: HashMap::new(),
            max_unique_files,
            intermediate_suffix: intermediate_suffix.into(),
        }
    }

    /// Build the filesystem probe for `request` against the current
    /// reservations held by other downloads
    pub fn probe(&self, request: &ReservationRequest) -> ReservationProbe {
        let reserved = self
            .by_path
            .iter()
            .filter(|(_, owner)| **owner != request.id)
            .map(|(path, _)| path.clone())
            .collect();
        ReservationProbe {
            candidate: request.candidate.clone(),
            default_dir: request.default_dir.clone(),
            uniquify: request.uniquify,
            own_file: request.own_file.clone(),
            reserved,
            max_unique_files: self.max_unique_files,
            intermediate_suffix: self.intermediate_suffix.clone(),
        }
    }

    /// Apply a probe result. Returns `None` when the probed name was
    /// reserved by someone else in the meantime and `request` must be
    /// probed again.
    pub fn finish(
        &mut self,
        request: &mut ReservationRequest,
        outcome: ProbeOutcome,
    ) -> Option<ReservedPath> {
        match outcome {
            ProbeOutcome::Unverified => {
                let base = request
                    .candidate
                    .file_name()
                    .map(PathBuf::from)
                    .unwrap_or_default();
                Some(ReservedPath {
                    path: base,
                    verified: false,
                    uniquifier: 0,
                })
            }
            ProbeOutcome::Exhausted => Some(self.unverified_candidate(request)),
            ProbeOutcome::Free { path, uniquifier } => {
                let taken = matches!(self.by_path.get(&path), Some(owner) if *owner != request.id);
                if taken && request.uniquify {
                    request.attempt += 1;
                    if request.attempt > self.max_unique_files {
                        return Some(self.unverified_candidate(request));
                    }
                    tracing::trace!(
                        "Reservation for {} lost race on {:?}, probing again",
                        request.id,
                        path
                    );
                    return None;
                }
                self.insert(request.id, path.clone());
                Some(ReservedPath {
                    path,
                    verified: true,
                    uniquifier,
                })
            }
        }
    }

    fn unverified_candidate(&self, request: &ReservationRequest) -> ReservedPath {
        ReservedPath {
            path: request.candidate.clone(),
            verified: false,
            uniquifier: 0,
        }
    }

    /// Probe and finish in a loop until the request settles
    pub async fn reserve(&mut self, mut request: ReservationRequest) -> ReservedPath {
        loop {
            let outcome = self.probe(&request).run_blocking().await;
            if let Some(reserved) = self.finish(&mut request, outcome) {
                return reserved;
            }
        }
    }

    fn insert(&mut self, id: DownloadId, path: PathBuf) {
        self.release(id);
        // Overwrite takes the path from any previous owner
        if let Some(previous) = self.by_path.insert(path.clone(), id) {
            if previous != id {
                self.by_download.remove(&previous);
            }
        }
        self.by_download.insert(id, path);
    }

    /// Drop whatever `id` has reserved
    pub fn release(&mut self, id: DownloadId) {
        if let Some(path) = self.by_download.remove(&id) {
            if self.by_path.get(&path) == Some(&id) {
                self.by_path.remove(&path);
            }
        }
    }

    /// The download's target moved; the reservation follows it. A download
    /// without a reservation (its first probe was unverified) takes one
    /// here.
    pub fn update_target(&mut self, id: DownloadId, path: &Path) {
        if self.by_download.get(&id).map(PathBuf::as_path) != Some(path) {
            self.insert(id, path.to_path_buf());
        }
    }

    /// Keep reservations in step with a download's state
    pub fn on_download_updated(&mut self, item: &DownloadItem) {
        if !item.is_in_progress() {
            self.release(item.id());
        } else if !item.target_path().as_os_str().is_empty() {
            self.update_target(item.id(), item.target_path());
        }
    }

    pub fn on_download_destroyed(&mut self, id: DownloadId) {
        self.release(id);
    }

    pub fn is_reserved(&self, path: &Path) -> bool {
        self.by_path.contains_key(path)
    }

    pub fn owner_of(&self, path: &Path) -> Option<DownloadId> {
        self.by_path.get(path).copied()
    }

    pub fn reserved_path(&self, id: DownloadId) -> Option<&Path> {
        self.by_download.get(&id).map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn ids(n: u32) -> Vec<DownloadId> {
        let domain = Uuid::new_v4();
        (1..=n).map(|i| DownloadId::new(domain, i)).collect()
    }

    fn tracker() -> PathReservationTracker {
        PathReservationTracker::new(100, "crdownload")
    }

    #[tokio::test]
    async fn existing_file_gets_uniquified() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("foo.txt"), b"x").unwrap();
        let id = ids(1)[0];

        let mut tracker = tracker();
        let reserved = tracker
            .reserve(ReservationRequest::new(
                id,
                dir.path().join("foo.txt"),
                dir.path(),
                true,
            ))
            .await;

        assert!(reserved.verified);
        assert_eq!(reserved.path, dir.path().join("foo (1).txt"));
        assert_eq!(reserved.uniquifier, 1);
        assert!(tracker.is_reserved(&reserved.path));
    }

    #[tokio::test]
    async fn partial_download_counts_as_taken() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("foo.txt.crdownload"), b"x").unwrap();

        let mut tracker = tracker();
        let reserved = tracker
            .reserve(ReservationRequest::new(
                ids(1)[0],
                dir.path().join("foo.txt"),
                dir.path(),
                true,
            ))
            .await;
        assert_eq!(reserved.path, dir.path().join("foo (1).txt"));
    }

    #[tokio::test]
    async fn concurrent_requests_get_distinct_paths() {
        let dir = tempdir().unwrap();
        let candidate = dir.path().join("report.pdf");
        let mut tracker = tracker();

        // Probe all before finishing any, so every probe sees the same
        // empty snapshot and has to be retried on collision.
        let mut pending: Vec<_> = ids(5)
            .into_iter()
            .map(|id| ReservationRequest::new(id, &candidate, dir.path(), true))
            .collect();
        let mut outcomes = Vec::new();
        for request in &pending {
            outcomes.push(tracker.probe(request).run_blocking().await);
        }

        let mut paths = HashSet::new();
        for (request, outcome) in pending.iter_mut().zip(outcomes) {
            let reserved = match tracker.finish(request, outcome) {
                Some(r) => r,
                None => tracker.reserve(request.clone()).await,
            };
            assert!(reserved.verified);
            assert!(paths.insert(reserved.path));
        }
        assert_eq!(paths.len(), 5);
        assert!(paths.contains(&candidate));
        assert!(paths.contains(&dir.path().join("report (4).pdf")));
    }

    #[tokio::test]
    async fn release_frees_path_for_reuse() {
        let dir = tempdir().unwrap();
        let candidate = dir.path().join("a.bin");
        let all = ids(2);
        let mut tracker = tracker();

        let first = tracker
            .reserve(ReservationRequest::new(all[0], &candidate, dir.path(), true))
            .await;
        assert_eq!(first.path, candidate);

        tracker.release(all[0]);
        assert!(!tracker.is_reserved(&candidate));

        let second = tracker
            .reserve(ReservationRequest::new(all[1], &candidate, dir.path(), true))
            .await;
        assert_eq!(second.path, candidate);
        assert_eq!(tracker.owner_of(&candidate), Some(all[1]));
    }

    #[tokio::test]
    async fn exhaustion_returns_unverified_original() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("x.txt"), b"").unwrap();
        std::fs::write(dir.path().join("x (1).txt"), b"").unwrap();
        std::fs::write(dir.path().join("x (2).txt"), b"").unwrap();

        let mut tracker = PathReservationTracker::new(2, "crdownload");
        let candidate = dir.path().join("x.txt");
        let reserved = tracker
            .reserve(ReservationRequest::new(ids(1)[0], &candidate, dir.path(), true))
            .await;
        assert!(!reserved.verified);
        assert_eq!(reserved.path, candidate);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn default_dir_is_created_but_others_are_not() {
        let root = tempdir().unwrap();
        let default_dir = root.path().join("Downloads");
        let mut tracker = tracker();

        let reserved = tracker
            .reserve(ReservationRequest::new(
                ids(1)[0],
                default_dir.join("f.txt"),
                &default_dir,
                true,
            ))
            .await;
        assert!(reserved.verified);
        assert!(default_dir.is_dir());

        let elsewhere = root.path().join("missing");
        let reserved = tracker
            .reserve(ReservationRequest::new(
                ids(1)[0],
                elsewhere.join("f.txt"),
                &default_dir,
                true,
            ))
            .await;
        assert!(!reserved.verified);
        assert_eq!(reserved.path, PathBuf::from("f.txt"));
        assert!(!elsewhere.exists());
    }

    #[tokio::test]
    async fn overwrite_reserves_exact_path() {
        let dir = tempdir().unwrap();
        let candidate = dir.path().join("keep.txt");
        std::fs::write(&candidate, b"old").unwrap();
        let all = ids(2);
        let mut tracker = tracker();

        let reserved = tracker
            .reserve(ReservationRequest::new(all[0], &candidate, dir.path(), false))
            .await;
        assert!(reserved.verified);
        assert_eq!(reserved.path, candidate);

        // A second overwrite request takes the path over
        let reserved = tracker
            .reserve(ReservationRequest::new(all[1], &candidate, dir.path(), false))
            .await;
        assert_eq!(reserved.path, candidate);
        assert_eq!(tracker.owner_of(&candidate), Some(all[1]));
        assert!(tracker.reserved_path(all[0]).is_none());
    }

    #[test]
    fn target_change_moves_reservation() {
        let all = ids(1);
        let mut tracker = tracker();
        tracker.insert(all[0], PathBuf::from("/d/old.txt"));
        tracker.update_target(all[0], Path::new("/d/new.txt"));
        assert!(!tracker.is_reserved(Path::new("/d/old.txt")));
        assert_eq!(tracker.owner_of(Path::new("/d/new.txt")), Some(all[0]));
    }

    #[test]
    fn target_change_reserves_when_nothing_was_held() {
        let all = ids(1);
        let mut tracker = tracker();
        tracker.update_target(all[0], Path::new("/d/chosen.txt"));
        assert_eq!(tracker.owner_of(Path::new("/d/chosen.txt")), Some(all[0]));
        assert_eq!(tracker.reserved_path(all[0]), Some(Path::new("/d/chosen.txt")));
    }

    #[tokio::test]
    async fn own_partial_file_does_not_block_its_name() {
        let dir = tempdir().unwrap();
        let partial = dir.path().join("tool.exe.crdownload");
        std::fs::write(&partial, b"MZ").unwrap();
        let all = ids(2);
        let mut tracker = tracker();

        let mine = tracker
            .reserve(
                ReservationRequest::new(all[0], dir.path().join("tool.exe"), dir.path(), true)
                    .own_file(&partial),
            )
            .await;
        assert_eq!(mine.path, dir.path().join("tool.exe"));

        // Anyone else still sees the partial file as taken
        tracker.release(all[0]);
        let theirs = tracker
            .reserve(ReservationRequest::new(
                all[1],
                dir.path().join("tool.exe"),
                dir.path(),
                true,
            ))
            .await;
        assert_eq!(theirs.path, dir.path().join("tool (1).exe"));
    }
}
