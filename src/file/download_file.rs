//! A single file being written by a download
//!
//! `DownloadFile` is only ever touched by the file worker task. It owns the
//! open handle and the running SHA-256 of everything written so far.

use crate::error::{EngineError, Result, StorageErrorKind};
use crate::filename::unconfirmed_name;
use crate::protocol::DownloadId;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use url::Url;

// Attempts at finding a free "Unconfirmed N" name before giving up
const UNCONFIRMED_ATTEMPTS: usize = 16;

/// Bytes per second for `bytes` written over `elapsed_ms`
pub fn speed_from(bytes: u64, elapsed_ms: u128) -> i64 {
    if elapsed_ms == 0 {
        return 0;
    }
    (bytes as u128 * 1000 / elapsed_ms).min(i64::MAX as u128) as i64
}

/// Per-download file writer
#[derive(Debug)]
pub struct DownloadFile {
    id: DownloadId,
    full_path: PathBuf,
    file: Option<File>,
    bytes_so_far: u64,
    hasher: Option<Sha256>,
    hash: Option<String>,
    started: Instant,
    finished: bool,
    cancelled: bool,
    detached: bool,
}

impl DownloadFile {
    /// Create a writer for `path`. Nothing touches the disk until
    /// [`initialize`](Self::initialize).
    pub fn new(id: DownloadId, path: impl Into<PathBuf>, calculate_hash: bool) -> Self {
        Self {
            id,
            full_path: path.into(),
            file: None,
            bytes_so_far: 0,
            hasher: calculate_hash.then(Sha256::new),
            hash: None,
            started: Instant::now(),
            finished: false,
            cancelled: false,
            detached: false,
        }
    }

    /// Create (or truncate) the file at the current path
    pub async fn initialize(&mut self) -> Result<()> {
        let file = File::create(&self.full_path)
            .await
            .map_err(|e| EngineError::io(&self.full_path, "Failed to create file", e))?;
        self.file = Some(file);
        self.started = Instant::now();
        tracing::debug!("Download {} writing to {:?}", self.id, self.full_path);
        Ok(())
    }

    /// Create a fresh `Unconfirmed N.<suffix>` file in `dir` and use it as
    /// the current path
    pub async fn initialize_unconfirmed(&mut self, dir: &Path, suffix: &str) -> Result<()> {
        let mut last_err = None;
        for _ in 0..UNCONFIRMED_ATTEMPTS {
            let n = rand::rng().random_range(0..1_000_000u32);
            let path = dir.join(unconfirmed_name(n, suffix));
            match OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(file) => {
                    self.full_path = path;
                    self.file = Some(file);
                    self.started = Instant::now();
                    tracing::debug!("Download {} writing to {:?}", self.id, self.full_path);
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    last_err = Some(e);
                }
                Err(e) => return Err(EngineError::io(&path, "Failed to create file", e)),
            }
        }
        Err(EngineError::storage(
            StorageErrorKind::AlreadyExists,
            dir,
            format!(
                "No free temporary name: {}",
                last_err.map(|e| e.to_string()).unwrap_or_default()
            ),
        ))
    }

    /// Append a chunk
    pub async fn append_data(&mut self, data: &[u8]) -> Result<()> {
        let file = match self.file.as_mut() {
            Some(file) if !self.finished => file,
            _ => {
                return Err(EngineError::InvalidState {
                    action: "write",
                    current_state: "closed".to_string(),
                })
            }
        };
        file.write_all(data)
            .await
            .map_err(|e| EngineError::io(&self.full_path, "Failed to write", e))?;
        self.bytes_so_far += data.len() as u64;
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(data);
        }
        Ok(())
    }

    /// Move the file to `new_path`.
    ///
    /// Works whether the file is still open or already finished. Refuses to
    /// replace an existing file unless `overwrite` is set.
    pub async fn rename(&mut self, new_path: &Path, overwrite: bool) -> Result<PathBuf> {
        if new_path == self.full_path {
            return Ok(new_path.to_path_buf());
        }

        let was_open = self.file.is_some();
        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .map_err(|e| EngineError::io(&self.full_path, "Failed to flush", e))?;
        }

        let moved = if overwrite {
            move_file(&self.full_path, new_path).await
        } else {
            move_file_no_replace(&self.full_path, new_path).await
        };
        if moved.is_ok() {
            tracing::debug!(
                "Download {} renamed {:?} -> {:?}",
                self.id,
                self.full_path,
                new_path
            );
            self.full_path = new_path.to_path_buf();
        }

        if was_open {
            let reopened = OpenOptions::new()
                .append(true)
                .open(&self.full_path)
                .await
                .map_err(|e| EngineError::io(&self.full_path, "Failed to reopen", e))?;
            self.file = Some(reopened);
        }

        moved.map(|_| self.full_path.clone())
    }

    /// Flush, close and finalize the hash. No more writes after this.
    pub async fn finish(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .map_err(|e| EngineError::io(&self.full_path, "Failed to flush", e))?;
            file.sync_all()
                .await
                .map_err(|e| EngineError::io(&self.full_path, "Failed to sync", e))?;
        }
        self.finished = true;
        self.hash = self.hasher.take().map(|h| hex::encode(h.finalize()));
        Ok(())
    }

    /// Close the handle and delete the partial file. Idempotent.
    pub async fn cancel(&mut self) {
        if self.cancelled || self.detached {
            return;
        }
        self.cancelled = true;
        self.file = None;
        self.hasher = None;
        match tokio::fs::remove_file(&self.full_path).await {
            Ok(()) => tracing::debug!("Download {} deleted {:?}", self.id, self.full_path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                "Download {} failed to delete {:?}: {}",
                self.id,
                self.full_path,
                e
            ),
        }
    }

    /// Hand the file over to the user; it will no longer be deleted by
    /// [`cancel`](Self::cancel)
    pub fn detach(&mut self) {
        self.file = None;
        self.detached = true;
    }

    /// Record where the file came from so scanners and the OS can treat it
    /// as downloaded content
    pub async fn annotate_with_source_information(
        &self,
        url: &Url,
        referrer: Option<&Url>,
    ) -> Result<()> {
        write_provenance(&self.full_path, url, referrer).await
    }

    /// Final hash; only available after [`finish`](Self::finish)
    pub fn hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }

    /// Hex digest of the bytes written so far, empty when hashing is off
    pub fn hash_state(&self) -> String {
        match (&self.hasher, &self.hash) {
            (Some(hasher), _) => hex::encode(hasher.clone().finalize()),
            (None, Some(hash)) => hash.clone(),
            (None, None) => String::new(),
        }
    }

    pub fn id(&self) -> DownloadId {
        self.id
    }

    pub fn full_path(&self) -> &Path {
        &self.full_path
    }

    pub fn bytes_so_far(&self) -> u64 {
        self.bytes_so_far
    }

    /// Average rate since the file was opened
    pub fn current_speed(&self) -> i64 {
        speed_from(self.bytes_so_far, self.started.elapsed().as_millis())
    }

    /// Still accepting writes
    pub fn in_progress(&self) -> bool {
        self.file.is_some() && !self.finished
    }
}

async fn move_file(from: &Path, to: &Path) -> Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            // Cross-device moves need a copy
            if tokio::fs::copy(from, to).await.is_ok() {
                if let Err(e) = tokio::fs::remove_file(from).await {
                    tracing::warn!("Copied {:?} but failed to remove it: {}", from, e);
                }
                Ok(())
            } else {
                Err(EngineError::io(to, "Failed to rename", rename_err))
            }
        }
    }
}

fn refuse_overwrite(to: &Path) -> EngineError {
    EngineError::storage(
        StorageErrorKind::AlreadyExists,
        to,
        "Refusing to overwrite existing file",
    )
}

// Creating the new name and checking that it is free happen in one step,
// so a file appearing at `to` is never replaced
async fn move_file_no_replace(from: &Path, to: &Path) -> Result<()> {
    match tokio::fs::hard_link(from, to).await {
        Ok(()) => {
            if let Err(e) = tokio::fs::remove_file(from).await {
                tracing::warn!("Linked {:?} but failed to remove it: {}", from, e);
            }
            return Ok(());
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Err(refuse_overwrite(to)),
        Err(e) => tracing::trace!("Hard link {:?} -> {:?} failed, copying: {}", from, to, e),
    }

    // Other device, or no hard links on this filesystem
    let mut dest = match OpenOptions::new().write(true).create_new(true).open(to).await {
        Ok(dest) => dest,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Err(refuse_overwrite(to)),
        Err(e) => return Err(EngineError::io(to, "Failed to rename", e)),
    };
    let copied = async {
        let mut source = File::open(from).await?;
        tokio::io::copy(&mut source, &mut dest).await?;
        dest.flush().await
    }
    .await;
    if let Err(e) = copied {
        drop(dest);
        let _ = tokio::fs::remove_file(to).await;
        return Err(EngineError::io(to, "Failed to rename", e));
    }
    drop(dest);
    if let Err(e) = tokio::fs::remove_file(from).await {
        tracing::warn!("Copied {:?} but failed to remove it: {}", from, e);
    }
    Ok(())
}

#[cfg(windows)]
async fn write_provenance(path: &Path, url: &Url, referrer: Option<&Url>) -> Result<()> {
    let mut stream = path.as_os_str().to_os_string();
    stream.push(":Zone.Identifier");
    let mut body = String::from("[ZoneTransfer]\r\nZoneId=3\r\n");
    if let Some(referrer) = referrer {
        body.push_str(&format!("ReferrerUrl={}\r\n", referrer));
    }
    body.push_str(&format!("HostUrl={}\r\n", url));
    tokio::fs::write(PathBuf::from(stream), body)
        .await
        .map_err(|e| EngineError::io(path, "Failed to write zone identifier", e))
}

#[cfg(not(windows))]
async fn write_provenance(path: &Path, url: &Url, referrer: Option<&Url>) -> Result<()> {
    tracing::trace!(
        "No provenance store for {:?} (source {}, referrer {:?})",
        path,
        url,
        referrer.map(Url::as_str)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn id() -> DownloadId {
        DownloadId::new(Uuid::new_v4(), 1)
    }

    #[tokio::test]
    async fn writes_and_hashes_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let mut file = DownloadFile::new(id(), &path, true);
        file.initialize().await.unwrap();

        file.append_data(b"Hello, ").await.unwrap();
        file.append_data(b"World!").await.unwrap();
        assert_eq!(file.bytes_so_far(), 13);
        assert!(file.hash().is_none());

        file.finish().await.unwrap();
        // SHA256 of "Hello, World!"
        assert_eq!(
            file.hash(),
            Some("dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f")
        );
        assert_eq!(std::fs::read(&path).unwrap(), b"Hello, World!");
        assert!(file.append_data(b"more").await.is_err());
    }

    #[tokio::test]
    async fn rename_mid_transfer_keeps_writing() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("a.crdownload");
        let second = dir.path().join("b.crdownload");
        let mut file = DownloadFile::new(id(), &first, false);
        file.initialize().await.unwrap();
        file.append_data(b"abc").await.unwrap();

        let renamed = file.rename(&second, false).await.unwrap();
        assert_eq!(renamed, second);
        assert!(!first.exists());

        file.append_data(b"def").await.unwrap();
        file.finish().await.unwrap();
        assert_eq!(std::fs::read(&second).unwrap(), b"abcdef");
        assert_eq!(file.hash_state(), "");
    }

    #[tokio::test]
    async fn rename_before_data_and_after_finish() {
        let dir = tempdir().unwrap();
        let mut file = DownloadFile::new(id(), dir.path().join("t0"), true);
        file.initialize().await.unwrap();
        file.rename(&dir.path().join("t1"), true).await.unwrap();
        file.append_data(b"x").await.unwrap();
        file.finish().await.unwrap();
        file.rename(&dir.path().join("final"), false).await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("final")).unwrap(), b"x");
    }

    #[tokio::test]
    async fn rename_without_overwrite_keeps_existing_file() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("taken.txt");
        std::fs::write(&target, b"keep me").unwrap();

        let mut file = DownloadFile::new(id(), dir.path().join("x.crdownload"), false);
        file.initialize().await.unwrap();
        file.append_data(b"new").await.unwrap();
        assert!(file.rename(&target, false).await.is_err());
        assert_eq!(std::fs::read(&target).unwrap(), b"keep me");

        // The handle survived the failed rename
        file.append_data(b"er").await.unwrap();
        file.finish().await.unwrap();
        assert_eq!(std::fs::read(file.full_path()).unwrap(), b"newer");
    }

    #[tokio::test]
    async fn finished_rename_without_overwrite_moves_to_free_name() {
        let dir = tempdir().unwrap();
        let partial = dir.path().join("x.crdownload");
        let target = dir.path().join("x.txt");

        let mut file = DownloadFile::new(id(), &partial, false);
        file.initialize().await.unwrap();
        file.append_data(b"done").await.unwrap();
        file.finish().await.unwrap();

        assert_eq!(file.rename(&target, false).await.unwrap(), target);
        assert_eq!(std::fs::read(&target).unwrap(), b"done");
        assert!(!partial.exists());

        // A file that showed up at the new name after any check is kept
        let late = dir.path().join("late.txt");
        std::fs::write(&late, b"late arrival").unwrap();
        let err = file.rename(&late, false).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Storage {
                kind: StorageErrorKind::AlreadyExists,
                ..
            }
        ));
        assert_eq!(std::fs::read(&late).unwrap(), b"late arrival");
        assert_eq!(std::fs::read(&target).unwrap(), b"done");
    }

    #[tokio::test]
    async fn cancel_deletes_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone.crdownload");
        let mut file = DownloadFile::new(id(), &path, true);
        file.initialize().await.unwrap();
        file.append_data(b"partial").await.unwrap();

        file.cancel().await;
        assert!(!path.exists());

        // Something else lands on the same path; a second cancel leaves it
        std::fs::write(&path, b"other").unwrap();
        file.cancel().await;
        assert!(path.exists());
    }

    #[tokio::test]
    async fn detached_files_survive_cancel() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("done.txt");
        let mut file = DownloadFile::new(id(), &path, false);
        file.initialize().await.unwrap();
        file.finish().await.unwrap();
        file.detach();
        file.cancel().await;
        assert!(path.exists());
    }

    #[tokio::test]
    async fn unconfirmed_names_are_fresh() {
        let dir = tempdir().unwrap();
        let mut a = DownloadFile::new(id(), PathBuf::new(), false);
        let mut b = DownloadFile::new(id(), PathBuf::new(), false);
        a.initialize_unconfirmed(dir.path(), "crdownload").await.unwrap();
        b.initialize_unconfirmed(dir.path(), "crdownload").await.unwrap();
        assert_ne!(a.full_path(), b.full_path());
        let name = a.full_path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("Unconfirmed "));
        assert!(name.ends_with(".crdownload"));
    }

    #[test]
    fn speed_formula() {
        assert_eq!(speed_from(1000, 0), 0);
        assert_eq!(speed_from(1000, 500), 2000);
        assert_eq!(speed_from(0, 10), 0);
    }
}
