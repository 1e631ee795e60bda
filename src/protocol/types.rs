//! Core protocol types
//!
//! Identifiers and the small enums that describe where a download is in
//! its lifecycle.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a download.
///
/// An id is a pair of the owning manager's domain and a per-manager
/// sequence number. Two managers never hand out the same id because their
/// domains differ, and one manager never reuses a sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DownloadId {
    domain: Uuid,
    local: u32,
}

impl DownloadId {
    /// Create an id from a manager domain and a sequence number
    pub fn new(domain: Uuid, local: u32) -> Self {
        Self { domain, local }
    }

    /// The domain of the manager that issued this id
    pub fn domain(&self) -> Uuid {
        self.domain
    }

    /// Sequence number within the domain
    pub fn local(&self) -> u32 {
        self.local
    }

    /// Short textual form used in logs: first 8 hex digits of the domain
    /// followed by the sequence number.
    pub fn to_short_string(&self) -> String {
        let simple = self.domain.simple().to_string();
        format!("{}:{}", &simple[..8], self.local)
    }
}

impl std::fmt::Display for DownloadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_short_string())
    }
}

/// Handle assigned by the history store to a persisted record.
///
/// `0` means "not yet assigned". Negative values are fake handles handed
/// out when the history store cannot persist the record (off-the-record
/// sessions or a store failure), so they never collide with real ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreHandle(i64);

impl StoreHandle {
    /// No handle assigned yet
    pub const UNINITIALIZED: StoreHandle = StoreHandle(0);

    pub fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> i64 {
        self.0
    }

    /// A handle has been assigned (real or fake)
    pub fn is_assigned(&self) -> bool {
        self.0 != 0
    }

    /// The handle was issued by the manager, not the history store
    pub fn is_fake(&self) -> bool {
        self.0 < 0
    }

    /// The record exists in the history store
    pub fn is_persisted(&self) -> bool {
        self.0 > 0
    }
}

impl Default for StoreHandle {
    fn default() -> Self {
        Self::UNINITIALIZED
    }
}

impl std::fmt::Display for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    /// Data is still being received or the download is not yet finalized
    InProgress,
    /// All data saved and the file is at its final name
    Complete,
    /// Cancelled by the user or by shutdown
    Cancelled,
    /// Stopped by a file or network error
    Interrupted,
    /// Being removed; the record is about to be destroyed
    Removing,
}

impl DownloadState {
    /// States a download never leaves
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }

    /// Stable string form used by the history store
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Cancelled => "cancelled",
            Self::Interrupted => "interrupted",
            Self::Removing => "removing",
        }
    }

    /// Parse the string form written by [`as_str`](Self::as_str)
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(Self::InProgress),
            "complete" => Some(Self::Complete),
            "cancelled" => Some(Self::Cancelled),
            "interrupted" => Some(Self::Interrupted),
            "removing" => Some(Self::Removing),
            _ => None,
        }
    }
}

impl std::fmt::Display for DownloadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the user must confirm before the file gets its final name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyState {
    Safe,
    /// Completion is held until the user validates the download
    Dangerous,
    /// The user accepted a dangerous download
    DangerousButValidated,
}

/// Why a download was flagged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DangerType {
    NotDangerous,
    /// The file type is risky
    DangerousFile,
    /// The source URL is known to be malicious
    DangerousUrl,
    /// The content hash was classified as malicious
    DangerousContent,
}

impl DangerType {
    /// Combine file and URL verdicts. A dangerous URL takes precedence over
    /// a dangerous file type.
    pub fn resolve(is_dangerous_file: bool, is_dangerous_url: bool) -> Self {
        if is_dangerous_url {
            Self::DangerousUrl
        } else if is_dangerous_file {
            Self::DangerousFile
        } else {
            Self::NotDangerous
        }
    }

    pub fn is_dangerous(&self) -> bool {
        !matches!(self, Self::NotDangerous)
    }
}

/// How the final target path was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetDisposition {
    /// Replace whatever is at the target path
    Overwrite,
    /// Append a " (N)" suffix until the path is free
    Uniquify,
    /// Ask the user where to save
    Prompt,
}

/// How the navigation that produced the download was initiated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageTransition {
    /// The user followed a link
    #[default]
    Link,
    /// The user typed the URL in the address bar
    Typed,
    /// A bookmark was opened
    AutoBookmark,
    /// A form was submitted
    FormSubmit,
    /// The page reloaded
    Reload,
    /// Anything else (scripts, redirects, APIs)
    Other,
}

impl PageTransition {
    /// The user explicitly asked for this URL from the address bar
    pub fn is_from_address_bar(&self) -> bool {
        matches!(self, Self::Typed)
    }
}

/// Progress of the content (hash) danger check for a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DangerCheckState {
    /// No check was requested
    #[default]
    NotRequested,
    /// A verdict is outstanding; completion waits for it
    Pending,
    /// The verdict arrived (or the check timed out)
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_from_different_domains_differ() {
        let a = DownloadId::new(Uuid::new_v4(), 1);
        let b = DownloadId::new(Uuid::new_v4(), 1);
        assert_ne!(a, b);
        assert_eq!(a.local(), b.local());
    }

    #[test]
    fn short_string_contains_sequence() {
        let id = DownloadId::new(Uuid::new_v4(), 42);
        let s = id.to_string();
        assert!(s.ends_with(":42"));
        assert_eq!(s.len(), 8 + 1 + 2);
    }

    #[test]
    fn store_handle_classes() {
        assert!(!StoreHandle::UNINITIALIZED.is_assigned());
        assert!(StoreHandle::new(-1).is_fake());
        assert!(!StoreHandle::new(-1).is_persisted());
        assert!(StoreHandle::new(7).is_persisted());
        assert!(StoreHandle::new(7).is_assigned());
    }

    #[test]
    fn dangerous_url_wins_over_dangerous_file() {
        assert_eq!(DangerType::resolve(true, true), DangerType::DangerousUrl);
        assert_eq!(DangerType::resolve(true, false), DangerType::DangerousFile);
        assert_eq!(DangerType::resolve(false, false), DangerType::NotDangerous);
    }

    #[test]
    fn state_string_form() {
        for state in [
            DownloadState::InProgress,
            DownloadState::Complete,
            DownloadState::Cancelled,
            DownloadState::Interrupted,
            DownloadState::Removing,
        ] {
            assert_eq!(DownloadState::parse(state.as_str()), Some(state));
        }
        assert!(DownloadState::parse("bogus").is_none());
        assert!(!DownloadState::InProgress.is_terminal());
        assert!(DownloadState::Cancelled.is_terminal());
    }
}
