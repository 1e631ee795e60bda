//! File-type and source-based danger classification
//!
//! Two independent signals mark a download dangerous: the file type of its
//! target (decided locally from the extension table below), and verdicts
//! from an optional [`DangerCheckService`] about the URL and the content
//! hash. Verdicts that do not arrive in time count as safe.

use crate::protocol::{DownloadCreateInfo, DownloadId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// How risky a file type is to open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DangerLevel {
    NotDangerous,
    /// Dangerous unless the user clicked a link on a site visited before
    AllowOnUserGesture,
    Dangerous,
}

// Lower-case, without the leading dot.
const ALWAYS_DANGEROUS: &[&str] = &["scr", "pif", "lnk", "inf", "reg", "scf", "url", "local"];

const ALLOW_ON_USER_GESTURE: &[&str] = &[
    "exe", "msi", "msp", "bat", "cmd", "com", "cpl", "hta", "jar", "js", "jse", "msc", "ps1",
    "ps2", "psc1", "vb", "vbe", "vbs", "ws", "wsc", "wsf", "wsh", "app", "command", "dmg",
    "pkg", "mpkg", "osx", "sh", "bash", "csh", "ksh", "deb", "rpm", "apk", "run", "py", "pl",
];

const EXTENSION_INSTALL_EXTENSIONS: &[&str] = &["crx"];
const EXTENSION_INSTALL_MIME: &str = "application/x-chrome-extension";
const USER_SCRIPT_SUFFIX: &str = ".user.js";

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Classify a target path by its extension
pub fn danger_level(path: &Path) -> DangerLevel {
    match extension_of(path) {
        Some(ext) if ALWAYS_DANGEROUS.contains(&ext.as_str()) => DangerLevel::Dangerous,
        Some(ext) if ALLOW_ON_USER_GESTURE.contains(&ext.as_str()) => {
            DangerLevel::AllowOnUserGesture
        }
        _ => DangerLevel::NotDangerous,
    }
}

/// Whether the download installs a browser extension or user script
pub fn is_extension_install(path: &Path, mime_type: &str) -> bool {
    if mime_type.eq_ignore_ascii_case(EXTENSION_INSTALL_MIME) {
        return true;
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if name.ends_with(USER_SCRIPT_SUFFIX) {
        return true;
    }
    matches!(extension_of(path), Some(ext) if EXTENSION_INSTALL_EXTENSIONS.contains(&ext.as_str()))
}

/// User preferences that feed into the danger decision
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DangerPolicy {
    /// Extensions (lower-case, no dot) the user chose to open automatically
    #[serde(default)]
    pub auto_open_extensions: Vec<String>,
    /// Hosts whose extension installs are trusted
    #[serde(default)]
    pub trusted_gallery_hosts: Vec<String>,
}

impl DangerPolicy {
    /// Whether files of this type open automatically once complete.
    /// Executables never do, whatever the preference says.
    pub fn should_auto_open(&self, path: &Path) -> bool {
        let Some(ext) = extension_of(path) else {
            return false;
        };
        if danger_level(path) != DangerLevel::NotDangerous {
            return false;
        }
        self.auto_open_extensions
            .iter()
            .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(&ext))
    }

    /// Whether `url` is served by a trusted extension gallery
    pub fn is_trusted_gallery(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        self.trusted_gallery_hosts
            .iter()
            .any(|h| h.eq_ignore_ascii_case(host))
    }
}

/// Target-side facts the danger decision needs
#[derive(Debug, Clone)]
pub struct TargetFacts {
    pub target_path: PathBuf,
    pub is_extension_install: bool,
}

/// Decide whether a download is dangerous based on its file type.
///
/// The first matching rule wins:
/// 1. typed into the address bar: safe
/// 2. extension install not from a trusted gallery: dangerous
/// 3. user gesture and auto-opened type: safe
/// 4. gesture-gated type: dangerous unless gesture and referrer visited before today
/// 5. always-dangerous type: dangerous
pub fn is_dangerous(
    info: &DownloadCreateInfo,
    target: &TargetFacts,
    policy: &DangerPolicy,
    visited_referrer_before: bool,
) -> bool {
    if info.transition.is_from_address_bar() {
        return false;
    }

    if target.is_extension_install && !policy.is_trusted_gallery(info.url()) {
        return true;
    }

    if info.has_user_gesture && policy.should_auto_open(&target.target_path) {
        return false;
    }

    match danger_level(&target.target_path) {
        DangerLevel::AllowOnUserGesture => !(info.has_user_gesture && visited_referrer_before),
        DangerLevel::Dangerous => true,
        DangerLevel::NotDangerous => false,
    }
}

/// Verdict returned by a [`DangerCheckService`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Safe,
    Dangerous,
}

/// What the URL check gets to see
#[derive(Debug, Clone)]
pub struct UrlCheckRequest {
    pub id: DownloadId,
    pub url_chain: Vec<Url>,
    pub referrer_url: Option<Url>,
}

/// What the content check gets to see
#[derive(Debug, Clone)]
pub struct ContentCheckRequest {
    pub id: DownloadId,
    pub url_chain: Vec<Url>,
    pub referrer_url: Option<Url>,
    pub path: PathBuf,
    /// Hex SHA-256 of the complete file
    pub hash: String,
    pub total_bytes: i64,
}

/// External reputation service (e.g. a safe-browsing backend)
#[async_trait]
pub trait DangerCheckService: Send + Sync {
    /// Classify the download's URL chain
    async fn check_download_url(&self, request: UrlCheckRequest) -> Verdict;

    /// Classify the downloaded content by hash
    async fn check_content(&self, request: ContentCheckRequest) -> Verdict;
}

/// Run a check, treating a timeout as [`Verdict::Safe`]
pub async fn verdict_or_safe<F>(timeout: Duration, check: F) -> Verdict
where
    F: std::future::Future<Output = Verdict>,
{
    match tokio::time::timeout(timeout, check).await {
        Ok(verdict) => verdict,
        Err(_) => {
            tracing::warn!("Danger check timed out after {:?}, assuming safe", timeout);
            Verdict::Safe
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PageTransition;

    fn info(url: &str) -> DownloadCreateInfo {
        DownloadCreateInfo::new(Url::parse(url).unwrap())
    }

    fn facts(path: &str) -> TargetFacts {
        let path = PathBuf::from(path);
        TargetFacts {
            is_extension_install: is_extension_install(&path, ""),
            target_path: path,
        }
    }

    #[test]
    fn levels_by_extension() {
        assert_eq!(danger_level(Path::new("a.txt")), DangerLevel::NotDangerous);
        assert_eq!(danger_level(Path::new("a.EXE")), DangerLevel::AllowOnUserGesture);
        assert_eq!(danger_level(Path::new("a.scr")), DangerLevel::Dangerous);
        assert_eq!(danger_level(Path::new("noext")), DangerLevel::NotDangerous);
    }

    #[test]
    fn address_bar_downloads_are_safe() {
        let info = info("http://example.com/a.scr").transition(PageTransition::Typed);
        assert!(!is_dangerous(&info, &facts("/d/a.scr"), &DangerPolicy::default(), false));
    }

    #[test]
    fn gesture_and_prior_visit_clear_executables() {
        let policy = DangerPolicy::default();
        let base = info("http://example.com/setup.exe");
        assert!(is_dangerous(&base, &facts("/d/setup.exe"), &policy, true));

        let with_gesture = base.clone().user_gesture(true);
        assert!(is_dangerous(&with_gesture, &facts("/d/setup.exe"), &policy, false));
        assert!(!is_dangerous(&with_gesture, &facts("/d/setup.exe"), &policy, true));
    }

    #[test]
    fn always_dangerous_ignores_gesture() {
        let info = info("http://example.com/x.scr").user_gesture(true);
        assert!(is_dangerous(&info, &facts("/d/x.scr"), &DangerPolicy::default(), true));
    }

    #[test]
    fn extension_installs_need_trusted_gallery() {
        let mut policy = DangerPolicy::default();
        let from_gallery = info("https://gallery.example/ext.crx");
        assert!(is_dangerous(&from_gallery, &facts("/d/ext.crx"), &policy, false));

        policy.trusted_gallery_hosts.push("gallery.example".to_string());
        assert!(!is_dangerous(&from_gallery, &facts("/d/ext.crx"), &policy, false));
    }

    #[test]
    fn auto_open_never_applies_to_executables() {
        let policy = DangerPolicy {
            auto_open_extensions: vec!["pdf".to_string(), "exe".to_string()],
            trusted_gallery_hosts: Vec::new(),
        };
        assert!(policy.should_auto_open(Path::new("doc.PDF")));
        assert!(!policy.should_auto_open(Path::new("setup.exe")));
        assert!(!policy.should_auto_open(Path::new("README")));
    }

    #[test]
    fn user_scripts_are_extension_installs() {
        assert!(is_extension_install(Path::new("/d/foo.user.js"), ""));
        assert!(is_extension_install(
            Path::new("/d/whatever.bin"),
            "application/x-chrome-extension"
        ));
        assert!(!is_extension_install(Path::new("/d/foo.js"), ""));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_verdicts_count_as_safe() {
        let verdict = verdict_or_safe(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Verdict::Dangerous
        })
        .await;
        assert_eq!(verdict, Verdict::Safe);
    }
}
