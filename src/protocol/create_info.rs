//! Description of a download at the moment the network layer hands it off

use super::types::PageTransition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use url::Url;

/// Caller-provided instructions about where to save
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadSaveInfo {
    /// Explicit destination. A download with an explicit path is temporary:
    /// it overwrites the path and never shows up in user-facing lists.
    pub file_path: Option<PathBuf>,
    /// Name suggested by the page (e.g. the `download` attribute)
    pub suggested_name: Option<String>,
}

/// Everything known about a download when the response starts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadCreateInfo {
    /// Redirect chain, first entry is the original URL, last is the final one
    pub url_chain: Vec<Url>,
    pub referrer_url: Option<Url>,
    pub start_time: DateTime<Utc>,
    /// Expected size, 0 when unknown
    pub total_bytes: i64,
    pub has_user_gesture: bool,
    pub transition: PageTransition,
    pub content_disposition: Option<String>,
    pub mime_type: String,
    pub original_mime_type: String,
    pub referrer_charset: Option<String>,
    pub remote_address: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub save_info: DownloadSaveInfo,
    /// The request asked for a save dialog regardless of preferences
    pub prompt_user_for_save_location: bool,
}

impl DownloadCreateInfo {
    /// Create info for a download of `url` with no other metadata
    pub fn new(url: Url) -> Self {
        Self {
            url_chain: vec![url],
            referrer_url: None,
            start_time: Utc::now(),
            total_bytes: 0,
            has_user_gesture: false,
            transition: PageTransition::Link,
            content_disposition: None,
            mime_type: String::new(),
            original_mime_type: String::new(),
            referrer_charset: None,
            remote_address: None,
            etag: None,
            last_modified: None,
            save_info: DownloadSaveInfo::default(),
            prompt_user_for_save_location: false,
        }
    }

    /// Final URL after redirects
    pub fn url(&self) -> &Url {
        // `new` always seeds the chain and nothing removes entries
        &self.url_chain[self.url_chain.len() - 1]
    }

    /// URL the request was originally made for
    pub fn original_url(&self) -> &Url {
        &self.url_chain[0]
    }

    /// Set the referrer
    pub fn referrer(mut self, referrer: Url) -> Self {
        self.referrer_url = Some(referrer);
        self
    }

    /// Set the expected size
    pub fn total_bytes(mut self, total: i64) -> Self {
        self.total_bytes = total;
        self
    }

    /// Set the mime type (both current and original)
    pub fn mime_type(mut self, mime: impl Into<String>) -> Self {
        let mime = mime.into();
        self.original_mime_type = mime.clone();
        self.mime_type = mime;
        self
    }

    /// Set the Content-Disposition header value
    pub fn content_disposition(mut self, value: impl Into<String>) -> Self {
        self.content_disposition = Some(value.into());
        self
    }

    /// Mark the download as started by a user gesture
    pub fn user_gesture(mut self, gesture: bool) -> Self {
        self.has_user_gesture = gesture;
        self
    }

    /// Set the navigation transition
    pub fn transition(mut self, transition: PageTransition) -> Self {
        self.transition = transition;
        self
    }

    /// Save to an explicit path (temporary download)
    pub fn save_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.save_info.file_path = Some(path.into());
        self
    }

    /// Suggest a file name
    pub fn suggested_name(mut self, name: impl Into<String>) -> Self {
        self.save_info.suggested_name = Some(name.into());
        self
    }

    /// Ask for a save dialog
    pub fn prompt(mut self, prompt: bool) -> Self {
        self.prompt_user_for_save_location = prompt;
        self
    }

    /// Append a redirect hop
    pub fn redirected_to(mut self, url: Url) -> Self {
        self.url_chain.push(url);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_accessors() {
        let info = DownloadCreateInfo::new(Url::parse("http://a.example/x").unwrap())
            .redirected_to(Url::parse("http://b.example/y").unwrap());
        assert_eq!(info.original_url().host_str(), Some("a.example"));
        assert_eq!(info.url().host_str(), Some("b.example"));
    }

    #[test]
    fn builder_sets_mime_pair() {
        let info = DownloadCreateInfo::new(Url::parse("http://a.example/x").unwrap())
            .mime_type("application/pdf")
            .total_bytes(10);
        assert_eq!(info.mime_type, "application/pdf");
        assert_eq!(info.original_mime_type, "application/pdf");
        assert_eq!(info.total_bytes, 10);
    }
}
