//! Manager configuration
//!
//! This module contains all configuration options for the download manager.

use crate::danger::DangerPolicy;
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the download manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Default directory to save downloads. Created on demand.
    pub download_dir: PathBuf,

    /// Directory offered when the chosen directory is not writable
    pub fallback_dir: Option<PathBuf>,

    /// Always ask the user where to save
    pub prompt_for_download: bool,

    /// Largest " (N)" suffix tried before giving up on uniquifying a name
    pub max_unique_files: u32,

    /// Suffix appended to files while they are still being written
    pub intermediate_suffix: String,

    /// Minimum interval between progress reports from the file layer
    pub progress_interval_ms: u64,

    /// How long to wait for a danger-check verdict before treating the
    /// download as safe
    pub danger_check_timeout_ms: u64,

    /// Chunks a single download may have queued for writing
    pub max_buffered_chunks: usize,

    /// Compute a SHA-256 of every file
    pub calculate_hash: bool,

    /// Off-the-record: nothing is written to the history store
    pub off_the_record: bool,

    /// File types that open automatically and trusted extension sources
    pub danger_policy: DangerPolicy,

    /// Database path for download history
    pub database_path: Option<PathBuf>,

    /// Default user agent
    pub user_agent: String,

    /// HTTP configuration
    pub http: HttpConfig,
}

/// HTTP-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Connection timeout in seconds
    pub connect_timeout: u64,

    /// Read timeout in seconds
    pub read_timeout: u64,

    /// Maximum redirects to follow
    pub max_redirects: usize,

    /// Whether to accept invalid TLS certificates (dangerous!)
    pub accept_invalid_certs: bool,

    /// Proxy URL (e.g., "http://proxy:8080" or "socks5://proxy:1080")
    pub proxy_url: Option<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            download_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from("downloads")),
            fallback_dir: dirs::document_dir(),
            prompt_for_download: false,
            max_unique_files: 100,
            intermediate_suffix: "crdownload".to_string(),
            progress_interval_ms: 500,
            danger_check_timeout_ms: 10_000,
            max_buffered_chunks: 32,
            calculate_hash: true,
            off_the_record: false,
            danger_policy: DangerPolicy::default(),
            database_path: None,
            user_agent: format!("dlpipe/{}", env!("CARGO_PKG_VERSION")),
            http: HttpConfig::default(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 30,
            read_timeout: 60,
            max_redirects: 10,
            accept_invalid_certs: false,
            proxy_url: None,
        }
    }
}

impl ManagerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the download directory
    pub fn download_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.download_dir = path.into();
        self
    }

    /// Set the fallback directory for unwritable targets
    pub fn fallback_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.fallback_dir = Some(path.into());
        self
    }

    /// Ask where to save every download
    pub fn prompt_for_download(mut self, prompt: bool) -> Self {
        self.prompt_for_download = prompt;
        self
    }

    /// Set the uniquifier limit
    pub fn max_unique_files(mut self, max: u32) -> Self {
        self.max_unique_files = max;
        self
    }

    /// Set the progress reporting interval
    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the danger-check timeout
    pub fn danger_check_timeout(mut self, timeout: Duration) -> Self {
        self.danger_check_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Enable or disable hashing
    pub fn calculate_hash(mut self, enabled: bool) -> Self {
        self.calculate_hash = enabled;
        self
    }

    /// Run without persisting history
    pub fn off_the_record(mut self, otr: bool) -> Self {
        self.off_the_record = otr;
        self
    }

    /// Set the danger policy
    pub fn danger_policy(mut self, policy: DangerPolicy) -> Self {
        self.danger_policy = policy;
        self
    }

    /// Set the user agent
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }

    /// Set the database path for history
    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    pub fn progress_interval_duration(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn danger_check_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.danger_check_timeout_ms)
    }

    /// Parse a JSON config; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| EngineError::io(path, "Failed to read config", e))?;
        Self::from_json(&json)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        // The directory itself is created lazily, but it can't be a file
        if self.download_dir.exists() && !self.download_dir.is_dir() {
            return Err(EngineError::invalid_input(
                "download_dir",
                format!("Path is not a directory: {:?}", self.download_dir),
            ));
        }

        if self.download_dir.as_os_str().is_empty() {
            return Err(EngineError::invalid_input("download_dir", "Must not be empty"));
        }

        if self.max_unique_files == 0 {
            return Err(EngineError::invalid_input(
                "max_unique_files",
                "Must be at least 1",
            ));
        }

        if self.max_buffered_chunks == 0 {
            return Err(EngineError::invalid_input(
                "max_buffered_chunks",
                "Must be at least 1",
            ));
        }

        let suffix = self.intermediate_suffix.as_str();
        if suffix.is_empty() || suffix.contains('/') || suffix.contains('\\') || suffix.contains('.') {
            return Err(EngineError::invalid_input(
                "intermediate_suffix",
                "Must be a bare extension without separators or dots",
            ));
        }

        Ok(())
    }
}
