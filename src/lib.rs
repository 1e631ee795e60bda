//! # dlpipe
//!
//! The download half of a browser: everything that happens to a response
//! once the network layer decides it is a download.
//!
//! ## Features
//!
//! - **Streamed writes**: bytes go to a temporary file while the final name
//!   is still being worked out
//! - **Safe names**: destinations are reserved so concurrent downloads
//!   never share a file, with `name (N).ext` uniquifying
//! - **Danger checks**: file-type rules plus an optional reputation service
//!   for URLs and content hashes
//! - **History**: every download is recorded (SQLite by default) and comes
//!   back after a restart
//! - **Async**: built on Tokio; file and history work never blocks the
//!   control loop
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dlpipe::{DownloadEngine, ManagerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ManagerConfig::default().download_dir("/tmp/downloads");
//!     let engine = DownloadEngine::new(config).await?;
//!
//!     let id = engine.download_url("https://example.com/file.zip").await?;
//!     let done = engine.wait_for(id).await?;
//!     println!("{:?} saved to {:?}", done.state, done.target_path);
//!
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

// Modules
pub mod config;
pub mod danger;
pub mod delegate;
pub mod engine;
pub mod error;
pub mod file;
pub mod filename;
pub mod history;
#[cfg(feature = "http")]
pub mod http;
pub mod item;
pub mod manager;
pub mod observer;
pub mod protocol;
pub mod reservation;
pub mod stream;

// Re-exports for convenience
pub use config::{HttpConfig, ManagerConfig};
pub use danger::{DangerCheckService, DangerPolicy, Verdict};
pub use delegate::{DefaultDelegate, DownloadManagerDelegate};
pub use engine::{DownloadEngine, EngineHooks};
pub use error::{EngineError, NetworkErrorKind, Result, StorageErrorKind};
pub use file::{DownloadFileManager, FileEvent, FileManagerConfig};
pub use item::DownloadItem;
pub use manager::DownloadManager;
pub use observer::{DownloadItemObserver, DownloadManagerObserver};
pub use protocol::{
    DangerType, DeleteReason, DownloadCreateInfo, DownloadEvent, DownloadId, DownloadSaveInfo,
    DownloadSnapshot, DownloadState, InterruptReason, PageTransition, PersistentStoreInfo,
    SafetyState, StoreHandle, TargetDisposition,
};
pub use reservation::PathReservationTracker;
pub use stream::ByteStream;

// History exports
#[cfg(feature = "storage")]
pub use history::SqliteHistory;
pub use history::{DownloadHistory, MemoryHistory};

// HTTP exports
#[cfg(feature = "http")]
pub use http::{DownloadRequest, HttpFetcher};
