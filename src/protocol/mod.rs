//! Protocol types for dlpipe
//!
//! This module contains all types that cross the manager boundary:
//! - Identifiers and lifecycle enums
//! - Creation info handed over by the network layer
//! - Records persisted in the history store
//! - Events and snapshots emitted by the manager
//!
//! These types are designed for serialization and can be used for IPC,
//! RPC, or any message-passing interface.

mod create_info;
mod events;
mod interrupt;
mod status;
mod store_info;
mod types;

// Re-export all protocol types
pub use create_info::{DownloadCreateInfo, DownloadSaveInfo};
pub use events::DownloadEvent;
pub use interrupt::{DeleteReason, InterruptReason};
pub use status::DownloadSnapshot;
pub use store_info::PersistentStoreInfo;
pub use types::{
    DangerCheckState, DangerType, DownloadId, DownloadState, PageTransition, SafetyState,
    StoreHandle, TargetDisposition,
};
