//! Messages delivered to the control context
//!
//! Everything that happens off the control context (file I/O, history
//! writes, reservation probes, danger checks, user prompts) reports back
//! through one of these.

use crate::danger::Verdict;
use crate::file::FileEvent;
use crate::protocol::{DownloadId, PersistentStoreInfo, StoreHandle};
use crate::reservation::{ProbeOutcome, ReservationRequest};
use std::path::PathBuf;

#[derive(Debug)]
pub enum ControlMessage {
    /// Result from the file worker
    File(FileEvent),
    /// URL check and referrer lookup finished
    TargetInputs {
        id: DownloadId,
        is_dangerous_url: bool,
        visited_referrer_before: bool,
    },
    /// A reservation probe finished
    PathReserved {
        request: ReservationRequest,
        outcome: ProbeOutcome,
    },
    /// A probe for the final name of a completing download finished
    FinalPathReserved {
        request: ReservationRequest,
        outcome: ProbeOutcome,
    },
    /// The user answered the save prompt; `None` means dismissed
    PathChosen { id: DownloadId, path: Option<PathBuf> },
    /// History answered an add; `None` means the store failed
    HistoryEntryCreated {
        id: DownloadId,
        handle: Option<StoreHandle>,
    },
    /// Startup history query finished
    HistoryLoaded(Vec<PersistentStoreInfo>),
    /// Content check finished
    ContentChecked { id: DownloadId, verdict: Verdict },
    /// Existence check of a completed download's file
    FileExistence { id: DownloadId, exists: bool },
}
