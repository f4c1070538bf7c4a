//! Per-cell status, decoded from touch files plus the remote inventory.

use serde::Serialize;

use crate::touchfile::{CellFlag, TouchStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CellStatus {
    /// Visible upstream, nothing known locally yet.
    New,
    /// Known locally and still present upstream, waiting for transfer.
    Pending,
    /// Mirrored and complete, waiting for processing.
    Ready,
    Processing,
    Processed,
    Failed,
    Aborted,
    /// Known locally but gone upstream and never synced. The usual cause is
    /// an unreachable upstream.
    Incomplete,
}

impl CellStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CellStatus::New => "new",
            CellStatus::Pending => "pending",
            CellStatus::Ready => "ready",
            CellStatus::Processing => "processing",
            CellStatus::Processed => "processed",
            CellStatus::Failed => "failed",
            CellStatus::Aborted => "aborted",
            CellStatus::Incomplete => "incomplete",
        }
    }
}

impl std::fmt::Display for CellStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the classifier observes about one cell.
#[derive(Debug, Clone)]
pub struct CellView {
    pub tfn: String,
    /// `<library>/<cellname>`, when known from disk or the inventory.
    pub relpath: Option<String>,
    pub in_upstream: bool,
    pub has_local_dir: bool,
}

/// Decode a cell's status. Pure over the observed flags; precedence is
/// aborted, done, failed, started, synced, then remote presence.
pub fn cell_status(store: &TouchStore, cell: &CellView) -> CellStatus {
    let tfn = &cell.tfn;
    if store.is_cell_set(tfn, CellFlag::Aborted) {
        return CellStatus::Aborted;
    }
    if store.is_cell_set(tfn, CellFlag::Done) {
        return CellStatus::Processed;
    }
    if store.is_cell_set(tfn, CellFlag::Failed) {
        return CellStatus::Failed;
    }
    if store.is_cell_set(tfn, CellFlag::Started) {
        return CellStatus::Processing;
    }
    if store.is_cell_set(tfn, CellFlag::Synced) {
        return CellStatus::Ready;
    }
    if cell.in_upstream {
        if cell.has_local_dir {
            CellStatus::Pending
        } else {
            CellStatus::New
        }
    } else {
        CellStatus::Incomplete
    }
}
