//! Run-level status, derived once per tick from the cell statuses and the
//! master flags.
//!
//! The rules form an ordered decision table and the ordering is load-bearing:
//! processing outranks starting a new sync because a ready cell produces
//! user-visible artifacts faster than a fresh transfer does. Keep the table
//! a table; do not refactor it into nested conditionals.

use serde::Serialize;

use super::cell::CellStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    New,
    Aborted,
    Stripped,
    Failed,
    Complete,
    Syncing,
    Unknown,
    ProcessingSyncing,
    ProcessingSyncNeeded,
    Processing,
    CellReady,
    SyncNeeded,
    Incomplete,
    Stalled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::New => "new",
            RunStatus::Aborted => "aborted",
            RunStatus::Stripped => "stripped",
            RunStatus::Failed => "failed",
            RunStatus::Complete => "complete",
            RunStatus::Syncing => "syncing",
            RunStatus::Unknown => "unknown",
            RunStatus::ProcessingSyncing => "processing_syncing",
            RunStatus::ProcessingSyncNeeded => "processing_sync_needed",
            RunStatus::Processing => "processing",
            RunStatus::CellReady => "cell_ready",
            RunStatus::SyncNeeded => "sync_needed",
            RunStatus::Incomplete => "incomplete",
            RunStatus::Stalled => "stalled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the driver should do with a run this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunAction {
    /// Launch processing for all ready cells, then report if that was the
    /// last of them.
    Process,
    /// Launch a sync of every pending or new cell.
    Sync,
    Nothing,
}

/// One tick's observation of a run, gathered before any action is taken.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub pipeline_dir_exists: bool,
    pub aborted: bool,
    pub stripped: bool,
    pub failed: bool,
    pub sync_in_progress: bool,
    pub output_dir_exists: bool,
    /// Status of every known cell, aborted ones included.
    pub cells: Vec<CellStatus>,
    /// Stall detection outcome, false when detection is disabled.
    pub stalled: bool,
}

impl StatusSnapshot {
    fn live_cells(&self) -> impl Iterator<Item = CellStatus> + '_ {
        self.cells
            .iter()
            .copied()
            .filter(|c| *c != CellStatus::Aborted)
    }

    fn all_processed(&self) -> bool {
        !self.cells.is_empty() && self.live_cells().all(|c| c == CellStatus::Processed)
    }

    fn any(&self, wanted: CellStatus) -> bool {
        self.live_cells().any(|c| c == wanted)
    }

    fn any_unsynced(&self) -> bool {
        self.any(CellStatus::Pending) || self.any(CellStatus::New)
    }
}

type Rule = (&'static str, fn(&StatusSnapshot) -> bool, RunStatus);

/// The decision table, evaluated top-down; the first matching rule wins.
static RULES: &[Rule] = &[
    ("no pipeline dir", |s| !s.pipeline_dir_exists, RunStatus::New),
    ("master aborted", |s| s.aborted, RunStatus::Aborted),
    ("master stripped", |s| s.stripped, RunStatus::Stripped),
    ("master failed", |s| s.failed, RunStatus::Failed),
    (
        "all processed, sync still running",
        |s| s.all_processed() && s.sync_in_progress,
        RunStatus::Syncing,
    ),
    ("all processed", |s| s.all_processed(), RunStatus::Complete),
    (
        "output dir missing",
        |s| !s.output_dir_exists,
        RunStatus::Unknown,
    ),
    (
        "processing with unsynced cells, sync running",
        |s| s.any(CellStatus::Processing) && s.any_unsynced() && s.sync_in_progress,
        RunStatus::ProcessingSyncing,
    ),
    (
        "processing with unsynced cells",
        |s| s.any(CellStatus::Processing) && s.any_unsynced(),
        RunStatus::ProcessingSyncNeeded,
    ),
    (
        "processing, sync running",
        |s| s.any(CellStatus::Processing) && s.sync_in_progress,
        RunStatus::ProcessingSyncing,
    ),
    (
        "processing",
        |s| s.any(CellStatus::Processing),
        RunStatus::Processing,
    ),
    (
        "cell ready",
        |s| s.any(CellStatus::Ready),
        RunStatus::CellReady,
    ),
    ("sync running", |s| s.sync_in_progress, RunStatus::Syncing),
    ("unsynced cells", |s| s.any_unsynced(), RunStatus::SyncNeeded),
    (
        "incomplete cells",
        |s| s.any(CellStatus::Incomplete),
        RunStatus::Incomplete,
    ),
    (
        "failed cells",
        |s| s.any(CellStatus::Failed),
        RunStatus::Failed,
    ),
];

/// Compute the run status for one snapshot.
///
/// A detected stall downgrades the waiting statuses only; runs that are
/// processing, complete or flagged keep their status and the operator decides
/// what to do with the stalled transfer.
pub fn run_status(snapshot: &StatusSnapshot) -> RunStatus {
    let mut status = RunStatus::Unknown;
    for (name, applies, outcome) in RULES {
        if applies(snapshot) {
            tracing::trace!(rule = name, status = outcome.as_str(), "status rule matched");
            status = *outcome;
            break;
        }
    }
    if snapshot.stalled
        && matches!(
            status,
            RunStatus::SyncNeeded | RunStatus::Syncing | RunStatus::Incomplete
        )
    {
        return RunStatus::Stalled;
    }
    status
}

/// Map a status to this tick's action.
pub fn action_for(status: RunStatus) -> RunAction {
    match status {
        RunStatus::CellReady => RunAction::Process,
        RunStatus::SyncNeeded | RunStatus::ProcessingSyncNeeded => RunAction::Sync,
        RunStatus::New
        | RunStatus::Aborted
        | RunStatus::Stripped
        | RunStatus::Failed
        | RunStatus::Complete
        | RunStatus::Syncing
        | RunStatus::Unknown
        | RunStatus::ProcessingSyncing
        | RunStatus::Processing
        | RunStatus::Incomplete
        | RunStatus::Stalled => RunAction::Nothing,
    }
}
