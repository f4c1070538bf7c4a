//! Per-cell incremental sync engine.
//!
//! The transfer itself is delegated to the configured `SYNC_CMD` template;
//! this module owns the ordering and the signalling around it. A cell is
//! `.synced` only once a full mirror cycle has completed and the sequencer's
//! `final_summary*.txt` marker is present in the mirrored copy, so any reader
//! that sees the flag also sees a complete cell.

use thiserror::Error;
use tracing::{info, warn};

use crate::external::{env_bindings, CommandError, CommandRunner};
use crate::runlog::RunLog;
use crate::runs::{tfn_of, RunPaths};
use crate::touchfile::{CellFlag, RunFlag, TouchFileError, TouchStore};
use crate::upstream::{has_final_summary, UpstreamLocation};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    TouchFile(#[from] TouchFileError),
    #[error(transparent)]
    Command(#[from] CommandError),
}

#[derive(Debug, Default)]
pub struct SyncOutcome {
    /// Cells whose mirror completed and whose marker was present.
    pub synced: Vec<String>,
    /// Cells whose sync command failed this tick.
    pub failed: Vec<String>,
    /// Cells mirrored but still waiting for the sequencer's marker.
    pub waiting: Vec<String>,
}

impl SyncOutcome {
    pub fn fully_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct SyncEngine<'a> {
    pub sync_cmd: &'a str,
    pub runner: &'a dyn CommandRunner,
}

impl<'a> SyncEngine<'a> {
    /// Run the per-tick sync procedure for one run.
    ///
    /// `cells` are `<library>/<cell>` relative paths of every Pending or New
    /// cell; they are mirrored sequentially in lexicographic order and a
    /// failure on one cell does not stop the rest.
    pub async fn sync_run(
        &self,
        store: &TouchStore,
        paths: &RunPaths,
        upstream: &UpstreamLocation,
        upstream_dir: &str,
        cells: &[String],
        log: &mut RunLog,
    ) -> Result<SyncOutcome, SyncError> {
        // A fresh sync supersedes whatever the previous one recorded.
        store.clear(RunFlag::SyncDone)?;
        store.clear(RunFlag::SyncFailed)?;
        store.set(RunFlag::SyncStarted)?;

        let mut ordered: Vec<String> = cells.to_vec();
        ordered.sort();
        ordered.dedup();

        let upstream_path = format!(
            "{}/{}",
            upstream.path.trim_end_matches('/'),
            upstream_dir
        );
        let run_dir_full = paths.run_dir.to_string_lossy().into_owned();
        let run_rel = paths.run_rel.to_string_lossy().into_owned();

        let mut outcome = SyncOutcome::default();
        for cell in &ordered {
            log.line("sync", &format!("syncing cell {cell}"));
            let envs = env_bindings(&[
                ("upstream_host", upstream.host.as_deref().unwrap_or("")),
                ("upstream_path", &upstream_path),
                ("run", &paths.run_name),
                ("run_dir", &run_rel),
                ("run_dir_full", &run_dir_full),
                ("cell", cell),
            ]);
            let output = self.runner.run_template(self.sync_cmd, &envs).await?;
            log.command_output("sync", &output);

            if !output.success() {
                warn!(run = %paths.run_name, cell = %cell, status = output.status_code,
                      "cell sync failed");
                outcome.failed.push(cell.clone());
                continue;
            }

            let Some(tfn) = tfn_of(cell) else {
                outcome.failed.push(cell.clone());
                continue;
            };
            if has_final_summary(&paths.cell_dir(cell)) {
                store.set_cell(tfn, CellFlag::Synced)?;
                info!(run = %paths.run_name, cell = %cell, "cell synced and complete");
                outcome.synced.push(tfn.to_string());
            } else {
                // Mirror is current but the sequencer is still writing; the
                // cell stays Pending and the next tick picks it up again.
                log.line("sync", &format!("no final summary yet in {cell}"));
                outcome.waiting.push(cell.clone());
            }
        }

        if outcome.fully_succeeded() {
            store.set(RunFlag::SyncDone)?;
        } else {
            store.set(RunFlag::SyncFailed)?;
        }
        Ok(outcome)
    }
}

/// Post-completion deletion hook. Failure is logged and swallowed: losing
/// the cleanup never blocks a run from reaching complete.
pub async fn delete_remote_cells(
    runner: &dyn CommandRunner,
    delete_cmd: &str,
    paths: &RunPaths,
    upstream: &UpstreamLocation,
    upstream_dir: &str,
    cells: &[String],
    log: &mut RunLog,
) {
    let upstream_path = format!(
        "{}/{}",
        upstream.path.trim_end_matches('/'),
        upstream_dir
    );
    let envs = env_bindings(&[
        ("upstream_host", upstream.host.as_deref().unwrap_or("")),
        ("upstream_path", &upstream_path),
        ("run", &paths.run_name),
        ("cells", &cells.join(" ")),
    ]);
    match runner.run_template(delete_cmd, &envs).await {
        Ok(output) => {
            log.command_output("delete", &output);
            if output.success() {
                info!(run = %paths.run_name, "deleted remote cells");
            } else {
                warn!(run = %paths.run_name, status = output.status_code,
                      "remote cell deletion failed");
            }
        }
        Err(e) => {
            log.line("delete", &format!("deletion hook failed to run: {e}"));
            warn!(run = %paths.run_name, error = %e, "remote cell deletion failed to run");
        }
    }
}
