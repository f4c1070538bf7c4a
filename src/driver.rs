//! Driver orchestration: the cron-safe top-level loop.
//!
//! One invocation is one tick. The tick discovers runs locally and upstream,
//! provisions anything new, computes each run's status and dispatches at most
//! one action per run. Per-run work happens under an advisory lock and logs
//! into that run's own file; a lock held by a concurrent tick means skip, not
//! fail.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::PorepilotConfig;
use crate::external::{env_bindings, CommandRunner, ShellRunner};
use crate::runlog::RunLog;
use crate::runs::{classify, parse_run_name, BatchLayout, RunClass, RunPaths};
use crate::state::{
    action_for, cell_status, run_status, CellStatus, CellView, RunAction, RunStatus,
    StatusSnapshot,
};
use crate::sync::{delete_remote_cells, SyncEngine};
use crate::ticket::{
    notify_with_retry, CommandNotifier, LogNotifier, RetryConfig, TicketNotifier,
};
use crate::touchfile::{CellFlag, RunFlag, TouchStore};
use crate::upstream::{InventoryEntry, InventoryProbe, UpstreamLocation};

/// Errors that abort the whole tick. Everything else is contained at the
/// granularity of a single run.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("{0}")]
    Config(String),
}

/// One run's observed state, for the status subcommand.
#[derive(Debug)]
pub struct RunReport {
    pub name: String,
    pub class: RunClass,
    pub status: RunStatus,
    pub cells: Vec<(String, CellStatus)>,
}

pub struct Driver<'a> {
    cfg: &'a PorepilotConfig,
    runner: Arc<dyn CommandRunner>,
    notifier: Arc<dyn TicketNotifier>,
    retry: RetryConfig,
}

impl<'a> Driver<'a> {
    pub fn new(cfg: &'a PorepilotConfig) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner);
        let notifier: Arc<dyn TicketNotifier> = match &cfg.ticket_cmd {
            Some(template) => Arc::new(CommandNotifier::new(template.clone(), ShellRunner)),
            None => Arc::new(LogNotifier),
        };
        Self::with_collaborators(cfg, runner, notifier)
    }

    /// Injection point for tests.
    pub fn with_collaborators(
        cfg: &'a PorepilotConfig,
        runner: Arc<dyn CommandRunner>,
        notifier: Arc<dyn TicketNotifier>,
    ) -> Self {
        Driver {
            cfg,
            runner,
            notifier,
            retry: RetryConfig::default(),
        }
    }

    /// Run one tick. Returns an error only for configuration problems; any
    /// per-run failure is logged, reported through the notifier and leaves
    /// the exit status untouched.
    pub async fn tick(&self) -> Result<(), DriverError> {
        let batch = self.check_roots()?;
        let upstream = self.cfg.upstream_location();
        let inventory = self.probe_upstream(&upstream).await;

        let mut remote: BTreeMap<String, Vec<InventoryEntry>> = BTreeMap::new();
        for entry in inventory {
            remote.entry(entry.experiment.clone()).or_default().push(entry);
        }

        let mut names: BTreeSet<String> = self.enumerate_local(batch).into_iter().collect();
        names.extend(remote.keys().cloned());
        info!(runs = names.len(), "tick started");

        for name in names {
            let remote_cells = remote.get(&name).map(Vec::as_slice).unwrap_or(&[]);
            if let Err(e) = self
                .handle_run(&name, batch, remote_cells, upstream.as_ref())
                .await
            {
                warn!(run = %name, error = %e, "run handling failed");
            }
        }
        Ok(())
    }

    /// Read-only variant of the tick, for the status subcommand.
    pub async fn reports(&self) -> Result<Vec<RunReport>, DriverError> {
        let batch = self.check_roots()?;
        let upstream = self.cfg.upstream_location();
        let inventory = self.probe_upstream(&upstream).await;

        let mut remote: BTreeMap<String, Vec<InventoryEntry>> = BTreeMap::new();
        for entry in inventory {
            remote.entry(entry.experiment.clone()).or_default().push(entry);
        }
        let mut names: BTreeSet<String> = self.enumerate_local(batch).into_iter().collect();
        names.extend(remote.keys().cloned());

        let mut reports = Vec::new();
        for name in names {
            let remote_cells = remote.get(&name).map(Vec::as_slice).unwrap_or(&[]);
            let paths = self.paths_for(&name, batch);
            let store = TouchStore::new(&paths.pipeline_dir);
            let (snapshot, cells) = self.observe(&paths, &store, remote_cells);
            reports.push(RunReport {
                name: name.clone(),
                class: classify(&name),
                status: run_status(&snapshot),
                cells: cells
                    .into_iter()
                    .map(|(tfn, view)| {
                        let status = cell_status(&store, &view);
                        (tfn, status)
                    })
                    .collect(),
            });
        }
        Ok(reports)
    }

    /// Probe the upstream inventory, if one is configured.
    pub async fn probe_upstream(
        &self,
        upstream: &Option<(String, UpstreamLocation)>,
    ) -> Vec<InventoryEntry> {
        match upstream {
            Some((key, location)) => {
                let probe = InventoryProbe {
                    location: location.clone(),
                    instrument: key.clone(),
                    connect_timeout_secs: self.cfg.connect_timeout,
                    runner: &*self.runner,
                };
                probe.scan().await
            }
            None => Vec::new(),
        }
    }

    fn check_roots(&self) -> Result<Option<BatchLayout>, DriverError> {
        for (label, value) in [
            ("RUNS_ROOT", &self.cfg.runs_root),
            ("OUTPUT_ROOT", &self.cfg.output_root),
        ] {
            if value.is_empty() {
                return Err(DriverError::Config(format!("{label} is not set")));
            }
            let path = Path::new(value);
            if !path.is_dir() {
                return Err(DriverError::Config(format!(
                    "{label} {value} is not a directory"
                )));
            }
            std::fs::read_dir(path).map_err(|e| {
                DriverError::Config(format!("{label} {value} is not readable: {e}"))
            })?;
            let probe = path.join(".porepilot.probe");
            std::fs::write(&probe, b"")
                .and_then(|_| std::fs::remove_file(&probe))
                .map_err(|e| {
                    DriverError::Config(format!("{label} {value} is not writable: {e}"))
                })?;
        }
        self.cfg.batch_layout().map_err(DriverError::Config)
    }

    fn paths_for(&self, name: &str, batch: Option<BatchLayout>) -> RunPaths {
        RunPaths::new(
            self.cfg.runs_root_path(),
            self.cfg.output_root_path(),
            batch,
            name,
        )
    }

    /// Local run directories matching the run-name pattern, including any
    /// year or month buckets.
    fn enumerate_local(&self, batch: Option<BatchLayout>) -> Vec<String> {
        let mut names = Vec::new();
        self.scan_dir_for_runs(self.cfg.runs_root_path(), batch.is_some(), &mut names);
        names
    }

    fn scan_dir_for_runs(&self, dir: &Path, descend_buckets: bool, names: &mut Vec<String>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if parse_run_name(&name).is_some() {
                names.push(name);
            } else if descend_buckets && is_bucket_name(&name) {
                self.scan_dir_for_runs(&entry.path(), false, names);
            }
        }
    }

    async fn handle_run(
        &self,
        name: &str,
        batch: Option<BatchLayout>,
        remote_cells: &[InventoryEntry],
        upstream: Option<&(String, UpstreamLocation)>,
    ) -> anyhow::Result<()> {
        let paths = self.paths_for(name, batch);
        let store = TouchStore::new(&paths.pipeline_dir);
        let class = classify(name);

        let newly_seen = !paths.pipeline_dir.exists();
        if newly_seen {
            self.provision(&paths, &class, remote_cells).await?;
        } else {
            self.persist_metadata(&paths, &class, remote_cells)?;
        }

        // One driver at a time per run. A held lock means another tick is
        // still working here; skip rather than wait.
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(paths.lock_file())?;
        let mut lock = fd_lock::RwLock::new(lock_file);
        let _guard = match lock.try_write() {
            Ok(guard) => guard,
            Err(_) => {
                info!(run = %name, "locked by another driver, skipping");
                return Ok(());
            }
        };

        let (snapshot, cells) = self.observe(&paths, &store, remote_cells);
        let status = run_status(&snapshot);
        debug!(run = %name, status = %status, cells = cells.len(), "run status");

        // Log sinks bind to this run, inside the loop body, and only once an
        // action actually produces output. Two runs discovered in one tick
        // must never share a file.
        match action_for(status) {
            RunAction::Sync => {
                self.do_sync(&paths, &store, remote_cells, upstream).await?;
            }
            RunAction::Process => {
                let mut log = RunLog::open(&paths.pipeline_log())?;
                self.do_process(&paths, &store, &class, &cells, remote_cells, upstream, &mut log)
                    .await?;
            }
            RunAction::Nothing => {
                if status == RunStatus::Stalled && !store.is_set(RunFlag::StallReported) {
                    let mut log = RunLog::open(&paths.pipeline_log())?;
                    log.line("stall", "no file updated within the stall window");
                    let body = format!(
                        "Run {name} has made no progress within {} hours.",
                        self.cfg.stall_time.unwrap_or_default()
                    );
                    if self
                        .notifier
                        .notify(name, self.cfg.queue_for(&class), "stalled", &body)
                        .await
                        .is_ok()
                    {
                        store.set(RunFlag::StallReported)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// First sighting of a run: create the directory skeleton, cross-link
    /// the output tree, persist classification and upstream, open a ticket.
    async fn provision(
        &self,
        paths: &RunPaths,
        class: &RunClass,
        remote_cells: &[InventoryEntry],
    ) -> anyhow::Result<()> {
        info!(run = %paths.run_name, class = %class, "new run");
        std::fs::create_dir_all(&paths.pipeline_dir)?;
        std::fs::create_dir_all(&paths.output_dir)?;

        let output_abs = std::path::absolute(&paths.output_dir)?;
        let run_abs = std::path::absolute(&paths.run_dir)?;
        ensure_symlink(&output_abs, &paths.output_link())?;
        ensure_symlink(&run_abs, &paths.rundata_link())?;
        copy_group(&paths.output_dir, &paths.pipeline_dir);

        self.persist_metadata(paths, class, remote_cells)?;

        let upstream_desc = remote_cells
            .first()
            .map(|e| e.upstream_path.clone())
            .unwrap_or_else(|| "LOCAL".to_string());
        let body = format!(
            "Run {} classified as {} ({} cells visible), upstream {}.",
            paths.run_name,
            class,
            remote_cells.len(),
            upstream_desc,
        );
        if let Err(e) = self
            .notifier
            .notify(
                &paths.run_name,
                self.cfg.queue_for(class),
                "new run",
                &body,
            )
            .await
        {
            // Transient: the run is provisioned either way and the ticket
            // backend gets another chance on a later transition.
            warn!(run = %paths.run_name, error = %e, "new-run notification failed");
        }
        Ok(())
    }

    /// Re-persist `type.yaml` and `upstream` when missing or out of date.
    fn persist_metadata(
        &self,
        paths: &RunPaths,
        class: &RunClass,
        remote_cells: &[InventoryEntry],
    ) -> anyhow::Result<()> {
        let type_yaml = serde_yaml::to_string(class)?;
        write_if_changed(&paths.type_yaml(), &type_yaml)?;

        let upstream_line = match remote_cells.first() {
            Some(entry) => format!("{}\n", entry.upstream_path),
            None if paths.upstream_file().exists() => return Ok(()),
            None => "LOCAL\n".to_string(),
        };
        write_if_changed(&paths.upstream_file(), &upstream_line)?;
        Ok(())
    }

    /// Gather every known cell and compute the run snapshot.
    fn observe(
        &self,
        paths: &RunPaths,
        store: &TouchStore,
        remote_cells: &[InventoryEntry],
    ) -> (StatusSnapshot, BTreeMap<String, CellView>) {
        let mut views: BTreeMap<String, CellView> = BTreeMap::new();

        for relpath in local_cell_dirs(&paths.run_dir) {
            if let Some(tfn) = crate::runs::tfn_of(&relpath) {
                views.insert(
                    tfn.to_string(),
                    CellView {
                        tfn: tfn.to_string(),
                        relpath: Some(relpath.clone()),
                        in_upstream: false,
                        has_local_dir: true,
                    },
                );
            }
        }
        for entry in remote_cells {
            if let Some(tfn) = crate::runs::tfn_of(&entry.cell) {
                views
                    .entry(tfn.to_string())
                    .and_modify(|v| {
                        v.in_upstream = true;
                        v.relpath.get_or_insert_with(|| entry.cell.clone());
                    })
                    .or_insert_with(|| CellView {
                        tfn: tfn.to_string(),
                        relpath: Some(entry.cell.clone()),
                        in_upstream: true,
                        has_local_dir: false,
                    });
            }
        }
        for tfn in store.known_tfns() {
            views.entry(tfn.clone()).or_insert(CellView {
                tfn,
                relpath: None,
                in_upstream: false,
                has_local_dir: false,
            });
        }

        let statuses: Vec<CellStatus> =
            views.values().map(|v| cell_status(store, v)).collect();
        let stalled = self.detect_stall(paths, store, &views);

        let snapshot = StatusSnapshot {
            pipeline_dir_exists: paths.pipeline_dir.is_dir(),
            aborted: store.is_set(RunFlag::Aborted),
            stripped: store.is_set(RunFlag::Stripped),
            failed: store.is_set(RunFlag::Failed),
            sync_in_progress: store.sync_in_progress(),
            output_dir_exists: paths.output_dir.is_dir(),
            cells: statuses,
            stalled,
        };
        (snapshot, views)
    }

    /// A run is stalled when stall detection is enabled and no file under
    /// any unfinished cell directory has changed within the window.
    fn detect_stall(
        &self,
        paths: &RunPaths,
        store: &TouchStore,
        views: &BTreeMap<String, CellView>,
    ) -> bool {
        let Some(hours) = self.cfg.stall_time else {
            return false;
        };
        let cutoff = SystemTime::now() - Duration::from_secs(hours * 3600);
        let mut measured = false;
        for view in views.values() {
            let status = cell_status(store, view);
            if !matches!(
                status,
                CellStatus::Pending | CellStatus::New | CellStatus::Incomplete
            ) {
                continue;
            }
            let Some(relpath) = &view.relpath else { continue };
            let dir = paths.cell_dir(relpath);
            if let Some(mtime) = newest_mtime(&dir) {
                measured = true;
                if mtime >= cutoff {
                    return false;
                }
            }
        }
        measured
    }

    async fn do_sync(
        &self,
        paths: &RunPaths,
        store: &TouchStore,
        remote_cells: &[InventoryEntry],
        upstream: Option<&(String, UpstreamLocation)>,
    ) -> anyhow::Result<()> {
        let Some((_, location)) = upstream else {
            warn!(run = %paths.run_name, "sync needed but no upstream is configured");
            return Ok(());
        };
        let Some(first) = remote_cells.first() else {
            warn!(run = %paths.run_name, "sync needed but the run is gone upstream");
            return Ok(());
        };

        // Sync wants only the cells still waiting for transfer.
        let mut targets = Vec::new();
        for entry in remote_cells {
            let Some(tfn) = crate::runs::tfn_of(&entry.cell) else {
                continue;
            };
            let view = CellView {
                tfn: tfn.to_string(),
                relpath: Some(entry.cell.clone()),
                in_upstream: true,
                has_local_dir: paths.cell_dir(&entry.cell).is_dir(),
            };
            if matches!(
                cell_status(store, &view),
                CellStatus::Pending | CellStatus::New
            ) {
                targets.push(entry.cell.clone());
            }
        }
        if targets.is_empty() {
            return Ok(());
        }

        // Sync output goes to the run's sync log, not the pipeline log.
        let mut sync_log = RunLog::open(&paths.sync_log())?;
        let engine = SyncEngine {
            sync_cmd: &self.cfg.sync_cmd,
            runner: &*self.runner,
        };
        let outcome = engine
            .sync_run(
                store,
                paths,
                location,
                &first.upstream_dir,
                &targets,
                &mut sync_log,
            )
            .await?;
        info!(
            run = %paths.run_name,
            synced = outcome.synced.len(),
            failed = outcome.failed.len(),
            waiting = outcome.waiting.len(),
            "sync finished"
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn do_process(
        &self,
        paths: &RunPaths,
        store: &TouchStore,
        class: &RunClass,
        cells: &BTreeMap<String, CellView>,
        remote_cells: &[InventoryEntry],
        upstream: Option<&(String, UpstreamLocation)>,
        log: &mut RunLog,
    ) -> anyhow::Result<()> {
        let ready: Vec<(String, String)> = cells
            .values()
            .filter(|v| cell_status(store, v) == CellStatus::Ready)
            .map(|v| {
                (
                    v.tfn.clone(),
                    v.relpath.clone().unwrap_or_else(|| v.tfn.clone()),
                )
            })
            .collect();
        if ready.is_empty() {
            return Ok(());
        }

        match class {
            RunClass::Test => {
                // Test runs sync but never process.
                for (tfn, _) in &ready {
                    log.line("process", &format!("test run, marking cell {tfn} done"));
                    store.set_cell(tfn, CellFlag::Started)?;
                    store.set_cell(tfn, CellFlag::Done)?;
                }
                Ok(())
            }
            RunClass::Visitor { uun } => {
                self.process_visitor(paths, store, uun, &ready, log).await
            }
            RunClass::Internal | RunClass::Unknown => {
                self.process_internal(
                    paths,
                    store,
                    class,
                    cells,
                    remote_cells,
                    upstream,
                    &ready,
                    log,
                )
                .await
            }
        }
    }

    /// Visitor runs never see the full workflow: checksum each newly-ready
    /// cell, then hand the whole batch to the delivery hook.
    async fn process_visitor(
        &self,
        paths: &RunPaths,
        store: &TouchStore,
        uun: &str,
        ready: &[(String, String)],
        log: &mut RunLog,
    ) -> anyhow::Result<()> {
        let queue = &self.cfg.ticket_queue_visitor;
        let run_dir_full = paths.run_dir.to_string_lossy().into_owned();

        for (tfn, relpath) in ready {
            store.set_cell(tfn, CellFlag::Started)?;
            if let Some(checksum_cmd) = &self.cfg.checksum_cmd {
                log.line("checksum", &format!("checksumming cell {relpath}"));
                let envs = env_bindings(&[
                    ("run", &paths.run_name),
                    ("run_dir_full", &run_dir_full),
                    ("cell", relpath),
                ]);
                let output = self.runner.run_template(checksum_cmd, &envs).await?;
                log.command_output("checksum", &output);
                if !output.success() {
                    store.set_cell(tfn, CellFlag::Failed)?;
                    self.report_failure(
                        paths,
                        store,
                        queue,
                        &format!("Checksum workflow failed for cell {relpath}"),
                    )
                    .await;
                    return Ok(());
                }
            }
        }

        let Some(delivery_cmd) = &self.cfg.delivery_cmd else {
            warn!(run = %paths.run_name, "visitor run ready but no delivery hook configured");
            return Ok(());
        };
        let cell_list: Vec<String> = ready.iter().map(|(_, rel)| rel.clone()).collect();
        let envs = env_bindings(&[
            ("run", &paths.run_name),
            ("run_dir_full", &run_dir_full),
            ("uun", uun),
            ("cells", &cell_list.join(" ")),
        ]);
        log.line("deliver", &format!("delivering {} cells to {uun}", cell_list.len()));
        let output = self.runner.run_template(delivery_cmd, &envs).await?;
        log.command_output("deliver", &output);

        if output.success() {
            for (tfn, _) in ready {
                store.set_cell(tfn, CellFlag::Done)?;
            }
            let body = format!(
                "Delivered cells {} of run {} to {uun}.",
                cell_list.join(" "),
                paths.run_name
            );
            if let Err(e) = self
                .notifier
                .notify(&paths.run_name, queue, "Delivered", &body)
                .await
            {
                warn!(run = %paths.run_name, error = %e, "delivery notification failed");
            }
        } else {
            self.report_failure(
                paths,
                store,
                queue,
                &format!("Delivery to {uun} failed for run {}", paths.run_name),
            )
            .await;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_internal(
        &self,
        paths: &RunPaths,
        store: &TouchStore,
        class: &RunClass,
        cells: &BTreeMap<String, CellView>,
        remote_cells: &[InventoryEntry],
        upstream: Option<&(String, UpstreamLocation)>,
        ready: &[(String, String)],
        log: &mut RunLog,
    ) -> anyhow::Result<()> {
        let queue = self.cfg.queue_for(class);
        let Some(process_cmd) = &self.cfg.process_cmd else {
            // Leave the cells Ready; a later tick retries once the engine is
            // configured.
            warn!(run = %paths.run_name, "cells ready but PROCESS_CMD is not configured");
            return Ok(());
        };

        let relpaths: Vec<String> = ready.iter().map(|(_, rel)| rel.clone()).collect();
        for (tfn, _) in ready {
            store.set_cell(tfn, CellFlag::Started)?;
        }
        let body = format!(
            "Processing cells {} of run {}.",
            relpaths.join(" "),
            paths.run_name
        );
        if let Err(e) = self
            .notifier
            .notify(&paths.run_name, queue, "processing", &body)
            .await
        {
            warn!(run = %paths.run_name, error = %e, "processing notification failed");
        }

        let run_dir_full = paths.run_dir.to_string_lossy().into_owned();
        let run_rel = paths.run_rel.to_string_lossy().into_owned();
        let envs = env_bindings(&[
            ("run", &paths.run_name),
            ("run_dir", &run_rel),
            ("run_dir_full", &run_dir_full),
            ("cells", &relpaths.join(" ")),
        ]);
        log.line("process", &format!("processing cells {}", relpaths.join(" ")));
        let output = self.runner.run_template(process_cmd, &envs).await?;
        log.command_output("process", &output);

        if !output.success() {
            for (tfn, _) in ready {
                store.set_cell(tfn, CellFlag::Failed)?;
            }
            self.report_failure(
                paths,
                store,
                queue,
                &format!(
                    "Workflow failed for cells {} of run {}, see {}",
                    relpaths.join(" "),
                    paths.run_name,
                    paths.pipeline_log().display()
                ),
            )
            .await;
            return Ok(());
        }

        for (tfn, relpath) in ready {
            store.set_cell(tfn, CellFlag::Done)?;
            let body = format!("Cell {relpath} of run {} processed.", paths.run_name);
            if let Err(e) = self
                .notifier
                .notify(
                    &paths.run_name,
                    queue,
                    &format!("Finished cell {tfn}"),
                    &body,
                )
                .await
            {
                warn!(run = %paths.run_name, error = %e, "finished-cell notification failed");
            }
        }

        // Was that the last of them? All non-aborted cells Processed means
        // the run can be reported and the upstream copies released.
        let all_done = cells.values().all(|v| {
            matches!(
                cell_status(store, v),
                CellStatus::Processed | CellStatus::Aborted
            )
        });
        if all_done {
            self.finalize_run(paths, store, queue, cells, remote_cells, upstream, log)
                .await;
        }
        Ok(())
    }

    /// Final reporting for a fully processed run, then the remote cleanup.
    /// The notification here is the one message operators rely on, so it is
    /// retried and its failure escalates to stderr for cron mail.
    #[allow(clippy::too_many_arguments)]
    async fn finalize_run(
        &self,
        paths: &RunPaths,
        store: &TouchStore,
        queue: &str,
        cells: &BTreeMap<String, CellView>,
        remote_cells: &[InventoryEntry],
        upstream: Option<&(String, UpstreamLocation)>,
        log: &mut RunLog,
    ) {
        let run = &paths.run_name;
        let cell_list = cells.keys().cloned().collect::<Vec<_>>().join(" ");
        let run_dir_full = paths.run_dir.to_string_lossy().into_owned();

        if let Some(report_cmd) = &self.cfg.report_cmd {
            let envs = env_bindings(&[
                ("run", run),
                ("run_dir_full", &run_dir_full),
                ("cells", &cell_list),
            ]);
            log.line("report", "producing aggregated report");
            match self.runner.run_template(report_cmd, &envs).await {
                Ok(output) => {
                    log.command_output("report", &output);
                    if !output.success() {
                        self.report_failure(
                            paths,
                            store,
                            queue,
                            &format!("Report generation failed for run {run}"),
                        )
                        .await;
                        return;
                    }
                }
                Err(e) => {
                    log.line("report", &format!("report command failed to run: {e}"));
                    self.report_failure(
                        paths,
                        store,
                        queue,
                        &format!("Report generation failed for run {run}: {e}"),
                    )
                    .await;
                    return;
                }
            }
        }

        let body = format!("All cells of run {run} processed: {cell_list}");
        match notify_with_retry(
            &*self.notifier,
            &self.retry,
            run,
            queue,
            "Finished all cells",
            &body,
        )
        .await
        {
            Ok(()) => {
                if self.cfg.del_remote_cells {
                    self.delete_upstream(paths, remote_cells, upstream, log).await;
                }
            }
            Err(e) => {
                // Escalate through stderr so cron mail carries it, and flag
                // the run; the deletion hook must not run for a run whose
                // completion was never reported.
                eprintln!("FAIL Reporting for cells {cell_list} of run {run}: {e}");
                if let Err(flag_err) = store.set(RunFlag::Failed) {
                    eprintln!("FAIL could not set failed flag for run {run}: {flag_err}");
                }
                if let Err(e2) = self
                    .notifier
                    .notify(run, queue, "failed", &format!("Reporting failed: {e}"))
                    .await
                {
                    eprintln!(
                        "FAIL Reporting for cells {cell_list} of run {run} \
                         and also failed to report the error via RT: {e2}"
                    );
                }
            }
        }
    }

    async fn delete_upstream(
        &self,
        paths: &RunPaths,
        remote_cells: &[InventoryEntry],
        upstream: Option<&(String, UpstreamLocation)>,
        log: &mut RunLog,
    ) {
        let Some(delete_cmd) = &self.cfg.delete_cmd else {
            debug!(run = %paths.run_name, "remote deletion enabled but DELETE_CMD unset");
            return;
        };
        let Some((_, location)) = upstream else {
            return;
        };
        let Some(first) = remote_cells.first() else {
            return;
        };
        let cells: Vec<String> = remote_cells.iter().map(|e| e.cell.clone()).collect();
        delete_remote_cells(
            &*self.runner,
            delete_cmd,
            paths,
            location,
            &first.upstream_dir,
            &cells,
            log,
        )
        .await;
    }

    /// Permanent failure: flag the run and tell the ticket backend. If even
    /// that fails, the error goes to stderr and the flag stays.
    async fn report_failure(
        &self,
        paths: &RunPaths,
        store: &TouchStore,
        queue: &str,
        context: &str,
    ) {
        warn!(run = %paths.run_name, context, "run failed");
        if let Err(e) = store.set(RunFlag::Failed) {
            eprintln!("FAIL could not set failed flag for run {}: {e}", paths.run_name);
        }
        if let Err(e) = self
            .notifier
            .notify(&paths.run_name, queue, "failed", context)
            .await
        {
            eprintln!(
                "FAIL {context} and also failed to report the error via RT: {e}"
            );
        }
    }
}

/// `YYYY` or `YYYY-MM` bucket directories.
fn is_bucket_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    match bytes.len() {
        4 => bytes.iter().all(u8::is_ascii_digit),
        7 => {
            bytes[..4].iter().all(u8::is_ascii_digit)
                && bytes[4] == b'-'
                && bytes[5..].iter().all(u8::is_ascii_digit)
        }
        _ => false,
    }
}

/// `<library>/<cell>` directories under a run, skipping `pipeline/`.
fn local_cell_dirs(run_dir: &Path) -> Vec<String> {
    let mut out = Vec::new();
    let Ok(libs) = std::fs::read_dir(run_dir) else {
        return out;
    };
    for lib in libs.flatten() {
        if !lib.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let Ok(lib_name) = lib.file_name().into_string() else {
            continue;
        };
        if lib_name == "pipeline" {
            continue;
        }
        let Ok(cells) = std::fs::read_dir(lib.path()) else {
            continue;
        };
        for cell in cells.flatten() {
            if !cell.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let Ok(cell_name) = cell.file_name().into_string() else {
                continue;
            };
            let relpath = format!("{lib_name}/{cell_name}");
            if crate::runs::parse_cell(&relpath).is_some() {
                out.push(relpath);
            }
        }
    }
    out.sort();
    out
}

/// Newest mtime of any file under a directory.
fn newest_mtime(dir: &Path) -> Option<SystemTime> {
    let mut newest: Option<SystemTime> = None;
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        let candidate = if path.is_dir() {
            newest_mtime(&path)
        } else {
            entry.metadata().ok().and_then(|m| m.modified().ok())
        };
        if let Some(t) = candidate {
            newest = Some(newest.map_or(t, |n| n.max(t)));
        }
    }
    newest
}

/// Create a symlink unless an equivalent one is already in place.
fn ensure_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(link) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            std::os::unix::fs::symlink(target, link)
        }
        Err(e) => Err(e),
    }
}

/// Match the pipeline directory's group to the output tree so downstream
/// tooling owned by the facility group can write there.
fn copy_group(from: &Path, to: &Path) {
    use std::os::unix::fs::MetadataExt;
    match std::fs::metadata(from) {
        Ok(meta) => {
            if let Err(e) = std::os::unix::fs::chown(to, None, Some(meta.gid())) {
                warn!(path = %to.display(), error = %e, "could not change group");
            }
        }
        Err(e) => warn!(path = %from.display(), error = %e, "could not stat output root"),
    }
}

/// Write a file only when its content differs, keeping mtimes quiet.
fn write_if_changed(path: &Path, content: &str) -> std::io::Result<()> {
    if let Ok(existing) = std::fs::read_to_string(path) {
        if existing == content {
            return Ok(());
        }
    }
    std::fs::write(path, content)
}
