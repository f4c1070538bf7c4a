//! End-to-end driver tests.
//!
//! These run the real binary against a sandboxed runs/output/upstream tree,
//! with every external collaborator replaced by a small shell stub that
//! records its invocation into a log file.

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const CELL_A: &str = "testlib/20190226_1723_2-A5-D5_PAD38578_c6ded78b";
const TFN_A: &str = "20190226_1723_2-A5-D5_PAD38578_c6ded78b";
const CELL_B: &str = "testlib/20190227_1010_1-B2-C3_PAD00001_0123abcd";
const TFN_B: &str = "20190227_1010_1-B2-C3_PAD00001_0123abcd";

const COPY_CMD: &str = r#"mkdir -p "$run_dir_full/$cell" && cp -R "$upstream_path/$cell/." "$run_dir_full/$cell/""#;
const TICKET_CMD: &str = r#"printf '%s|%s|%s\n' "$run" "$queue" "$subject" >> "$TICKET_LOG""#;

/// Sandbox with the two local roots, an upstream tree and stub collaborators.
struct DriverSandbox {
    tmp: TempDir,
}

impl DriverSandbox {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        for dir in ["runs", "out", "upstream"] {
            std::fs::create_dir_all(tmp.path().join(dir)).unwrap();
        }
        DriverSandbox { tmp }
    }

    fn runs(&self) -> PathBuf {
        self.tmp.path().join("runs")
    }

    fn out(&self) -> PathBuf {
        self.tmp.path().join("out")
    }

    fn upstream(&self) -> PathBuf {
        self.tmp.path().join("upstream")
    }

    fn ticket_log(&self) -> PathBuf {
        self.tmp.path().join("tickets.log")
    }

    fn add_upstream_cell(&self, experiment: &str, cell: &str, finished: bool) {
        let dir = self.upstream().join(experiment).join(cell);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("reads.blow5"), b"signal").unwrap();
        if finished {
            std::fs::write(dir.join("final_summary_PAD38578_0.txt"), b"done").unwrap();
        }
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("porepilot").unwrap();
        cmd.current_dir(self.tmp.path())
            .env("RUNS_ROOT", self.runs())
            .env("OUTPUT_ROOT", self.out())
            .env("UPSTREAM", "test")
            .env("UPSTREAM_TEST", self.upstream())
            .env("SYNC_CMD", COPY_CMD)
            .env("TICKET_CMD", TICKET_CMD)
            .env("TICKET_LOG", self.ticket_log());
        cmd
    }

    fn tick(&self) {
        self.cmd().assert().success();
    }

    fn tickets(&self) -> Vec<String> {
        std::fs::read_to_string(self.ticket_log())
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn pipeline(&self, run: &str) -> PathBuf {
        self.runs().join(run).join("pipeline")
    }

    fn flag(&self, run: &str, name: &str) -> bool {
        self.pipeline(run).join(name).exists()
    }

    fn read(&self, path: &Path) -> String {
        std::fs::read_to_string(path).unwrap_or_default()
    }
}

#[test]
fn new_upstream_run_is_provisioned_and_announced() {
    let sandbox = DriverSandbox::new();
    sandbox.add_upstream_cell("00testrun", CELL_A, false);

    sandbox.tick();

    let run = "20190226_TEST_00testrun";
    let pipeline = sandbox.pipeline(run);
    assert!(pipeline.is_dir());

    let output_link = std::fs::read_link(pipeline.join("output")).unwrap();
    assert_eq!(output_link, sandbox.out().join(run));
    let rundata_link = std::fs::read_link(sandbox.out().join(run).join("rundata")).unwrap();
    assert_eq!(rundata_link, sandbox.runs().join(run));

    let type_yaml = sandbox.read(&pipeline.join("type.yaml"));
    assert!(type_yaml.contains("type: internal"));

    let upstream = sandbox.read(&pipeline.join("upstream"));
    assert_eq!(
        upstream.trim(),
        format!("{}/00testrun", sandbox.upstream().display())
    );

    let new_tickets: Vec<_> = sandbox
        .tickets()
        .into_iter()
        .filter(|t| t.contains("new"))
        .collect();
    assert_eq!(new_tickets.len(), 1);
    assert!(new_tickets[0].starts_with(run));
    assert!(new_tickets[0].contains("sequencing"));
}

#[test]
fn finished_cell_is_synced_in_one_tick() {
    let sandbox = DriverSandbox::new();
    sandbox.add_upstream_cell("00testrun", CELL_A, true);

    sandbox.tick();

    let run = "20190226_TEST_00testrun";
    assert!(sandbox.flag(run, "sync.started"));
    assert!(sandbox.flag(run, "sync.done"));
    assert!(!sandbox.flag(run, "sync.failed"));
    assert!(sandbox.flag(run, &format!("{TFN_A}.synced")));
    assert!(sandbox
        .runs()
        .join(run)
        .join(CELL_A)
        .join("reads.blow5")
        .exists());
}

#[test]
fn unfinished_cell_is_mirrored_but_stays_pending() {
    let sandbox = DriverSandbox::new();
    sandbox.add_upstream_cell("00testrun", CELL_A, false);

    sandbox.tick();

    let run = "20190226_TEST_00testrun";
    assert!(sandbox.flag(run, "sync.done"));
    assert!(!sandbox.flag(run, &format!("{TFN_A}.synced")));
    assert!(sandbox.runs().join(run).join(CELL_A).is_dir());
}

#[test]
fn partial_readiness_processes_then_resyncs() {
    let sandbox = DriverSandbox::new();
    sandbox.add_upstream_cell("00testrun", CELL_A, true);
    sandbox.add_upstream_cell("00testrun", CELL_B, false);
    let proc_log = sandbox.tmp.path().join("process.log");

    let run = "20190226_TEST_00testrun";
    let with_proc = |sandbox: &DriverSandbox| {
        let mut cmd = sandbox.cmd();
        cmd.env("PROCESS_CMD", r#"echo "$run $cells" >> "$PROC_LOG""#)
            .env("PROC_LOG", &proc_log);
        cmd
    };

    // Tick 1: provision and sync. A completes, B stays pending.
    with_proc(&sandbox).assert().success();
    assert!(sandbox.flag(run, &format!("{TFN_A}.synced")));
    assert!(!sandbox.flag(run, &format!("{TFN_B}.synced")));

    // Tick 2: A is ready, so processing wins over another sync.
    with_proc(&sandbox).assert().success();
    assert!(sandbox.flag(run, &format!("{TFN_A}.done")));
    assert!(!sandbox.flag(run, &format!("{TFN_B}.done")));
    let processed = sandbox.read(&proc_log);
    assert!(processed.contains(CELL_A));
    assert!(!processed.contains(CELL_B));
    let tickets = sandbox.tickets();
    assert!(tickets.iter().any(|t| t.contains("processing")));
    assert!(tickets
        .iter()
        .any(|t| t.contains(&format!("Finished cell {TFN_A}"))));
    assert!(!tickets.iter().any(|t| t.contains("Finished all cells")));

    // Tick 3: B is still pending, so the driver goes back to syncing.
    let sync_log_before = sandbox.read(&sandbox.out().join(run).join("sync.log"));
    with_proc(&sandbox).assert().success();
    let sync_log_after = sandbox.read(&sandbox.out().join(run).join("sync.log"));
    assert!(sync_log_after.len() > sync_log_before.len());
    assert!(sync_log_after
        .lines()
        .filter(|l| l.contains(&format!("syncing cell {CELL_B}")))
        .count() >= 2);
}

#[test]
fn completed_run_reports_and_deletes_remote_cells() {
    let sandbox = DriverSandbox::new();
    sandbox.add_upstream_cell("00testrun", CELL_A, true);
    sandbox.add_upstream_cell("00testrun", CELL_B, true);
    let delete_log = sandbox.tmp.path().join("delete.log");

    let run = "20190226_TEST_00testrun";
    let cmd = |sandbox: &DriverSandbox| {
        let mut cmd = sandbox.cmd();
        cmd.env("PROCESS_CMD", "true")
            .env("DEL_REMOTE_CELLS", "1")
            .env("DELETE_CMD", r#"echo "$cells" >> "$DELETE_LOG""#)
            .env("DELETE_LOG", &delete_log);
        cmd
    };

    cmd(&sandbox).assert().success(); // provision + sync both cells
    cmd(&sandbox).assert().success(); // process both, report, delete

    assert!(sandbox.flag(run, &format!("{TFN_A}.done")));
    assert!(sandbox.flag(run, &format!("{TFN_B}.done")));

    let finished: Vec<_> = sandbox
        .tickets()
        .into_iter()
        .filter(|t| t.contains("Finished all cells"))
        .collect();
    assert_eq!(finished.len(), 1);

    let deleted = sandbox.read(&delete_log);
    assert!(deleted.contains(CELL_A));
    assert!(deleted.contains(CELL_B));
}

#[test]
fn ticket_failure_during_final_report_escalates_to_stderr() {
    let sandbox = DriverSandbox::new();
    sandbox.add_upstream_cell("00testrun", CELL_A, true);
    let delete_log = sandbox.tmp.path().join("delete.log");

    let run = "20190226_TEST_00testrun";
    let cmd = |sandbox: &DriverSandbox| {
        let mut cmd = sandbox.cmd();
        cmd.env("TICKET_CMD", "exit 1")
            .env("PROCESS_CMD", "true")
            .env("DEL_REMOTE_CELLS", "1")
            .env("DELETE_CMD", r#"echo "$cells" >> "$DELETE_LOG""#)
            .env("DELETE_LOG", &delete_log);
        cmd
    };

    cmd(&sandbox).assert().success();

    // Final reporting fails three times, then the failure report itself
    // fails; both land on stderr for cron mail and the run is flagged.
    cmd(&sandbox)
        .assert()
        .success()
        .stderr(predicate::str::contains("FAIL Reporting for cells"))
        .stderr(predicate::str::contains(
            "and also failed to report the error via RT",
        ));

    assert!(sandbox.flag(run, "failed"));
    assert!(!delete_log.exists());
}

#[test]
fn visitor_run_is_checksummed_and_delivered() {
    let sandbox = DriverSandbox::new();
    let run = "20230101_ONT1_v_tbooth2_test1";
    let cell = "vlib/20230101_1200_1-A1-A1_PAQ12345_0011aabb";
    let tfn = "20230101_1200_1-A1-A1_PAQ12345_0011aabb";
    sandbox.add_upstream_cell(run, cell, true);
    let checksum_log = sandbox.tmp.path().join("checksum.log");
    let delivery_log = sandbox.tmp.path().join("delivery.log");

    let cmd = |sandbox: &DriverSandbox| {
        let mut cmd = sandbox.cmd();
        cmd.env("PROCESS_CMD", "exit 9") // must never run for visitors
            .env("CHECKSUM_CMD", r#"echo "$cell" >> "$CHECKSUM_LOG""#)
            .env("CHECKSUM_LOG", &checksum_log)
            .env("DELIVERY_CMD", r#"echo "$run $uun $cells" >> "$DELIVERY_LOG""#)
            .env("DELIVERY_LOG", &delivery_log);
        cmd
    };

    cmd(&sandbox).assert().success(); // provision + sync
    let type_yaml = sandbox.read(&sandbox.pipeline(run).join("type.yaml"));
    assert!(type_yaml.contains("type: visitor"));
    assert!(type_yaml.contains("uun: tbooth2"));

    cmd(&sandbox).assert().success(); // checksum + deliver

    assert_eq!(sandbox.read(&checksum_log).trim(), cell);
    let deliveries: Vec<String> = sandbox
        .read(&delivery_log)
        .lines()
        .map(str::to_string)
        .collect();
    assert_eq!(deliveries, vec![format!("{run} tbooth2 {cell}")]);
    assert!(sandbox.flag(run, &format!("{tfn}.done")));

    let tickets = sandbox.tickets();
    assert!(tickets
        .iter()
        .any(|t| t.contains("delivery") && t.contains("Delivered")));
}

#[test]
fn delivery_failure_sets_the_failed_flag() {
    let sandbox = DriverSandbox::new();
    let run = "20230101_ONT1_v_tbooth2_test1";
    let cell = "vlib/20230101_1200_1-A1-A1_PAQ12345_0011aabb";
    sandbox.add_upstream_cell(run, cell, true);

    let cmd = |sandbox: &DriverSandbox| {
        let mut cmd = sandbox.cmd();
        cmd.env("DELIVERY_CMD", "exit 1");
        cmd
    };
    cmd(&sandbox).assert().success();
    cmd(&sandbox).assert().success();

    assert!(sandbox.flag(run, "failed"));
    assert!(sandbox
        .tickets()
        .iter()
        .any(|t| t.contains("failed")));
}

#[test]
fn test_runs_sync_but_never_process() {
    let sandbox = DriverSandbox::new();
    let run = "20230101_ONT1_spikein";
    let cell = "tlib/20230101_1200_1-A1-A1_PAQ12345_0011aabb";
    let tfn = "20230101_1200_1-A1-A1_PAQ12345_0011aabb";
    sandbox.add_upstream_cell(run, cell, true);
    let proc_log = sandbox.tmp.path().join("process.log");

    let cmd = |sandbox: &DriverSandbox| {
        let mut cmd = sandbox.cmd();
        cmd.env("PROCESS_CMD", r#"echo ran >> "$PROC_LOG""#)
            .env("PROC_LOG", &proc_log);
        cmd
    };
    cmd(&sandbox).assert().success();
    cmd(&sandbox).assert().success();

    assert!(sandbox.flag(run, &format!("{tfn}.done")));
    assert!(!proc_log.exists());
}

#[test]
fn empty_world_does_nothing_quietly() {
    let sandbox = DriverSandbox::new();
    sandbox
        .cmd()
        .assert()
        .success()
        .stderr(predicate::str::is_empty());
    assert!(sandbox.tickets().is_empty());
}

#[test]
fn unreachable_upstream_keeps_local_state_and_exits_zero() {
    let sandbox = DriverSandbox::new();
    sandbox.add_upstream_cell("00testrun", CELL_A, true);
    sandbox.tick();
    let run = "20190226_TEST_00testrun";
    assert!(sandbox.flag(run, &format!("{TFN_A}.synced")));

    // Point the upstream somewhere dead; the run must survive untouched.
    sandbox
        .cmd()
        .env("UPSTREAM_TEST", "/nonexistent/upstream/root")
        .assert()
        .success();
    assert!(sandbox.flag(run, &format!("{TFN_A}.synced")));
    assert!(sandbox.pipeline(run).is_dir());
}

#[test]
fn two_new_runs_get_separate_logs_and_tickets() {
    let sandbox = DriverSandbox::new();
    sandbox.add_upstream_cell("00testrun", CELL_A, true);
    sandbox.add_upstream_cell("01otherrun", CELL_B, true);

    sandbox.tick();

    let run_a = "20190226_TEST_00testrun";
    let run_b = "20190227_TEST_01otherrun";
    let log_a = sandbox.read(&sandbox.out().join(run_a).join("sync.log"));
    let log_b = sandbox.read(&sandbox.out().join(run_b).join("sync.log"));
    assert!(log_a.contains(CELL_A));
    assert!(!log_a.contains(CELL_B));
    assert!(log_b.contains(CELL_B));
    assert!(!log_b.contains(CELL_A));

    let new_tickets: Vec<_> = sandbox
        .tickets()
        .into_iter()
        .filter(|t| t.contains("new"))
        .collect();
    assert_eq!(new_tickets.len(), 2);
    assert!(new_tickets.iter().any(|t| t.starts_with(run_a)));
    assert!(new_tickets.iter().any(|t| t.starts_with(run_b)));
}

#[test]
fn missing_roots_fail_with_one_stderr_line() {
    let sandbox = DriverSandbox::new();
    let mut cmd = sandbox.cmd();
    cmd.env("RUNS_ROOT", "");
    let output = cmd.output().unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(stderr.lines().count(), 1);
    assert!(stderr.contains("RUNS_ROOT"));
}

#[test]
fn batch_layout_buckets_new_runs_by_year() {
    let sandbox = DriverSandbox::new();
    sandbox.add_upstream_cell("00testrun", CELL_A, true);

    sandbox.cmd().env("RUNS_BATCH", "year").assert().success();

    let run_dir = sandbox.runs().join("2019").join("20190226_TEST_00testrun");
    assert!(run_dir.join("pipeline").is_dir());
    assert!(run_dir.join(CELL_A).is_dir());

    // The run is rediscovered from its bucket, not re-announced.
    sandbox.cmd().env("RUNS_BATCH", "year").assert().success();
    let new_tickets = sandbox
        .tickets()
        .into_iter()
        .filter(|t| t.contains("new"))
        .count();
    assert_eq!(new_tickets, 1);
}

#[test]
fn stalled_run_is_reported_once() {
    let sandbox = DriverSandbox::new();
    sandbox.add_upstream_cell("00testrun", CELL_A, false);

    let run = "20190226_TEST_00testrun";
    let cmd = |sandbox: &DriverSandbox| {
        let mut cmd = sandbox.cmd();
        // Zero hours: anything already on disk counts as stalled.
        cmd.env("STALL_TIME", "0");
        cmd
    };

    cmd(&sandbox).assert().success(); // provision + first sync
    cmd(&sandbox).assert().success(); // detected stalled, reported
    assert!(sandbox.flag(run, "stall.reported"));
    let stalled = sandbox
        .tickets()
        .into_iter()
        .filter(|t| t.contains("stalled"))
        .count();
    assert_eq!(stalled, 1);

    cmd(&sandbox).assert().success(); // no duplicate report
    let stalled_again = sandbox
        .tickets()
        .into_iter()
        .filter(|t| t.contains("stalled"))
        .count();
    assert_eq!(stalled_again, 1);
}

#[test]
fn aborted_run_gains_no_new_touch_files() {
    let sandbox = DriverSandbox::new();
    sandbox.add_upstream_cell("00testrun", CELL_A, true);
    sandbox.tick(); // provision + sync

    let run = "20190226_TEST_00testrun";
    let pipeline = sandbox.pipeline(run);
    std::fs::write(pipeline.join("aborted"), b"").unwrap();
    let before: Vec<_> = std::fs::read_dir(&pipeline)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();

    sandbox.cmd().env("PROCESS_CMD", "true").assert().success();

    let mut after: Vec<_> = std::fs::read_dir(&pipeline)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    let mut before = before;
    before.sort();
    after.sort();
    assert_eq!(before, after);
    assert!(!sandbox.flag(run, &format!("{TFN_A}.done")));
}

#[test]
fn scan_upstream_prints_three_field_tsv() {
    let sandbox = DriverSandbox::new();
    sandbox.add_upstream_cell("00testrun", CELL_A, false);

    let output = sandbox.cmd().arg("scan-upstream").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 1);
    let fields: Vec<&str> = lines[0].split('\t').collect();
    assert_eq!(fields.len(), 3);
    assert_eq!(fields[0], "20190226_TEST_00testrun");
    assert!(fields[1].ends_with("/00testrun"));
    assert_eq!(fields[2], CELL_A);
}

#[test]
fn classify_subcommand_prints_the_type_mapping() {
    Command::cargo_bin("porepilot")
        .unwrap()
        .args(["classify", "20230101_ONT1_v_tbooth2_test1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("type: visitor"))
        .stdout(predicate::str::contains("uun: tbooth2"));
}
