//! Canonical filesystem layout for a run.
//!
//! Everything the driver touches hangs off two roots: the runs tree (mirrored
//! sequencer data plus the `pipeline/` signalling directory) and the output
//! tree (workflow artifacts and logs). The two are cross-linked so operators
//! can navigate either way.

use std::path::{Path, PathBuf};

use super::name::parse_run_name;

/// Optional bucketing of run directories under the runs root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchLayout {
    /// `<runs>/YYYY/<run>`
    Year,
    /// `<runs>/YYYY-MM/<run>`
    Month,
}

impl BatchLayout {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "year" => Some(BatchLayout::Year),
            "month" => Some(BatchLayout::Month),
            _ => None,
        }
    }

    /// Bucket directory for a run, derived from the date in its name.
    pub fn bucket(&self, run_name: &str) -> Option<String> {
        let parts = parse_run_name(run_name)?;
        match self {
            BatchLayout::Year => Some(parts.date[..4].to_string()),
            BatchLayout::Month => Some(format!("{}-{}", &parts.date[..4], &parts.date[4..6])),
        }
    }
}

/// Resolved paths for one run.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub run_name: String,
    /// Run directory relative to the runs root, including any batch bucket.
    pub run_rel: PathBuf,
    /// `<runs>[/<batch>]/<run>`
    pub run_dir: PathBuf,
    /// `<run_dir>/pipeline`
    pub pipeline_dir: PathBuf,
    /// `<output>/<run>`
    pub output_dir: PathBuf,
}

impl RunPaths {
    pub fn new(
        runs_root: &Path,
        output_root: &Path,
        batch: Option<BatchLayout>,
        run_name: &str,
    ) -> Self {
        let mut run_rel = PathBuf::new();
        if let Some(bucket) = batch.and_then(|b| b.bucket(run_name)) {
            run_rel.push(bucket);
        }
        run_rel.push(run_name);
        let run_dir = runs_root.join(&run_rel);
        RunPaths {
            run_name: run_name.to_string(),
            pipeline_dir: run_dir.join("pipeline"),
            output_dir: output_root.join(run_name),
            run_rel,
            run_dir,
        }
    }

    /// Symlink inside the pipeline dir pointing at the output dir.
    pub fn output_link(&self) -> PathBuf {
        self.pipeline_dir.join("output")
    }

    /// Reverse symlink from the output dir back to the run directory.
    pub fn rundata_link(&self) -> PathBuf {
        self.output_dir.join("rundata")
    }

    pub fn type_yaml(&self) -> PathBuf {
        self.pipeline_dir.join("type.yaml")
    }

    pub fn upstream_file(&self) -> PathBuf {
        self.pipeline_dir.join("upstream")
    }

    /// Captured stdout/stderr of processing and reporting actions.
    pub fn pipeline_log(&self) -> PathBuf {
        self.output_dir.join("pipeline.log")
    }

    /// Captured output of sync actions, kept apart from the pipeline log.
    pub fn sync_log(&self) -> PathBuf {
        self.output_dir.join("sync.log")
    }

    /// Lock file guarding this run against concurrent driver ticks.
    pub fn lock_file(&self) -> PathBuf {
        self.pipeline_dir.join(".driver.lock")
    }

    /// Local directory of a cell, addressed by its relative path.
    pub fn cell_dir(&self, cell_relpath: &str) -> PathBuf {
        self.run_dir.join(cell_relpath)
    }
}
