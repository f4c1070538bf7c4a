//! Touch-file store: the append-only filesystem signalling primitive.
//!
//! Every fact the driver records about a run lives in the run's `pipeline/`
//! directory as a zero-byte file whose name encodes the fact. Readers test
//! presence only; mtimes carry no meaning here. Creation goes through a
//! single atomic open so a reader never observes a half-written flag.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TouchFileError {
    #[error("failed to write touch file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to remove touch file {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Run-level flags. One file per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunFlag {
    /// Operator gave up on the run. Takes precedence over everything.
    Aborted,
    /// A permanent failure was recorded.
    Failed,
    /// Run data was removed after delivery.
    Stripped,
    SyncStarted,
    SyncDone,
    SyncFailed,
    /// A stall was already announced for this run.
    StallReported,
}

impl RunFlag {
    pub fn filename(self) -> &'static str {
        match self {
            RunFlag::Aborted => "aborted",
            RunFlag::Failed => "failed",
            RunFlag::Stripped => "stripped",
            RunFlag::SyncStarted => "sync.started",
            RunFlag::SyncDone => "sync.done",
            RunFlag::SyncFailed => "sync.failed",
            RunFlag::StallReported => "stall.reported",
        }
    }
}

/// Cell-level flags, scoped by the cell's touch-file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellFlag {
    Synced,
    Started,
    Done,
    Failed,
    Aborted,
}

impl CellFlag {
    pub fn suffix(self) -> &'static str {
        match self {
            CellFlag::Synced => "synced",
            CellFlag::Started => "started",
            CellFlag::Done => "done",
            CellFlag::Failed => "failed",
            CellFlag::Aborted => "aborted",
        }
    }

    const ALL: [CellFlag; 5] = [
        CellFlag::Synced,
        CellFlag::Started,
        CellFlag::Done,
        CellFlag::Failed,
        CellFlag::Aborted,
    ];
}

/// Handle on one run's pipeline directory.
#[derive(Debug, Clone)]
pub struct TouchStore {
    dir: PathBuf,
}

impl TouchStore {
    pub fn new(pipeline_dir: impl Into<PathBuf>) -> Self {
        TouchStore {
            dir: pipeline_dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn touch(&self, name: &str) -> Result<(), TouchFileError> {
        let path = self.path_for(name);
        OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .map_err(|source| TouchFileError::Write { path, source })?;
        Ok(())
    }

    fn untouch(&self, name: &str) -> Result<(), TouchFileError> {
        let path = self.path_for(name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(TouchFileError::Remove { path, source }),
        }
    }

    pub fn set(&self, flag: RunFlag) -> Result<(), TouchFileError> {
        self.touch(flag.filename())
    }

    pub fn clear(&self, flag: RunFlag) -> Result<(), TouchFileError> {
        self.untouch(flag.filename())
    }

    pub fn is_set(&self, flag: RunFlag) -> bool {
        self.path_for(flag.filename()).exists()
    }

    fn cell_filename(tfn: &str, flag: CellFlag) -> String {
        format!("{}.{}", tfn, flag.suffix())
    }

    pub fn set_cell(&self, tfn: &str, flag: CellFlag) -> Result<(), TouchFileError> {
        self.touch(&Self::cell_filename(tfn, flag))
    }

    pub fn is_cell_set(&self, tfn: &str, flag: CellFlag) -> bool {
        self.path_for(&Self::cell_filename(tfn, flag)).exists()
    }

    /// A sync is running right now: started, with neither outcome recorded.
    pub fn sync_in_progress(&self) -> bool {
        self.is_set(RunFlag::SyncStarted)
            && !self.is_set(RunFlag::SyncDone)
            && !self.is_set(RunFlag::SyncFailed)
    }

    /// All tfns that have at least one cell-scoped touch file.
    ///
    /// This recovers cells whose data directory has gone away but whose
    /// history is still on record.
    pub fn known_tfns(&self) -> Vec<String> {
        let mut tfns = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return tfns;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            for flag in CellFlag::ALL {
                if let Some(stem) = name.strip_suffix(&format!(".{}", flag.suffix())) {
                    // Run-level sync.* files share the dotted shape; skip them.
                    if !stem.is_empty() && stem != "sync" && stem != "stall" {
                        tfns.push(stem.to_string());
                    }
                    break;
                }
            }
        }
        tfns.sort();
        tfns.dedup();
        tfns
    }
}
