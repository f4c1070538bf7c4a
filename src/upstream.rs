//! Remote cell inventory.
//!
//! The probe enumerates `<experiment>/<library>/<cell>` directories under an
//! upstream location, either a plain path on this machine or `user@host:path`
//! over ssh. An experiment is reported only if it contains at least one
//! directory matching the cell pattern. Probe failure is downgraded to an
//! empty inventory so that locally complete runs stay reportable while the
//! network is down.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

use crate::external::{env_bindings, CommandRunner};
use crate::runs::{name, parse_cell, parse_run_name};

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream listing failed: {0}")]
    Listing(String),
    #[error("cannot read upstream directory {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where the sequencer output lives before it is mirrored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamLocation {
    /// `user@host` for ssh remotes, absent for local paths.
    pub host: Option<String>,
    pub path: String,
}

impl UpstreamLocation {
    /// Parse `/path` or `user@host:path`. Empty input means no upstream.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        match raw.split_once(':') {
            // A colon after a slash is part of the path, not a host marker.
            Some((host, path)) if !host.contains('/') => Some(UpstreamLocation {
                host: Some(host.to_string()),
                path: path.to_string(),
            }),
            _ => Some(UpstreamLocation {
                host: None,
                path: raw.to_string(),
            }),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.host.is_some()
    }

    /// Display form for an experiment directory beneath this location.
    pub fn display_dir(&self, dir: &str) -> String {
        match &self.host {
            Some(host) => format!("{}:{}/{}", host, self.path, dir),
            None => format!("{}/{}", self.path, dir),
        }
    }
}

/// One cell visible upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryEntry {
    /// Canonical (sanitized) experiment name.
    pub experiment: String,
    /// Original experiment directory name upstream, preserved verbatim.
    pub upstream_dir: String,
    /// Canonical upstream path of the experiment, host included for remotes.
    pub upstream_path: String,
    /// `<library>/<cell>` relative path.
    pub cell: String,
}

impl InventoryEntry {
    /// Exactly three tab-separated fields.
    pub fn tsv_line(&self) -> String {
        format!("{}\t{}\t{}", self.experiment, self.upstream_path, self.cell)
    }
}

/// Canonical run name for an upstream experiment directory.
///
/// Directories already shaped like a run name are kept (sanitized). Anything
/// else gets the date of its first cell and the instrument tag injected:
/// `YYYYMMDD_<instrument>_<sanitized-dir>`.
pub fn canonical_run_name(dir: &str, first_cell_date: &str, instrument: &str) -> String {
    let sanitized = name::sanitize_name(dir);
    if parse_run_name(&sanitized).is_some() {
        return sanitized;
    }
    format!("{first_cell_date}_{instrument}_{sanitized}")
}

/// Check for the transfer-complete marker the sequencer writes.
pub fn has_final_summary(cell_dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(cell_dir) else {
        return false;
    };
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if file_name.starts_with("final_summary") && file_name.ends_with(".txt") {
            return true;
        }
    }
    false
}

pub struct InventoryProbe<'a> {
    pub location: UpstreamLocation,
    /// Upper-cased upstream key, injected into canonical run names.
    pub instrument: String,
    pub connect_timeout_secs: u64,
    pub runner: &'a dyn CommandRunner,
}

impl<'a> InventoryProbe<'a> {
    /// Enumerate upstream cells. Never fails: any error is logged and an
    /// empty inventory returned, leaving the tick to carry on with local
    /// state only.
    pub async fn scan(&self) -> Vec<InventoryEntry> {
        match self.list_cell_paths().await {
            Ok(paths) => self.entries_from_paths(paths),
            Err(e) => {
                warn!(
                    upstream = %self.location.path,
                    error = %e,
                    "upstream probe failed, treating inventory as empty"
                );
                Vec::new()
            }
        }
    }

    /// Raw `<experiment>/<library>/<cell>` relative paths.
    async fn list_cell_paths(&self) -> Result<Vec<String>, UpstreamError> {
        if self.location.is_remote() {
            self.list_remote().await
        } else {
            list_local(Path::new(&self.location.path))
        }
    }

    async fn list_remote(&self) -> Result<Vec<String>, UpstreamError> {
        // find(1) rather than a remote glob: the output does not depend on
        // the login shell upstream.
        let template = "exec ssh -o BatchMode=yes -o ConnectTimeout=$connect_timeout \
             \"$upstream_host\" find \"$upstream_root\" -mindepth 3 -maxdepth 3 -type d";
        let timeout = self.connect_timeout_secs.to_string();
        let envs = env_bindings(&[
            ("connect_timeout", timeout.as_str()),
            ("upstream_host", self.location.host.as_deref().unwrap_or("")),
            ("upstream_root", &self.location.path),
        ]);
        let output = self
            .runner
            .run_template(template, &envs)
            .await
            .map_err(|e| UpstreamError::Listing(e.to_string()))?;
        if !output.success() {
            return Err(UpstreamError::Listing(format!(
                "ssh listing exited {}: {}",
                output.status_code,
                output.stderr.trim()
            )));
        }
        let root = self.location.path.trim_end_matches('/');
        Ok(output
            .stdout
            .lines()
            .filter_map(|line| {
                line.strip_prefix(root)
                    .map(|rel| rel.trim_start_matches('/').to_string())
            })
            .filter(|rel| !rel.is_empty())
            .collect())
    }

    fn entries_from_paths(&self, paths: Vec<String>) -> Vec<InventoryEntry> {
        // Group by original experiment dir so the canonical name is derived
        // once per experiment, from its lexicographically first cell.
        let mut by_dir: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for rel in paths {
            let Some((dir, cell_rel)) = rel.split_once('/') else {
                continue;
            };
            if parse_cell(cell_rel).is_some() {
                by_dir
                    .entry(dir.to_string())
                    .or_default()
                    .push(cell_rel.to_string());
            }
        }

        let mut entries = Vec::new();
        for (dir, mut cells) in by_dir {
            cells.sort();
            let first_date = cells
                .first()
                .and_then(|c| parse_cell(c))
                .map(|c| c.date)
                .unwrap_or_default();
            let experiment = canonical_run_name(&dir, &first_date, &self.instrument);
            let upstream_path = self.location.display_dir(&dir);
            for cell in cells {
                entries.push(InventoryEntry {
                    experiment: experiment.clone(),
                    upstream_dir: dir.clone(),
                    upstream_path: upstream_path.clone(),
                    cell,
                });
            }
        }
        entries
    }
}

/// Walk `<root>/<experiment>/<library>/<cell>` on the local filesystem.
fn list_local(root: &Path) -> Result<Vec<String>, UpstreamError> {
    let mut out = Vec::new();
    let top = std::fs::read_dir(root).map_err(|source| UpstreamError::Read {
        path: root.to_path_buf(),
        source,
    })?;
    for expt in top.flatten() {
        if !expt.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let Ok(expt_name) = expt.file_name().into_string() else {
            continue;
        };
        let Ok(libs) = std::fs::read_dir(expt.path()) else {
            continue;
        };
        for lib in libs.flatten() {
            if !lib.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let Ok(lib_name) = lib.file_name().into_string() else {
                continue;
            };
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
                out.push(format!("{expt_name}/{lib_name}/{cell_name}"));
            }
        }
    }
    out.sort();
    Ok(out)
}
