//! Run-name decomposition and classification.
//!
//! Experiment names follow `YYYYMMDD_<instrument>_<tail>`; the tail decides
//! who the run belongs to. The three patterns are kept as named constants
//! because the classification rules are load-bearing for ticket routing and
//! for the visitor delivery path.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Overall shape of a run name: date, instrument tag, free-form tail.
pub static RUN_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<date>\d{8})_(?P<instrument>[A-Za-z0-9]+)_(?P<tail>.+)$")
        .unwrap()
});

/// Visitor tails look like `v_<uun>` or `V-<uun>`, with the user id ending at
/// the next separator or the end of the name.
static VISITOR_TAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[vV][_-]+([A-Za-z0-9]+)([_-]|$)").unwrap());

/// Internal tails start with a digit (a project number).
static INTERNAL_TAIL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9]").unwrap());

/// Runs of anything that is not a letter or digit collapse to one underscore
/// when a name is canonicalized.
static NON_IDENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^A-Za-z0-9]+").unwrap());

/// The decomposed parts of a shape-valid run name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunNameParts {
    pub date: String,
    pub instrument: String,
    pub tail: String,
}

/// Who a run belongs to. Serialized into `pipeline/type.yaml` as a mapping
/// with a `type` key, plus `uun` for visitor runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RunClass {
    Internal,
    Visitor { uun: String },
    Test,
    Unknown,
}

impl RunClass {
    pub fn as_label(&self) -> &'static str {
        match self {
            RunClass::Internal => "internal",
            RunClass::Visitor { .. } => "visitor",
            RunClass::Test => "test",
            RunClass::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for RunClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Split a run name into its parts, if it has the expected shape.
pub fn parse_run_name(name: &str) -> Option<RunNameParts> {
    let caps = RUN_NAME_RE.captures(name)?;
    Some(RunNameParts {
        date: caps["date"].to_string(),
        instrument: caps["instrument"].to_string(),
        tail: caps["tail"].to_string(),
    })
}

/// Classify a run name. Total: every string maps to some class.
pub fn classify(name: &str) -> RunClass {
    let Some(parts) = parse_run_name(name) else {
        return RunClass::Unknown;
    };
    if let Some(caps) = VISITOR_TAIL_RE.captures(&parts.tail) {
        return RunClass::Visitor {
            uun: caps[1].to_lowercase(),
        };
    }
    if INTERNAL_TAIL_RE.is_match(&parts.tail) {
        return RunClass::Internal;
    }
    RunClass::Test
}

/// Collapse runs of non-identifier characters to single underscores.
///
/// Upstream directory names come from instrument operators and may contain
/// whitespace or punctuation; the sanitized form is what the local run
/// directory is called. The original path is kept alongside wherever the
/// sync engine needs to reach back upstream.
pub fn sanitize_name(raw: &str) -> String {
    NON_IDENT_RE.replace_all(raw, "_").into_owned()
}
