//! Cell identifier parsing.
//!
//! A cell is a flow-cell output directory addressed relative to its run as
//! `<library>/<YYYYMMDD>_<n>_<slot>_<flowcellID>_<checksum8>`. The final
//! path segment doubles as the stem for every cell-scoped touch file, so it
//! is referred to as the touch-file name (tfn) throughout.

use regex::Regex;
use std::sync::LazyLock;

/// `<library>/<date>_<n>_<slot>_<flowcellID>_<checksum8>`
pub static CELL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<library>[^/\s]+)/(?P<tfn>(?P<date>\d{8})_(?P<n>\d+)_(?P<slot>[A-Za-z0-9-]+)_(?P<flowcell>[A-Za-z0-9]+)_(?P<checksum>[0-9a-fA-F]{8}))$",
    )
    .unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellId {
    /// Library directory the cell lives under. Stable once synced.
    pub library: String,
    /// Final path segment; the touch-file name.
    pub tfn: String,
    pub date: String,
    pub slot: String,
    pub flowcell: String,
    pub checksum: String,
}

impl CellId {
    /// The relative path `<library>/<tfn>`.
    pub fn relpath(&self) -> String {
        format!("{}/{}", self.library, self.tfn)
    }
}

/// Parse a `<library>/<cellname>` relative path.
pub fn parse_cell(relpath: &str) -> Option<CellId> {
    let caps = CELL_RE.captures(relpath)?;
    Some(CellId {
        library: caps["library"].to_string(),
        tfn: caps["tfn"].to_string(),
        date: caps["date"].to_string(),
        slot: caps["slot"].to_string(),
        flowcell: caps["flowcell"].to_string(),
        checksum: caps["checksum"].to_string(),
    })
}

/// The tfn of a cell relative path, without validating the inner fields.
pub fn tfn_of(relpath: &str) -> Option<&str> {
    relpath.rsplit('/').next().filter(|s| !s.is_empty())
}
