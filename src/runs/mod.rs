//! Path and naming model: run names, cell identifiers, directory layout.

pub mod cell;
pub mod layout;
pub mod name;

pub use cell::{parse_cell, tfn_of, CellId};
pub use layout::{BatchLayout, RunPaths};
pub use name::{classify, parse_run_name, sanitize_name, RunClass, RunNameParts};
