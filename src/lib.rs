// Porepilot - unattended pipeline driver for a nanopore sequencing facility
// This exposes the core components for testing and integration

pub mod config;
pub mod driver;
pub mod external;
pub mod runlog;
pub mod runs;
pub mod state;
pub mod sync;
pub mod telemetry;
pub mod ticket;
pub mod touchfile;
pub mod upstream;

// Re-export key types for easy access
pub use config::{config, PorepilotConfig};
pub use driver::{Driver, DriverError, RunReport};
pub use external::{CommandOutput, CommandRunner, ShellRunner};
pub use runlog::RunLog;
pub use runs::{classify, parse_cell, parse_run_name, sanitize_name, BatchLayout, CellId, RunClass, RunPaths};
pub use state::{action_for, cell_status, run_status, CellStatus, CellView, RunAction, RunStatus, StatusSnapshot};
pub use sync::{SyncEngine, SyncOutcome};
pub use telemetry::init_telemetry;
pub use ticket::{notify_with_retry, CommandNotifier, LogNotifier, NotifyError, RetryConfig, TicketNotifier};
pub use touchfile::{CellFlag, RunFlag, TouchStore};
pub use upstream::{canonical_run_name, has_final_summary, InventoryEntry, InventoryProbe, UpstreamLocation};
