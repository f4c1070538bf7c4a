use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::PorepilotConfig;

/// Initialize the main log.
///
/// Cron deployments point `MAINLOG` or `LOG_DIR` at a file; interactive use
/// gets plain stdout. `RUST_LOG` overrides the level chosen by `VERBOSE`.
pub fn init_telemetry(cfg: &PorepilotConfig) -> Result<()> {
    let default_level = if cfg.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match cfg.mainlog_path() {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(Arc::new(file))
                        .with_ansi(false),
                )
                .try_init()
                .ok();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()
                .ok();
        }
    }
    Ok(())
}
