use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::runs::BatchLayout;
use crate::upstream::UpstreamLocation;

/// Main configuration structure for the driver.
///
/// Sources, in precedence order: built-in defaults, an optional
/// `porepilot.toml` next to the working directory, then environment
/// variables (`RUNS_ROOT`, `OUTPUT_ROOT`, `SYNC_CMD`, ...). Cron
/// deployments typically configure everything through the environment.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PorepilotConfig {
    /// Root of the local experiment tree. Mandatory.
    pub runs_root: String,
    /// Root of the local output tree. Mandatory.
    pub output_root: String,
    /// Optional bucketing of run dirs: "year" or "month".
    pub runs_batch: Option<String>,
    /// Name of the upstream configuration key; the location itself comes
    /// from `UPSTREAM_<name>` in the environment.
    pub upstream: Option<String>,
    /// Sync primitive template. Runs under `sh -c` with `$upstream_host`,
    /// `$upstream_path`, `$run`, `$run_dir`, `$run_dir_full` and `$cell`
    /// bound in the environment.
    pub sync_cmd: String,
    /// Hours without an updated file before a cell counts as stalled.
    /// Unset disables stall detection.
    pub stall_time: Option<u64>,
    /// Enables the post-completion remote deletion hook.
    pub del_remote_cells: bool,
    /// Directory for the main log; used when `mainlog` is unset.
    pub log_dir: Option<String>,
    /// Main log file. Unset with no `log_dir` means stdout.
    pub mainlog: Option<String>,
    /// Verbose driver logging.
    pub verbose: bool,
    /// Connect timeout for the upstream probe, in seconds.
    pub connect_timeout: u64,
    /// Ticket backend template; `$run`, `$queue`, `$subject`, `$body`.
    /// Unset routes notifications to the main log.
    pub ticket_cmd: Option<String>,
    /// Workflow engine template for ready cells; `$run`, `$run_dir`,
    /// `$run_dir_full`, `$cells`.
    pub process_cmd: Option<String>,
    /// Aggregate report template; `$run`, `$run_dir_full`, `$cells`.
    pub report_cmd: Option<String>,
    /// Visitor-mode checksum workflow; `$run`, `$run_dir_full`, `$cell`.
    pub checksum_cmd: Option<String>,
    /// Visitor-mode delivery hook; `$run`, `$uun`, `$cells`.
    pub delivery_cmd: Option<String>,
    /// Remote deletion hook; `$upstream_host`, `$upstream_path`, `$run`,
    /// `$cells`.
    pub delete_cmd: Option<String>,
    /// Ticket queue for internal and test runs.
    pub ticket_queue: String,
    /// Ticket queue for visitor runs.
    pub ticket_queue_visitor: String,
}

impl Default for PorepilotConfig {
    fn default() -> Self {
        Self {
            runs_root: String::new(),
            output_root: String::new(),
            runs_batch: None,
            upstream: None,
            sync_cmd: concat!(
                "mkdir -p \"$run_dir_full/$cell\" && ",
                "rsync -rlt --inplace ",
                "${upstream_host:+$upstream_host:}\"$upstream_path/$cell/\" ",
                "\"$run_dir_full/$cell/\""
            )
            .to_string(),
            stall_time: None,
            del_remote_cells: false,
            log_dir: None,
            mainlog: None,
            verbose: false,
            connect_timeout: 5,
            ticket_cmd: None,
            process_cmd: None,
            report_cmd: None,
            checksum_cmd: None,
            delivery_cmd: None,
            delete_cmd: None,
            ticket_queue: "sequencing".to_string(),
            ticket_queue_visitor: "delivery".to_string(),
        }
    }
}

impl PorepilotConfig {
    /// Load configuration from defaults, `porepilot.toml` and environment.
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder();

        if Path::new("porepilot.toml").exists() {
            builder = builder.add_source(File::with_name("porepilot"));
        }

        // Values stay strings here; numeric and boolean fields are parsed at
        // deserialization time, so command templates like `exit 1` or `true`
        // pass through untouched.
        builder = builder.add_source(Environment::default().ignore_empty(true));

        let config = builder.build()?;
        let loaded: PorepilotConfig = config.try_deserialize()?;
        Ok(loaded)
    }

    /// Load `.env` if present, before anything reads the environment.
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::debug!("loaded environment variables from .env file");
        }
        Ok(())
    }

    pub fn runs_root_path(&self) -> &Path {
        Path::new(&self.runs_root)
    }

    pub fn output_root_path(&self) -> &Path {
        Path::new(&self.output_root)
    }

    /// Parse `runs_batch`. An unrecognized value is a configuration error,
    /// not a silent fall-back to flat layout.
    pub fn batch_layout(&self) -> Result<Option<BatchLayout>, String> {
        match self.runs_batch.as_deref() {
            None | Some("") => Ok(None),
            Some(value) => BatchLayout::parse(value)
                .map(Some)
                .ok_or_else(|| format!("RUNS_BATCH must be \"year\" or \"month\", got \"{value}\"")),
        }
    }

    /// Resolve the upstream location named by `upstream`.
    ///
    /// Returns the upper-cased key (used as the instrument tag in canonical
    /// run names) together with the parsed location. An empty or missing
    /// `UPSTREAM_<name>` variable means no upstream.
    pub fn upstream_location(&self) -> Option<(String, UpstreamLocation)> {
        let name = self.upstream.as_deref()?.trim();
        if name.is_empty() {
            return None;
        }
        let key = name.to_uppercase();
        let raw = std::env::var(format!("UPSTREAM_{key}")).unwrap_or_default();
        UpstreamLocation::parse(&raw).map(|loc| (key, loc))
    }

    /// Where the main log goes, if not stdout.
    pub fn mainlog_path(&self) -> Option<PathBuf> {
        if let Some(mainlog) = self.mainlog.as_deref().filter(|s| !s.is_empty()) {
            return Some(PathBuf::from(mainlog));
        }
        self.log_dir
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|dir| Path::new(dir).join("porepilot.log"))
    }

    /// Ticket queue for a run classification.
    pub fn queue_for(&self, class: &crate::runs::RunClass) -> &str {
        match class {
            crate::runs::RunClass::Visitor { .. } => &self.ticket_queue_visitor,
            _ => &self.ticket_queue,
        }
    }

    /// Save configuration to file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }
}

/// Global configuration instance.
static CONFIG: std::sync::LazyLock<Result<PorepilotConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        let _ = PorepilotConfig::load_env_file();
        PorepilotConfig::load()
    });

/// Get the global configuration.
pub fn config() -> Result<&'static PorepilotConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("failed to load configuration: {}", e))
}
