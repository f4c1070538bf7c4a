use clap::{Parser, Subcommand};
use std::process::ExitCode;

use porepilot::{
    classify, init_telemetry, Driver, PorepilotConfig, RunClass,
};

#[derive(Parser)]
#[command(name = "porepilot")]
#[command(about = "Unattended pipeline driver for a nanopore sequencing facility")]
#[command(
    long_about = "Porepilot watches a runs directory and an upstream sequencer, mirrors \
                  finished flow cells, launches processing workflows and reports progress \
                  to the ticket backend. Run it from cron with no subcommand for one tick."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one driver tick (the default, intended for cron)
    Tick,
    /// Display the status of every known run and its cells
    Status,
    /// Print the classification of a run name
    Classify {
        /// Run name, e.g. 20230101_ONT1_v_tbooth2_test1
        name: String,
    },
    /// Probe the configured upstream and print its inventory as TSV
    ScanUpstream,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // A single line on stderr; cron mail picks it up.
            eprintln!("porepilot: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    // Classification needs no configuration at all.
    if let Some(Commands::Classify { name }) = &cli.command {
        return classify_command(name);
    }

    let _ = PorepilotConfig::load_env_file();
    let cfg = PorepilotConfig::load()?;
    init_telemetry(&cfg)?;

    let rt = tokio::runtime::Runtime::new()?;
    match cli.command {
        None | Some(Commands::Tick) => rt.block_on(async {
            let driver = Driver::new(&cfg);
            driver.tick().await?;
            Ok(())
        }),
        Some(Commands::Status) => rt.block_on(status_command(&cfg)),
        Some(Commands::ScanUpstream) => rt.block_on(scan_upstream_command(&cfg)),
        Some(Commands::Classify { .. }) => unreachable!("handled above"),
    }
}

fn classify_command(name: &str) -> anyhow::Result<()> {
    let class = classify(name);
    print!("{}", serde_yaml::to_string(&class)?);
    Ok(())
}

async fn status_command(cfg: &PorepilotConfig) -> anyhow::Result<()> {
    let driver = Driver::new(cfg);
    let reports = driver.reports().await?;

    println!("🧬 POREPILOT RUN STATUS");
    println!("=======================");
    if reports.is_empty() {
        println!("No runs found under {}", cfg.runs_root);
        return Ok(());
    }
    for report in reports {
        let class = match &report.class {
            RunClass::Visitor { uun } => format!("visitor:{uun}"),
            other => other.as_label().to_string(),
        };
        println!();
        println!("📦 {} [{}] {}", report.name, class, report.status);
        for (tfn, status) in &report.cells {
            println!("   {tfn}: {status}");
        }
    }
    Ok(())
}

async fn scan_upstream_command(cfg: &PorepilotConfig) -> anyhow::Result<()> {
    let driver = Driver::new(cfg);
    let upstream = cfg.upstream_location();
    for entry in driver.probe_upstream(&upstream).await {
        println!("{}", entry.tsv_line());
    }
    Ok(())
}
