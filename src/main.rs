//! CLI entry point for the GTFS to Linked Connections event stream publisher.
//!
//! `run` starts the long-running scheduler; `refresh` and `realtime` run a
//! single pass and exit.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use gtfs_ldes::config::Config;
use gtfs_ldes::pipeline::PassReport;
use gtfs_ldes::scheduler::{Collaborators, JobSettings, PipelineScheduler, TickOutcome};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "gtfs_ldes")]
#[command(about = "Publishes GTFS and GTFS-RT as a Linked Connections event stream", long_about = None)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, global = true, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run both triggers on their cron schedules until Ctrl+C
    Run,
    /// Run one full static refresh and exit
    Refresh,
    /// Build the index and run one incremental realtime pass, then exit
    Realtime,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/gtfs_ldes.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("gtfs_ldes.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| EnvFilter::new("info")));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(
            EnvFilter::try_from_env("RUST_LOG_JSON").unwrap_or_else(|_| EnvFilter::new("debug")),
        );

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate().context("invalid configuration")?;

    let collaborators = Collaborators::from_config(&config)?;
    let settings = JobSettings::from_config(&config)?;
    let scheduler = Arc::new(PipelineScheduler::new(collaborators, settings));

    match cli.command {
        Commands::Run => {
            let schedule = config.schedule()?;
            info!(
                data_folder = %config.general.data_folder.display(),
                target = %config.general.target_url,
                throttle_rate = config.general.throttle_rate,
                "Starting scheduler"
            );
            scheduler
                .run(schedule, async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!(error = %e, "Failed to listen for Ctrl+C");
                    }
                })
                .await?;
        }
        Commands::Refresh => {
            let outcome = scheduler.on_full_refresh_tick().await;
            report("full_refresh", outcome)?;
        }
        Commands::Realtime => {
            if config.gtfs_realtime.is_none() {
                bail!("config has no gtfs_realtime section");
            }
            let outcome = scheduler.on_incremental_tick().await;
            let result = report("incremental", outcome);
            scheduler.close()?;
            result?;
        }
    }

    Ok(())
}

/// Prints the pass report as JSON on stdout and turns a failed tick into an exit error.
fn report(phase: &str, outcome: TickOutcome<PassReport>) -> Result<()> {
    match outcome {
        TickOutcome::Ran(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.delivery.failed > 0 {
                warn!(phase, failed = report.delivery.failed, "Pass finished with delivery failures");
            }
            if report.delivery.unrecorded > 0 {
                warn!(
                    phase,
                    unrecorded = report.delivery.unrecorded,
                    "Delivered events were not recorded and will be published again"
                );
            }
            Ok(())
        }
        TickOutcome::Skipped(reason) => {
            warn!(phase, reason = ?reason, "Pass skipped");
            Ok(())
        }
        TickOutcome::NotYetAvailable => {
            bail!("static GTFS not ingested yet, run `gtfs_ldes refresh` first")
        }
        TickOutcome::Failed(e) => Err(e).with_context(|| format!("{phase} pass failed")),
    }
}
