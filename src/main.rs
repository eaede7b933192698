//! pairsync CLI
//!
//! Maintenance commands over a local data directory. Remote ports are wired
//! to local-only adapters, so every command works offline.
//!
//! ```text
//! pairsync status    health report and structured store row counts (JSON)
//! pairsync metrics   Prometheus text exposition
//! pairsync sweep     run every maintenance pass once
//! pairsync wipe      clear every cache component
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pairsync::{Orchestrator, PairsyncConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// pairsync - client-side cache and sync layer maintenance
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "PAIRSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory (overrides the configuration file)
    #[arg(long, env = "PAIRSYNC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the health report and structured store row counts
    Status,
    /// Print metrics in Prometheus text format
    Metrics,
    /// Run content retention, image cleanup, and widget purge once
    Sweep,
    /// Clear every cache component
    Wipe,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let mut config = PairsyncConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(data_dir) = &args.data_dir {
        config = config.with_data_dir(data_dir);
    }
    info!(data_dir = %config.data_dir.display(), command = ?args.command, "Starting pairsync");

    let orchestrator = Orchestrator::builder(config)
        .build()
        .await
        .context("constructing cache layer")?;

    match args.command {
        Command::Status => {
            let report = orchestrator.initialize().await?;
            let tables: serde_json::Map<String, serde_json::Value> = orchestrator
                .store()
                .table_counts()
                .await?
                .into_iter()
                .map(|(table, rows)| (table, json!(rows)))
                .collect();
            let status = json!({
                "state": orchestrator.state(),
                "health": report,
                "schema_version": orchestrator.store().schema_version().await?,
                "tables": tables,
                "image": orchestrator.image().stats(),
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Metrics => {
            orchestrator.initialize().await?;
            print!("{}", orchestrator.render_prometheus().await?);
        }
        Command::Sweep => {
            orchestrator.initialize().await?;
            let content = orchestrator
                .content()
                .purge_expired()
                .await
                .context("purging expired content")?;
            let images = orchestrator
                .image()
                .cleanup_disk()
                .await
                .context("cleaning image directory")?;
            let widget = orchestrator
                .widget()
                .purge_stale()
                .await
                .context("purging widget files")?;
            println!(
                "{}",
                json!({"content_removed": content, "images_removed": images, "widget_files_removed": widget})
            );
        }
        Command::Wipe => {
            orchestrator.initialize().await?;
            let report = orchestrator.wipe_all().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.failures.is_empty() {
                orchestrator.shutdown().await;
                anyhow::bail!("{} component(s) failed to clear", report.failures.len());
            }
        }
    }

    orchestrator.shutdown().await;
    info!("pairsync finished");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=warn", "rustls=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    // Logs go to stderr so command output stays machine-readable
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
