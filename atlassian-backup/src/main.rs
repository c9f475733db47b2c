//! Atlassian Backup - Main entry point
//!
//! Backs up the Jira and Confluence data of every configured instance once,
//! then exits.

use anyhow::Result;
use atlassian_backup::{backup_instances, config::Config, utils};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Environment may be seeded from a .env file
    let dotenv = dotenvy::dotenv();

    let config = Config::load(args.config.as_deref());

    // Initialize logging
    let log_level = args
        .log_level
        .clone()
        .or_else(|| config.as_ref().ok().map(|c| c.log.level.clone()))
        .unwrap_or_else(|| "info".to_string());
    utils::logger::init(&log_level)?;

    if let Ok(path) = dotenv {
        tracing::debug!("Loaded environment from {}", path.display());
    }

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Starting atlassian-backup v{} for {} instance(s): {}",
        env!("CARGO_PKG_VERSION"),
        config.instances.len(),
        config.instances.join(", ")
    );

    let summary = backup_instances(&config).await;
    if summary.succeeded < summary.total {
        tracing::warn!(
            "{} instance(s) failed, see the log above",
            summary.total - summary.succeeded
        );
    }

    Ok(())
}
