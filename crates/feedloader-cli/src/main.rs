use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use feedloader_core::{Action, TriggerEvent};
use feedloader_sync::{record_touches, ReconcileConfig, ReconcilePipeline, SqliteWarehouse};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "feedloader")]
#[command(about = "Feed loader reconciliation command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Handle one trigger notification (a zero-length `EOF` / `EOF.retry` marker).
    Reconcile {
        /// Bucket holding the marker; defaults to the configured update bucket.
        #[arg(long)]
        bucket: Option<String>,
        #[arg(long, default_value = "EOF")]
        name: String,
        /// Reported size; defaults to the marker's actual length.
        #[arg(long)]
        size: Option<String>,
    },
    /// Create the fingerprint, diff and touch-tracking tables.
    Provision,
    /// Record uploader touches for items (one id per line in the file).
    Touch {
        #[arg(long, value_enum)]
        action: TouchAction,
        #[arg(long)]
        ids: PathBuf,
        /// Defaults to today (UTC).
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Drop the snapshot table and remove the lock marker after a hung run.
    Cleanup,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TouchAction {
    Upsert,
    Delete,
    PreventExpiring,
}

impl From<TouchAction> for Action {
    fn from(value: TouchAction) -> Self {
        match value {
            TouchAction::Upsert => Action::Upsert,
            TouchAction::Delete => Action::Delete,
            TouchAction::PreventExpiring => Action::PreventExpiring,
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = ReconcileConfig::from_env();

    match cli.command {
        Commands::Reconcile { bucket, name, size } => {
            let bucket = bucket.unwrap_or_else(|| config.buckets.update.clone());
            let size = match size {
                Some(size) => size,
                None => marker_size(&config, &bucket, &name).await?,
            };
            let event = TriggerEvent { bucket, name, size };
            let outcome = feedloader_sync::run_reconcile_from_env(&event).await?;
            match &outcome.result {
                Ok(report) => println!(
                    "reconcile complete: run_id={} report={}",
                    outcome.run_id,
                    serde_json::to_string(report)?
                ),
                Err(err) => eprintln!(
                    "reconcile ended early: run_id={} class={} error={err}",
                    outcome.run_id,
                    err.class()
                ),
            }
        }
        Commands::Provision => {
            let warehouse = SqliteWarehouse::open(&config.database_path(), config.dataset.clone()).await?;
            warehouse.provision().await?;
            println!("provisioned {}", config.database_path().display());
        }
        Commands::Touch { action, ids, date } => {
            let text = tokio::fs::read_to_string(&ids)
                .await
                .with_context(|| format!("reading item ids from {}", ids.display()))?;
            let item_ids = text
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>();
            let warehouse = SqliteWarehouse::open(&config.database_path(), config.dataset.clone()).await?;
            let date = date.unwrap_or_else(|| Utc::now().date_naive());
            let affected = record_touches(&warehouse, action.into(), &item_ids, date).await?;
            println!("touch recorded: items={} affected={affected}", item_ids.len());
        }
        Commands::Cleanup => {
            let pipeline = ReconcilePipeline::from_config(config).await?;
            let released = pipeline.cleanup().await?;
            println!("cleanup complete: lock_removed={released}");
        }
    }

    Ok(())
}

/// Length of the marker object on disk, as an object notification would report it.
async fn marker_size(config: &ReconcileConfig, bucket: &str, name: &str) -> Result<String> {
    let path = config.buckets_root().join(bucket).join(name);
    let meta = tokio::fs::metadata(&path)
        .await
        .with_context(|| format!("reading trigger marker {}", path.display()))?;
    Ok(meta.len().to_string())
}
