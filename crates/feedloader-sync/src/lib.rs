//! Reconciliation of a freshly loaded catalog snapshot against its fingerprint history.

pub mod config;
pub mod engine;
pub mod mapping;
pub mod preconditions;
pub mod queries;
pub mod reconcile;
pub mod threshold;
pub mod touch;
pub mod warehouse;

use anyhow::Result;
use feedloader_core::TriggerEvent;

pub use config::{BucketConfig, ExpirationConfig, QueueConfig, ReconcileConfig};
pub use engine::{parse_count, CountError, DiffEngine, DiffOutcome, FingerprintSummary};
pub use mapping::{MappingError, SchemaMapping};
pub use preconditions::{PreconditionError, PreconditionValidator, RETRY_HANDOFF_NAME};
pub use reconcile::{LockDisposition, ReconcilePipeline, RunError, RunOutcome, RunReport};
pub use threshold::{ThresholdConfig, ThresholdDecision, ThresholdGuard};
pub use touch::record_touches;
pub use warehouse::{MaterializeJob, ScalarValue, SqliteWarehouse, Warehouse, WriteDisposition};

pub const CRATE_NAME: &str = "feedloader-sync";

pub async fn run_reconcile_from_env(event: &TriggerEvent) -> Result<RunOutcome> {
    let config = ReconcileConfig::from_env();
    let pipeline = ReconcilePipeline::from_config(config).await?;
    Ok(pipeline.run(event).await)
}
