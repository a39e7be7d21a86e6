//! Run orchestration: trigger validation, locking, preconditions, diffing, dispatch and cleanup.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use feedloader_core::{
    CompletionPayload, DiffCounts, RoutingMode, TriggerEvent, TriggerKind, TriggerRejection,
    WorkingTable,
};
use feedloader_storage::{
    BucketTaskQueue, DispatchError, FsObjectStore, HttpClientConfig, HttpTaskQueue, LockError,
    LockGuard, ObjectStore, QueueTarget, RunLock, TaskQueue,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::ReconcileConfig;
use crate::engine::DiffEngine;
use crate::mapping::{MappingError, SchemaMapping};
use crate::preconditions::{PreconditionError, PreconditionValidator};
use crate::threshold::ThresholdGuard;
use crate::warehouse::{SqliteWarehouse, Warehouse};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("trigger rejected: {0}")]
    InvalidTrigger(#[from] TriggerRejection),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("schema config rejected: {0}")]
    SchemaConfig(#[from] MappingError),
    #[error("multi-account routing requires the {0} column in the schema config")]
    MissingDestinationColumn(String),
    #[error(transparent)]
    Precondition(#[from] PreconditionError),
    #[error("fingerprinting the snapshot failed: {0:#}")]
    Fingerprint(anyhow::Error),
    #[error("completion dispatch to {target} failed: {source}")]
    Dispatch {
        target: String,
        source: DispatchError,
    },
}

impl RunError {
    /// Stable tag for the `error_class` log field.
    pub fn class(&self) -> &'static str {
        match self {
            RunError::InvalidTrigger(_) => "invalid_trigger",
            RunError::Lock(LockError::Held) => "lock_held",
            RunError::Lock(LockError::Unavailable(_)) => "lock_unavailable",
            RunError::Lock(LockError::Consume { .. }) => "lock_consume_failed",
            RunError::SchemaConfig(_) | RunError::MissingDestinationColumn(_) => "schema_config",
            RunError::Precondition(PreconditionError::IncompleteIngestion { .. }) => {
                "incomplete_ingestion"
            }
            RunError::Precondition(PreconditionError::MissingTables(_)) => "missing_tables",
            RunError::Precondition(_) => "precondition_failed",
            RunError::Fingerprint(_) => "fingerprint_failed",
            RunError::Dispatch { .. } => "dispatch_failed",
        }
    }

    /// Expected under overlapping triggers; not alert-worthy.
    pub fn is_routine(&self) -> bool {
        matches!(
            self,
            RunError::InvalidTrigger(_) | RunError::Lock(LockError::Held)
        )
    }

    fn retains_lock(&self) -> bool {
        matches!(self, RunError::Precondition(err) if err.retains_lock())
    }

    /// Schema problems are detected before anything is loaded or moved.
    fn drops_snapshot(&self) -> bool {
        !matches!(
            self,
            RunError::SchemaConfig(_) | RunError::MissingDestinationColumn(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockDisposition {
    Released,
    /// The marker is still present and blocks every later run.
    ReleaseFailed,
    Retained,
    NotAcquired,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub import_timestamp: String,
    pub fingerprinted: u64,
    /// Counts as materialized, before the threshold guard.
    pub counts: DiffCounts,
    pub dispatched: CompletionPayload,
    pub deletes_suppressed: bool,
    pub upserts_suppressed: bool,
    pub fingerprints_rolled_back: bool,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub trigger: String,
    pub result: Result<RunReport, RunError>,
    pub lock: LockDisposition,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

pub struct ReconcilePipeline {
    config: ReconcileConfig,
    store: Arc<dyn ObjectStore>,
    warehouse: Arc<dyn Warehouse>,
    queue: Arc<dyn TaskQueue>,
}

impl ReconcilePipeline {
    pub fn new(
        config: ReconcileConfig,
        store: Arc<dyn ObjectStore>,
        warehouse: Arc<dyn Warehouse>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            config,
            store,
            warehouse,
            queue,
        }
    }

    /// Filesystem buckets, the SQLite store and the configured work queue.
    pub async fn from_config(config: ReconcileConfig) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(config.buckets_root()));
        let warehouse = SqliteWarehouse::open(&config.database_path(), config.dataset.clone()).await?;
        let queue = build_queue(&config, store.clone())?;
        Ok(Self::new(config, store, Arc::new(warehouse), queue))
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub async fn run(&self, event: &TriggerEvent) -> RunOutcome {
        self.run_at(event, Utc::now()).await
    }

    /// Never fails: every error is classified, logged and reported in the outcome.
    pub async fn run_at(&self, event: &TriggerEvent, now: DateTime<Utc>) -> RunOutcome {
        let run_id = Uuid::new_v4();
        let span = info_span!("reconcile", %run_id, trigger = %event.name);
        async {
            let (result, lock) = match self.lock_and_execute(event, now).await {
                Ok((result, lock)) => (result, lock),
                Err(err) => (Err(err), LockDisposition::NotAcquired),
            };
            report(&result, lock);
            RunOutcome {
                run_id,
                trigger: format!("{}/{}", event.bucket, event.name),
                result,
                lock,
            }
        }
        .instrument(span)
        .await
    }

    /// `Err` only when the lock was never taken.
    async fn lock_and_execute(
        &self,
        event: &TriggerEvent,
        now: DateTime<Utc>,
    ) -> Result<(Result<RunReport, RunError>, LockDisposition), RunError> {
        let kind = event.validate()?;
        let lock = RunLock::new(self.store.clone(), self.config.buckets.lock.clone());
        let guard = match kind {
            TriggerKind::Eof => lock.acquire(&event.bucket, &event.name).await?,
            TriggerKind::Retry => lock.resume(&event.bucket, &event.name).await?,
        };

        let result = self.execute(now).await;
        let disposition = self.settle(guard, &result).await;
        Ok((result, disposition))
    }

    async fn execute(&self, now: DateTime<Utc>) -> Result<RunReport, RunError> {
        let mapping = SchemaMapping::load(&self.config.schema_config_path).await?;
        let engine = DiffEngine::new(
            self.warehouse.as_ref(),
            &self.config.routing,
            self.config.expiration.threshold_days,
        );
        if self.config.routing.mode == RoutingMode::MultiAccount
            && engine.destination_column(&mapping).is_none()
        {
            return Err(RunError::MissingDestinationColumn(
                self.config.routing.destination_column.clone(),
            ));
        }

        PreconditionValidator::new(
            self.store.as_ref(),
            self.warehouse.as_ref(),
            &self.config.buckets,
        )
        .validate(now)
        .await?;

        let fingerprints = engine
            .fingerprint(&mapping, now)
            .await
            .map_err(RunError::Fingerprint)?;
        let window = fingerprints.import_timestamp.as_str();

        let today = now
            .with_timezone(&self.config.expiration.utc_offset)
            .date_naive();
        let diff = engine.diff(window, today).await;
        let decision =
            ThresholdGuard::new(self.config.thresholds).apply(diff.counts.delete, diff.counts.upsert);

        let mut fingerprints_rolled_back = false;
        if decision.upserts_suppressed || diff.upsert_unverified {
            fingerprints_rolled_back = self.rollback_fingerprints(window).await;
        }

        let payload = CompletionPayload {
            delete_count: decision.delete_count,
            expiring_count: diff.counts.expiring,
            upsert_count: decision.upsert_count,
        };
        if let Err(source) = self.queue.enqueue(&payload).await {
            self.rollback_fingerprints(window).await;
            return Err(RunError::Dispatch {
                target: self.queue.describe(),
                source,
            });
        }

        Ok(RunReport {
            import_timestamp: fingerprints.import_timestamp.clone(),
            fingerprinted: fingerprints.appended,
            counts: diff.counts,
            dispatched: payload,
            deletes_suppressed: decision.deletes_suppressed,
            upserts_suppressed: decision.upserts_suppressed,
            fingerprints_rolled_back,
        })
    }

    /// Forgets this run's window so the next run diffs against the previous one again.
    async fn rollback_fingerprints(&self, window: &str) -> bool {
        match self.warehouse.delete_fingerprints(window).await {
            Ok(removed) => {
                warn!(window, removed, "fingerprint window rolled back");
                true
            }
            Err(err) => {
                error!(
                    error_class = "rollback_failed",
                    window,
                    error = %format!("{err:#}"),
                    "fingerprint rollback failed; next run may miss changes"
                );
                false
            }
        }
    }

    async fn settle(&self, guard: LockGuard, result: &Result<RunReport, RunError>) -> LockDisposition {
        match result {
            Err(err) if err.retains_lock() => {
                if let Err(err) = guard.retain().await {
                    error!(
                        error_class = "lock_retain_failed",
                        error = %format!("{err:#}"),
                        "retained lock could not be marked; a retry trigger will see it as held"
                    );
                }
                LockDisposition::Retained
            }
            Err(err) => {
                if err.drops_snapshot() {
                    self.drop_snapshot().await;
                }
                release(guard).await
            }
            Ok(_) => release(guard).await,
        }
    }

    async fn drop_snapshot(&self) {
        match self.warehouse.drop_table(WorkingTable::Items).await {
            Ok(()) => info!(
                table = %WorkingTable::Items.qualified(self.warehouse.dataset()),
                "snapshot table dropped during cleanup"
            ),
            Err(err) => error!(
                error_class = "cleanup_failed",
                error = %format!("{err:#}"),
                "snapshot table could not be dropped"
            ),
        }
    }

    /// Operator recovery for a hung run: drops the snapshot and removes the lock marker.
    pub async fn cleanup(&self) -> Result<bool> {
        self.warehouse
            .drop_table(WorkingTable::Items)
            .await
            .context("dropping snapshot table")?;
        let released = RunLock::new(self.store.clone(), self.config.buckets.lock.clone())
            .release()
            .await
            .context("removing lock marker")?;
        info!(released, "manual cleanup finished");
        Ok(released)
    }
}

async fn release(guard: LockGuard) -> LockDisposition {
    match guard.release().await {
        Ok(_) => LockDisposition::Released,
        Err(err) => {
            error!(
                error_class = "lock_release_failed",
                error = %format!("{err:#}"),
                "run lock could not be released; later runs stay blocked"
            );
            LockDisposition::ReleaseFailed
        }
    }
}

fn report(result: &Result<RunReport, RunError>, lock: LockDisposition) {
    match result {
        Ok(report) => info!(
            delete_count = report.dispatched.delete_count,
            upsert_count = report.dispatched.upsert_count,
            expiring_count = report.dispatched.expiring_count,
            ?lock,
            "reconciliation finished"
        ),
        Err(err) if err.is_routine() => warn!(
            error_class = err.class(),
            error = %err,
            ?lock,
            "reconciliation skipped"
        ),
        Err(err) => error!(
            error_class = err.class(),
            error = %err,
            ?lock,
            "reconciliation aborted"
        ),
    }
}

pub fn build_queue(config: &ReconcileConfig, store: Arc<dyn ObjectStore>) -> Result<Arc<dyn TaskQueue>> {
    let target = QueueTarget {
        name: config.queue.name.clone(),
        location: config.queue.location.clone(),
    };
    let queue: Arc<dyn TaskQueue> = match &config.queue.endpoint {
        Some(endpoint) => Arc::new(HttpTaskQueue::new(
            endpoint,
            &target,
            HttpClientConfig {
                timeout: Duration::from_secs(config.queue.timeout_secs),
                user_agent: Some(format!("feedloader/{}", env!("CARGO_PKG_VERSION"))),
                ..Default::default()
            },
        )?),
        None => Arc::new(BucketTaskQueue::new(
            store,
            config.buckets.outbox.clone(),
            target,
        )),
    };
    Ok(queue)
}
