//! Fingerprinting, diff materialization and validated counting.

use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use feedloader_core::{
    content_fingerprint, format_import_timestamp, Action, DiffCounts, FingerprintRecord, Route,
    RoutingPolicy, WorkingTable, IMPORT_TIMESTAMP_FORMAT,
};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::mapping::SchemaMapping;
use crate::queries;
use crate::warehouse::{MaterializeJob, ScalarValue, SnapshotRow, Warehouse, WriteDisposition};

/// A count result that cannot be trusted as a verified number.
#[derive(Debug, Error)]
pub enum CountError {
    #[error("count query returned no value")]
    Missing,
    #[error("count query returned an empty string")]
    Empty,
    #[error("count query returned a non-numeric value {0:?}")]
    NotNumeric(String),
    #[error("count query failed: {0:#}")]
    Query(anyhow::Error),
}

pub fn parse_count(value: ScalarValue) -> Result<u64, CountError> {
    match value {
        ScalarValue::Null => Err(CountError::Missing),
        ScalarValue::Integer(n) => u64::try_from(n).map_err(|_| CountError::NotNumeric(n.to_string())),
        ScalarValue::Real(r) if r.is_finite() && r >= 0.0 && r.fract() == 0.0 => Ok(r as u64),
        ScalarValue::Real(r) => Err(CountError::NotNumeric(r.to_string())),
        ScalarValue::Text(text) if text.trim().is_empty() => Err(CountError::Empty),
        ScalarValue::Text(text) => text
            .trim()
            .parse::<u64>()
            .map_err(|_| CountError::NotNumeric(text)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintSummary {
    /// The current window; every record appended by this run carries it.
    pub import_timestamp: String,
    pub appended: u64,
    pub skipped_without_id: usize,
    pub skipped_unrouted: usize,
    pub duplicates: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffOutcome {
    pub counts: DiffCounts,
    /// The upsert set could not be materialized or counted.
    pub upsert_unverified: bool,
}

pub struct DiffEngine<'a> {
    warehouse: &'a dyn Warehouse,
    routing: &'a RoutingPolicy,
    expiration_days: i64,
}

impl<'a> DiffEngine<'a> {
    pub fn new(warehouse: &'a dyn Warehouse, routing: &'a RoutingPolicy, expiration_days: i64) -> Self {
        Self {
            warehouse,
            routing,
            expiration_days,
        }
    }

    /// The routing column, when the mapping declares it.
    pub fn destination_column<'m>(&self, mapping: &'m SchemaMapping) -> Option<&'m str> {
        mapping
            .destination_columns()
            .find(|c| *c == self.routing.destination_column)
    }

    /// Appends one fingerprint per routed snapshot item under a fresh window.
    pub async fn fingerprint(
        &self,
        mapping: &SchemaMapping,
        now: DateTime<Utc>,
    ) -> Result<FingerprintSummary> {
        let import_timestamp = self.window_timestamp(now).await?;
        let destination_column = self.destination_column(mapping);
        let sql = queries::snapshot_query(mapping, destination_column);

        let mut summary = FingerprintSummary {
            import_timestamp: import_timestamp.clone(),
            appended: 0,
            skipped_without_id: 0,
            skipped_unrouted: 0,
            duplicates: 0,
        };
        let mut seen = HashSet::new();
        let mut records = Vec::new();

        // Rows are hashed as they stream in; only the digests are kept.
        let mut visit = |row: SnapshotRow| {
            let Some(item_id) = row.item_id else {
                summary.skipped_without_id += 1;
                return;
            };
            let raw = destination_column.and(row.destination_raw.as_deref());
            let destination_id = match self.routing.route(raw) {
                Route::Destination(destination) => destination,
                Route::Skip => {
                    summary.skipped_unrouted += 1;
                    return;
                }
            };
            if !seen.insert((item_id.clone(), destination_id.clone())) {
                summary.duplicates += 1;
                return;
            }
            records.push(FingerprintRecord {
                item_id,
                destination_id,
                content_hash: content_fingerprint(&row.content),
                import_timestamp: import_timestamp.clone(),
            });
        };
        self.warehouse.scan_snapshot(&sql, &mut visit).await?;

        if summary.skipped_without_id > 0 {
            warn!(rows = summary.skipped_without_id, "snapshot rows without item_id skipped");
        }
        if summary.duplicates > 0 {
            warn!(rows = summary.duplicates, "duplicate snapshot items ignored");
        }

        summary.appended = self
            .warehouse
            .append_fingerprints(&records)
            .await
            .context("appending fingerprints")?;
        info!(
            import_timestamp = %summary.import_timestamp,
            appended = summary.appended,
            unrouted = summary.skipped_unrouted,
            "snapshot fingerprinted"
        );
        Ok(summary)
    }

    /// `now`, or one microsecond past the newest recorded window if that is not older.
    async fn window_timestamp(&self, now: DateTime<Utc>) -> Result<String> {
        let candidate = format_import_timestamp(now);
        let latest = self
            .warehouse
            .scalar(&queries::latest_import_query())
            .await
            .context("reading latest fingerprint window")?;

        match latest {
            ScalarValue::Text(latest) if latest >= candidate => {
                let parsed = NaiveDateTime::parse_from_str(&latest, IMPORT_TIMESTAMP_FORMAT)
                    .with_context(|| format!("parsing recorded window {latest:?}"))?;
                let bumped = parsed.and_utc() + Duration::microseconds(1);
                warn!(%latest, "clock is not past the newest window; advancing run timestamp");
                Ok(format_import_timestamp(bumped))
            }
            _ => Ok(candidate),
        }
    }

    /// Materializes the three result sets concurrently, then counts each one.
    pub async fn diff(&self, import_timestamp: &str, today: NaiveDate) -> DiffOutcome {
        let deletes = self.run_jobs(vec![MaterializeJob::new(
            WorkingTable::ItemsToDelete,
            WriteDisposition::Truncate,
            queries::deletions_query(import_timestamp),
        )]);
        let upserts = self.run_jobs(vec![
            MaterializeJob::new(
                WorkingTable::ItemsToUpsert,
                WriteDisposition::Truncate,
                queries::changed_upserts_query(import_timestamp),
            ),
            MaterializeJob::new(
                WorkingTable::ItemsToUpsert,
                WriteDisposition::Append,
                queries::new_upserts_query(import_timestamp),
            ),
        ]);
        let expiring = self.run_jobs(vec![MaterializeJob::new(
            WorkingTable::ItemsToPreventExpiring,
            WriteDisposition::Truncate,
            queries::expiring_query(import_timestamp, today, self.expiration_days),
        )]);

        let (deletes_ok, upserts_ok, expiring_ok) = tokio::join!(deletes, upserts, expiring);

        let delete = self.checked_count(Action::Delete, deletes_ok).await;
        let upsert = self.checked_count(Action::Upsert, upserts_ok).await;
        let expiring = self.checked_count(Action::PreventExpiring, expiring_ok).await;

        DiffOutcome {
            counts: DiffCounts {
                delete: delete.unwrap_or(0),
                upsert: upsert.unwrap_or(0),
                expiring: expiring.unwrap_or(0),
            },
            upsert_unverified: upsert.is_none(),
        }
    }

    /// Runs jobs in order, stopping at the first failure.
    async fn run_jobs(&self, jobs: Vec<MaterializeJob>) -> bool {
        for job in &jobs {
            match self.warehouse.run_job(job).await {
                Ok(rows) => info!(
                    job_id = %job.job_id,
                    target = %job.target,
                    rows,
                    "materialize job finished"
                ),
                Err(err) => {
                    error!(
                        error_class = "query_failed",
                        job_id = %err.job_id,
                        target = %err.target,
                        query = %err.query,
                        error = %err.source,
                        "materialize job failed"
                    );
                    return false;
                }
            }
        }
        true
    }

    pub async fn count(&self, table: WorkingTable) -> Result<u64, CountError> {
        let value = self
            .warehouse
            .scalar(&queries::count_query(table))
            .await
            .map_err(CountError::Query)?;
        parse_count(value)
    }

    async fn checked_count(&self, action: Action, materialized: bool) -> Option<u64> {
        if !materialized {
            error!(error_class = "count_failed", %action, "result set was not materialized; count zeroed");
            return None;
        }
        match self.count(action.table()).await {
            Ok(count) => {
                info!(%action, count, "result set counted");
                Some(count)
            }
            Err(err) => {
                error!(error_class = "count_failed", %action, error = %err, "count zeroed");
                None
            }
        }
    }
}
