//! Analytical store seam plus the SQLite-backed implementation.

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use feedloader_core::{FingerprintRecord, WorkingTable};
use futures::TryStreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, QueryBuilder, Row, Sqlite, TypeInfo, ValueRef};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

const FINGERPRINT_BATCH_SIZE: usize = 200;

/// First column of the first row of a scalar query, kept untyped until validated.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

/// One snapshot item as read for fingerprinting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRow {
    pub item_id: Option<String>,
    pub destination_raw: Option<String>,
    /// Null-coalesced, separator-joined mapped column values.
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDisposition {
    /// Replace the target's rows.
    Truncate,
    Append,
}

/// A query whose result rows are written into a working table.
#[derive(Debug, Clone)]
pub struct MaterializeJob {
    pub job_id: Uuid,
    pub target: WorkingTable,
    pub disposition: WriteDisposition,
    pub select_sql: String,
}

impl MaterializeJob {
    pub fn new(target: WorkingTable, disposition: WriteDisposition, select_sql: String) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            target,
            disposition,
            select_sql,
        }
    }
}

#[derive(Debug, Error)]
#[error("materialize job {job_id} into {target} failed: {source}; query: {query}")]
pub struct JobError {
    pub job_id: Uuid,
    pub target: WorkingTable,
    pub query: String,
    #[source]
    pub source: sqlx::Error,
}

/// Operations a reconciliation run issues against the analytical store.
#[async_trait]
pub trait Warehouse: Send + Sync {
    fn dataset(&self) -> &str;

    async fn table_exists(&self, table: WorkingTable) -> Result<bool>;

    /// Streams the snapshot query through `visit` one row at a time; returns the row count.
    async fn scan_snapshot(
        &self,
        sql: &str,
        visit: &mut (dyn FnMut(SnapshotRow) + Send),
    ) -> Result<u64>;

    /// Appends all records atomically; returns the number written.
    async fn append_fingerprints(&self, records: &[FingerprintRecord]) -> Result<u64>;

    /// Returns the number of rows written into the target.
    async fn run_job(&self, job: &MaterializeJob) -> Result<u64, JobError>;

    async fn scalar(&self, sql: &str) -> Result<ScalarValue>;

    /// Removes the fingerprint window written at `import_timestamp`.
    async fn delete_fingerprints(&self, import_timestamp: &str) -> Result<u64>;

    /// Drops the table; a missing table is not an error.
    async fn drop_table(&self, table: WorkingTable) -> Result<()>;
}

pub struct SqliteWarehouse {
    pool: Pool<Sqlite>,
    dataset: String,
}

impl SqliteWarehouse {
    pub async fn open(db_path: &Path, dataset: impl Into<String>) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", db_path.display()))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("temp_store", "MEMORY");

        // One connection: concurrent materialize jobs queue on the pool instead of
        // contending for the SQLite write lock.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("opening analytical store {}", db_path.display()))?;

        Ok(Self {
            pool,
            dataset: dataset.into(),
        })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Creates every table the run owns. `items` belongs to the ingestion stage.
    pub async fn provision(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS streaming_items (
                item_id TEXT NOT NULL,
                destination_id TEXT,
                hashed_content TEXT NOT NULL,
                import_datetime TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_streaming_items_window
             ON streaming_items (import_datetime, item_id)",
        )
        .execute(&self.pool)
        .await?;

        for table in [
            WorkingTable::ItemsToDelete,
            WorkingTable::ItemsToUpsert,
            WorkingTable::ItemsToPreventExpiring,
        ] {
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (item_id TEXT NOT NULL, destination_id TEXT)"
            ))
            .execute(&self.pool)
            .await
            .with_context(|| format!("creating {table}"))?;
        }

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS items_expiration_tracking (
                item_id TEXT PRIMARY KEY,
                last_touched_date TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        info!(dataset = %self.dataset, "analytical store provisioned");
        Ok(())
    }

    async fn write_job(&self, job: &MaterializeJob) -> Result<u64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        if job.disposition == WriteDisposition::Truncate {
            sqlx::query(&format!("DELETE FROM {}", job.target))
                .execute(&mut *tx)
                .await?;
        }
        let written = sqlx::query(&format!(
            "INSERT INTO {} (item_id, destination_id) {}",
            job.target, job.select_sql
        ))
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok(written)
    }
}

#[async_trait]
impl Warehouse for SqliteWarehouse {
    fn dataset(&self) -> &str {
        &self.dataset
    }

    async fn table_exists(&self, table: WorkingTable) -> Result<bool> {
        let found = sqlx::query("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table.name())
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("checking table {}", table.qualified(&self.dataset)))?;
        Ok(found.is_some())
    }

    async fn scan_snapshot(
        &self,
        sql: &str,
        visit: &mut (dyn FnMut(SnapshotRow) + Send),
    ) -> Result<u64> {
        let mut rows = sqlx::query(sql).fetch(&self.pool);
        let mut scanned = 0u64;
        while let Some(row) = rows.try_next().await.context("reading snapshot rows")? {
            visit(SnapshotRow {
                item_id: row.try_get("item_id")?,
                destination_raw: row.try_get("destination_raw")?,
                content: row.try_get("content")?,
            });
            scanned += 1;
        }
        Ok(scanned)
    }

    async fn append_fingerprints(&self, records: &[FingerprintRecord]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;

        for chunk in records.chunks(FINGERPRINT_BATCH_SIZE) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO streaming_items (item_id, destination_id, hashed_content, import_datetime) ",
            );
            qb.push_values(chunk, |mut row, record| {
                row.push_bind(record.item_id.as_str())
                    .push_bind(record.destination_id.as_deref())
                    .push_bind(record.content_hash.as_str())
                    .push_bind(record.import_timestamp.as_str());
            });
            written += qb.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        debug!(written, "fingerprints appended");
        Ok(written)
    }

    async fn run_job(&self, job: &MaterializeJob) -> Result<u64, JobError> {
        self.write_job(job).await.map_err(|source| JobError {
            job_id: job.job_id,
            target: job.target,
            query: job.select_sql.clone(),
            source,
        })
    }

    async fn scalar(&self, sql: &str) -> Result<ScalarValue> {
        let Some(row) = sqlx::query(sql).fetch_optional(&self.pool).await? else {
            return Ok(ScalarValue::Null);
        };

        let raw = row.try_get_raw(0)?;
        if raw.is_null() {
            return Ok(ScalarValue::Null);
        }
        let kind = raw.type_info().name().to_ascii_uppercase();
        let value = match kind.as_str() {
            "INTEGER" | "INT" | "BIGINT" | "BOOLEAN" => ScalarValue::Integer(row.try_get(0)?),
            "REAL" | "FLOAT" | "DOUBLE" => ScalarValue::Real(row.try_get(0)?),
            _ => ScalarValue::Text(row.try_get(0)?),
        };
        Ok(value)
    }

    async fn delete_fingerprints(&self, import_timestamp: &str) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM streaming_items WHERE import_datetime = ?")
            .bind(import_timestamp)
            .execute(&self.pool)
            .await
            .context("rolling back fingerprint window")?
            .rows_affected();
        Ok(removed)
    }

    async fn drop_table(&self, table: WorkingTable) -> Result<()> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
            .execute(&self.pool)
            .await
            .with_context(|| format!("dropping {}", table.qualified(&self.dataset)))?;
        Ok(())
    }
}
