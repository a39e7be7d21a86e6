//! Checks a run must pass before any fingerprint is written.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use feedloader_core::WorkingTable;
use feedloader_storage::{Listing, ObjectStore};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::BucketConfig;
use crate::warehouse::Warehouse;

/// Object written to the retrigger bucket listing the files to reload.
pub const RETRY_HANDOFF_NAME: &str = "REPROCESS_TRIGGER_FILE";

/// Prefix, inside the archive bucket, under which feed files are moved.
pub const ARCHIVE_PREFIX: &str = "archive";

#[derive(Debug, Error)]
pub enum PreconditionError {
    #[error("no files were found in bucket {bucket}")]
    EmptyListing { bucket: String },
    #[error("{} feed file(s) were not imported: {}", .missing.len(), .missing.join(", "))]
    IncompleteIngestion { missing: Vec<String> },
    #[error("writing the retry handoff failed: {0:#}")]
    RetryHandoff(anyhow::Error),
    #[error("clearing completion records failed: {0:#}")]
    ClearCompleted(anyhow::Error),
    #[error("archiving feed files failed: {0:#}")]
    Archive(anyhow::Error),
    #[error("required tables are missing: {}", display_tables(.0))]
    MissingTables(Vec<WorkingTable>),
    #[error("storage query failed: {0:#}")]
    Storage(anyhow::Error),
}

impl PreconditionError {
    /// Incomplete ingestion hands off to the retry collaborator and keeps the lock.
    pub fn retains_lock(&self) -> bool {
        matches!(self, PreconditionError::IncompleteIngestion { .. })
    }
}

fn display_tables(tables: &[WorkingTable]) -> String {
    tables
        .iter()
        .map(|t| t.name())
        .collect::<Vec<_>>()
        .join(", ")
}

pub struct PreconditionValidator<'a> {
    store: &'a dyn ObjectStore,
    warehouse: &'a dyn Warehouse,
    buckets: &'a BucketConfig,
}

impl<'a> PreconditionValidator<'a> {
    pub fn new(
        store: &'a dyn ObjectStore,
        warehouse: &'a dyn Warehouse,
        buckets: &'a BucketConfig,
    ) -> Self {
        Self {
            store,
            warehouse,
            buckets,
        }
    }

    /// Ingestion check, completion-record cleanup, archiving and the table check, in order.
    pub async fn validate(&self, now: DateTime<Utc>) -> Result<(), PreconditionError> {
        self.ensure_ingestion_complete().await?;
        self.clear_completion_records().await?;
        self.archive_feed_files(now).await?;
        self.ensure_tables_exist().await
    }

    /// Compares attempted feed files against completion records.
    ///
    /// Missing files are written, newline-joined, to the retry handoff object.
    pub async fn ensure_ingestion_complete(&self) -> Result<(), PreconditionError> {
        let attempted = self
            .store
            .list(&self.buckets.feed, Listing::TopLevel)
            .await
            .map_err(PreconditionError::Storage)?;
        if attempted.is_empty() {
            return Err(PreconditionError::EmptyListing {
                bucket: self.buckets.feed.clone(),
            });
        }

        let completed = self
            .store
            .list(&self.buckets.completed, Listing::Recursive)
            .await
            .map_err(PreconditionError::Storage)?;
        if completed.is_empty() {
            return Err(PreconditionError::EmptyListing {
                bucket: self.buckets.completed.clone(),
            });
        }

        let completed = completed.into_iter().collect::<HashSet<_>>();
        let missing = attempted
            .into_iter()
            .filter(|name| !completed.contains(name))
            .collect::<Vec<_>>();
        if missing.is_empty() {
            info!(files = completed.len(), "all feed files were imported");
            return Ok(());
        }

        warn!(missing = missing.len(), "feed files missing completion records; requesting reload");
        self.store
            .write(
                &self.buckets.retrigger,
                RETRY_HANDOFF_NAME,
                missing.join("\n").as_bytes(),
            )
            .await
            .map_err(PreconditionError::RetryHandoff)?;
        Err(PreconditionError::IncompleteIngestion { missing })
    }

    pub async fn clear_completion_records(&self) -> Result<usize, PreconditionError> {
        let records = self
            .store
            .list(&self.buckets.completed, Listing::Recursive)
            .await
            .map_err(PreconditionError::ClearCompleted)?;
        for name in &records {
            self.store
                .delete(&self.buckets.completed, name)
                .await
                .map_err(PreconditionError::ClearCompleted)?;
        }
        info!(cleared = records.len(), "completion records cleared");
        Ok(records.len())
    }

    /// Moves each top-level feed file under `archive/<YYYY_MM_DD_HH_MM_AM|PM>/`.
    pub async fn archive_feed_files(&self, now: DateTime<Utc>) -> Result<usize, PreconditionError> {
        let stamp = now.format("%Y_%m_%d_%H_%M_%p");
        let files = self
            .store
            .list(&self.buckets.feed, Listing::TopLevel)
            .await
            .map_err(PreconditionError::Archive)?;
        for name in &files {
            let destination = format!("{ARCHIVE_PREFIX}/{stamp}/{name}");
            self.store
                .rename(&self.buckets.feed, name, &self.buckets.archive, &destination)
                .await
                .map_err(PreconditionError::Archive)?;
        }
        info!(archived = files.len(), bucket = %self.buckets.archive, "feed files archived");
        Ok(files.len())
    }

    pub async fn ensure_tables_exist(&self) -> Result<(), PreconditionError> {
        let mut missing = Vec::new();
        for table in WorkingTable::REQUIRED {
            if !self
                .warehouse
                .table_exists(table)
                .await
                .map_err(PreconditionError::Storage)?
            {
                missing.push(table);
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PreconditionError::MissingTables(missing))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::SqliteWarehouse;
    use chrono::TimeZone;
    use feedloader_storage::FsObjectStore;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: FsObjectStore,
        warehouse: SqliteWarehouse,
        buckets: BucketConfig,
    }

    async fn fixture() -> Fixture {
        let dir = tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path().join("buckets"));
        let warehouse = SqliteWarehouse::open(&dir.path().join("db.sqlite"), "feed_data")
            .await
            .expect("open");
        warehouse.provision().await.expect("provision");
        for bucket in ["feed", "completed", "retrigger"] {
            tokio::fs::create_dir_all(store.bucket_path(bucket).expect("bucket"))
                .await
                .expect("mkdir");
        }
        Fixture {
            _dir: dir,
            store,
            warehouse,
            buckets: BucketConfig::default(),
        }
    }

    #[tokio::test]
    async fn missing_completions_are_handed_to_the_retry_bucket() {
        let fx = fixture().await;
        for name in ["a", "b", "c"] {
            fx.store.write("feed", name, b"rows").await.expect("feed");
        }
        for name in ["a", "b"] {
            fx.store.write("completed", name, b"").await.expect("completed");
        }

        let validator = PreconditionValidator::new(&fx.store, &fx.warehouse, &fx.buckets);
        let err = validator.ensure_ingestion_complete().await.expect_err("incomplete");
        assert!(err.retains_lock());
        match err {
            PreconditionError::IncompleteIngestion { missing } => assert_eq!(missing, vec!["c"]),
            other => panic!("unexpected {other}"),
        }
        let handoff = fx.store.read("retrigger", RETRY_HANDOFF_NAME).await.expect("handoff");
        assert_eq!(handoff, b"c");
    }

    #[tokio::test]
    async fn empty_listings_fail_without_handoff() {
        let fx = fixture().await;
        let validator = PreconditionValidator::new(&fx.store, &fx.warehouse, &fx.buckets);
        assert!(matches!(
            validator.ensure_ingestion_complete().await,
            Err(PreconditionError::EmptyListing { .. })
        ));

        fx.store.write("feed", "a", b"rows").await.expect("feed");
        let err = validator.ensure_ingestion_complete().await.expect_err("no completions");
        assert!(!err.retains_lock());
        assert!(!fx.store.exists("retrigger", RETRY_HANDOFF_NAME).await.expect("exists"));
    }

    #[tokio::test]
    async fn successful_validation_clears_records_and_archives_feeds() {
        let fx = fixture().await;
        fx.store.write("feed", "a.csv", b"rows").await.expect("feed");
        fx.store.write("completed", "a.csv", b"").await.expect("completed");
        sqlx::query("CREATE TABLE items (item_id TEXT, title TEXT)")
            .execute(fx.warehouse.pool())
            .await
            .expect("create items");

        let now = Utc.with_ymd_and_hms(2026, 2, 24, 15, 4, 0).single().expect("now");
        let validator = PreconditionValidator::new(&fx.store, &fx.warehouse, &fx.buckets);
        validator.validate(now).await.expect("valid");

        assert!(fx.store.list("completed", Listing::Recursive).await.expect("list").is_empty());
        assert!(fx.store.list("feed", Listing::TopLevel).await.expect("list").is_empty());
        assert!(fx
            .store
            .exists("feed", "archive/2026_02_24_15_04_PM/a.csv")
            .await
            .expect("archived"));
    }

    #[tokio::test]
    async fn missing_snapshot_table_is_reported() {
        let fx = fixture().await;
        let validator = PreconditionValidator::new(&fx.store, &fx.warehouse, &fx.buckets);
        match validator.ensure_tables_exist().await {
            Err(PreconditionError::MissingTables(tables)) => {
                assert_eq!(tables, vec![WorkingTable::Items]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
