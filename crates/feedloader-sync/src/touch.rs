//! Last-touched bookkeeping consumed by the expiration query.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use feedloader_core::Action;
use sqlx::{QueryBuilder, Sqlite};
use tracing::info;

use crate::warehouse::SqliteWarehouse;

const TOUCH_BATCH_SIZE: usize = 400;

/// Records that the uploader applied `action` to `item_ids` on `date`.
///
/// Upserts and prevent-expiring refresh the last touched date; deletes forget the item.
/// Tracking is per item id across every destination, so in multi-account mode one
/// touch covers the item in all of its destinations.
pub async fn record_touches(
    warehouse: &SqliteWarehouse,
    action: Action,
    item_ids: &[String],
    date: NaiveDate,
) -> Result<u64> {
    let mut tx = warehouse.pool().begin().await?;
    let mut affected = 0u64;

    for chunk in item_ids.chunks(TOUCH_BATCH_SIZE) {
        let mut qb: QueryBuilder<Sqlite> = match action {
            Action::Upsert | Action::PreventExpiring => {
                let mut qb = QueryBuilder::new(
                    "INSERT INTO items_expiration_tracking (item_id, last_touched_date) ",
                );
                qb.push_values(chunk, |mut row, item_id| {
                    row.push_bind(item_id.as_str()).push_bind(date);
                });
                qb.push(
                    " ON CONFLICT(item_id) DO UPDATE SET \
                     last_touched_date = excluded.last_touched_date",
                );
                qb
            }
            Action::Delete => {
                let mut qb =
                    QueryBuilder::new("DELETE FROM items_expiration_tracking WHERE item_id IN (");
                let mut ids = qb.separated(", ");
                for item_id in chunk {
                    ids.push_bind(item_id.as_str());
                }
                qb.push(")");
                qb
            }
        };
        affected += qb
            .build()
            .execute(&mut *tx)
            .await
            .with_context(|| format!("recording {action} touches"))?
            .rows_affected();
    }

    tx.commit().await?;
    info!(action = %action, items = item_ids.len(), affected, "touches recorded");
    Ok(affected)
}
