//! SQL generation for fingerprinting, diff materialization and counting.
//!
//! Identifiers come from a validated [`SchemaMapping`] or from [`WorkingTable`];
//! literals are produced by this crate (timestamps, dates, integers), never by input.

use chrono::NaiveDate;
use feedloader_core::{WorkingTable, COLUMN_SEPARATOR, NULL_SENTINEL};

use crate::mapping::SchemaMapping;

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Greatest import timestamp strictly older than the current window.
pub fn previous_window(run_ts: &str) -> String {
    format!(
        "SELECT MAX(import_datetime) FROM {history} WHERE import_datetime < {run_ts}",
        history = WorkingTable::StreamingItems.name(),
        run_ts = sql_literal(run_ts),
    )
}

pub fn latest_import_query() -> String {
    format!(
        "SELECT MAX(import_datetime) FROM {}",
        WorkingTable::StreamingItems.name()
    )
}

/// Reads each snapshot item with its raw destination and null-coalesced fingerprint input.
pub fn snapshot_query(mapping: &SchemaMapping, destination_column: Option<&str>) -> String {
    let items = WorkingTable::Items.name();
    let separator = format!(" || char({}) || ", COLUMN_SEPARATOR as u32);
    let content = mapping
        .destination_columns()
        .map(|column| {
            format!(
                "IFNULL(CAST({items}.{col} AS TEXT), {sentinel})",
                col = quote_ident(column),
                sentinel = sql_literal(NULL_SENTINEL),
            )
        })
        .collect::<Vec<_>>()
        .join(&separator);
    let destination = destination_column
        .map(|column| format!("CAST({items}.{} AS TEXT)", quote_ident(column)))
        .unwrap_or_else(|| "NULL".to_string());

    format!(
        "SELECT CAST({items}.item_id AS TEXT) AS item_id, \
         {destination} AS destination_raw, \
         {content} AS content \
         FROM {items}"
    )
}

/// Items fingerprinted in the preceding window but absent from the current one.
pub fn deletions_query(run_ts: &str) -> String {
    format!(
        "SELECT prev.item_id, prev.destination_id \
         FROM {history} AS prev \
         WHERE prev.import_datetime = ({previous}) \
         AND NOT EXISTS (\
           SELECT 1 FROM {history} AS cur \
           WHERE cur.import_datetime = {run_ts} \
           AND cur.item_id = prev.item_id \
           AND cur.destination_id IS prev.destination_id)",
        history = WorkingTable::StreamingItems.name(),
        previous = previous_window(run_ts),
        run_ts = sql_literal(run_ts),
    )
}

/// Items whose current fingerprint differs from the preceding window's.
pub fn changed_upserts_query(run_ts: &str) -> String {
    format!(
        "SELECT cur.item_id, cur.destination_id \
         FROM {history} AS cur \
         INNER JOIN {history} AS prev \
           ON prev.item_id = cur.item_id \
           AND prev.destination_id IS cur.destination_id \
         WHERE cur.import_datetime = {run_ts} \
         AND prev.import_datetime = ({previous}) \
         AND prev.hashed_content <> cur.hashed_content",
        history = WorkingTable::StreamingItems.name(),
        previous = previous_window(run_ts),
        run_ts = sql_literal(run_ts),
    )
}

/// Items of the current window with no fingerprint in the preceding one.
pub fn new_upserts_query(run_ts: &str) -> String {
    format!(
        "SELECT cur.item_id, cur.destination_id \
         FROM {history} AS cur \
         WHERE cur.import_datetime = {run_ts} \
         AND NOT EXISTS (\
           SELECT 1 FROM {history} AS prev \
           WHERE prev.import_datetime = ({previous}) \
           AND prev.item_id = cur.item_id \
           AND prev.destination_id IS cur.destination_id)",
        history = WorkingTable::StreamingItems.name(),
        previous = previous_window(run_ts),
        run_ts = sql_literal(run_ts),
    )
}

/// Unchanged items whose last touch is at least `threshold_days` before `today`.
///
/// Unchanged means an identical fingerprint in the preceding window, which excludes
/// every upsert candidate without reading the upsert table.
/// Touch rows are keyed by item id alone and apply to every destination of the item.
pub fn expiring_query(run_ts: &str, today: NaiveDate, threshold_days: i64) -> String {
    format!(
        "SELECT cur.item_id, cur.destination_id \
         FROM {history} AS cur \
         INNER JOIN {tracking} AS touched ON touched.item_id = cur.item_id \
         WHERE cur.import_datetime = {run_ts} \
         AND julianday({today}) - julianday(touched.last_touched_date) >= {threshold_days} \
         AND EXISTS (\
           SELECT 1 FROM {history} AS prev \
           WHERE prev.import_datetime = ({previous}) \
           AND prev.item_id = cur.item_id \
           AND prev.destination_id IS cur.destination_id \
           AND prev.hashed_content = cur.hashed_content)",
        history = WorkingTable::StreamingItems.name(),
        tracking = WorkingTable::ExpirationTracking.name(),
        previous = previous_window(run_ts),
        run_ts = sql_literal(run_ts),
        today = sql_literal(&today.format("%Y-%m-%d").to_string()),
    )
}

pub fn count_query(table: WorkingTable) -> String {
    format!("SELECT COUNT(*) FROM {}", table.name())
}
