//! Core domain model for feed reconciliation runs.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "feedloader-core";

/// Sentinel substituted for null column values before fingerprinting.
pub const NULL_SENTINEL: &str = "NULL";

/// Separator placed between mapped column values inside a fingerprint input.
pub const COLUMN_SEPARATOR: char = '\u{1f}';

/// Fixed-width so that lexical order of stored timestamps equals time order.
pub const IMPORT_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub const EOF_TRIGGER_NAME: &str = "EOF";
pub const RETRY_TRIGGER_NAME: &str = "EOF.retry";

/// The two recognized zero-length marker objects that start a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    /// Ingestion finished; a fresh run must take the lock.
    Eof,
    /// Ingestion retry finished; continues a run whose lock was retained.
    Retry,
}

impl TriggerKind {
    pub fn marker_name(self) -> &'static str {
        match self {
            TriggerKind::Eof => EOF_TRIGGER_NAME,
            TriggerKind::Retry => RETRY_TRIGGER_NAME,
        }
    }
}

/// Object-finalized notification naming the marker and its bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub bucket: String,
    pub name: String,
    /// Byte length as reported by the notification (a decimal string).
    pub size: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TriggerRejection {
    #[error("file {0} was not an EOF marker")]
    UnrecognizedName(String),
    #[error("file {name} was not empty (size {size})")]
    NotEmpty { name: String, size: String },
}

impl TriggerEvent {
    pub fn new(bucket: impl Into<String>, name: impl Into<String>, size: u64) -> Self {
        Self {
            bucket: bucket.into(),
            name: name.into(),
            size: size.to_string(),
        }
    }

    /// Accepts only `EOF` / `EOF.retry` markers whose size parses to exactly zero.
    pub fn validate(&self) -> Result<TriggerKind, TriggerRejection> {
        let kind = match self.name.as_str() {
            EOF_TRIGGER_NAME => TriggerKind::Eof,
            RETRY_TRIGGER_NAME => TriggerKind::Retry,
            other => return Err(TriggerRejection::UnrecognizedName(other.to_string())),
        };
        match self.size.trim().parse::<u64>() {
            Ok(0) => Ok(kind),
            _ => Err(TriggerRejection::NotEmpty {
                name: self.name.clone(),
                size: self.size.clone(),
            }),
        }
    }
}

/// Named tables of the analytical store touched by a reconciliation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkingTable {
    /// Snapshot loaded by the ingestion stage for this run.
    Items,
    ItemsToDelete,
    ItemsToPreventExpiring,
    ItemsToUpsert,
    /// Append-only fingerprint history.
    StreamingItems,
    /// Last touched date per item, maintained by the uploader.
    ExpirationTracking,
}

impl WorkingTable {
    /// Tables whose absence makes a run impossible.
    pub const REQUIRED: [WorkingTable; 5] = [
        WorkingTable::Items,
        WorkingTable::ItemsToDelete,
        WorkingTable::ItemsToPreventExpiring,
        WorkingTable::ItemsToUpsert,
        WorkingTable::StreamingItems,
    ];

    pub fn name(self) -> &'static str {
        match self {
            WorkingTable::Items => "items",
            WorkingTable::ItemsToDelete => "items_to_delete",
            WorkingTable::ItemsToPreventExpiring => "items_to_prevent_expiring",
            WorkingTable::ItemsToUpsert => "items_to_upsert",
            WorkingTable::StreamingItems => "streaming_items",
            WorkingTable::ExpirationTracking => "items_expiration_tracking",
        }
    }

    pub fn qualified(self, dataset: &str) -> String {
        format!("{dataset}.{}", self.name())
    }
}

impl fmt::Display for WorkingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Downstream catalog operation a diff result set feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Upsert,
    Delete,
    PreventExpiring,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Upsert => "upsert",
            Action::Delete => "delete",
            Action::PreventExpiring => "prevent_expiring",
        }
    }

    pub fn table(self) -> WorkingTable {
        match self {
            Action::Upsert => WorkingTable::ItemsToUpsert,
            Action::Delete => WorkingTable::ItemsToDelete,
            Action::PreventExpiring => WorkingTable::ItemsToPreventExpiring,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the fingerprint history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub item_id: String,
    pub destination_id: Option<String>,
    pub content_hash: String,
    pub import_timestamp: String,
}

/// Cardinalities of the three diff result sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffCounts {
    pub delete: u64,
    pub upsert: u64,
    pub expiring: u64,
}

/// Record handed to the completion dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionPayload {
    pub delete_count: u64,
    pub expiring_count: u64,
    pub upsert_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingMode {
    /// Every item goes to one account; falsy per-item values fall back to the default.
    SingleAccount { default_destination: Option<String> },
    /// Items must carry their own destination; falsy values are skipped.
    MultiAccount,
}

/// Where a snapshot item is routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Destination(Option<String>),
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingPolicy {
    pub mode: RoutingMode,
    /// Column carrying the per-item destination, when the mapping declares it.
    pub destination_column: String,
    /// Values treated as "no destination" in addition to null and blank.
    pub falsy_values: Vec<String>,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            mode: RoutingMode::SingleAccount {
                default_destination: None,
            },
            destination_column: "google_merchant_id".to_string(),
            falsy_values: vec!["0".to_string()],
        }
    }
}

impl RoutingPolicy {
    pub fn is_falsy(&self, raw: Option<&str>) -> bool {
        match raw.map(str::trim) {
            None => true,
            Some("") => true,
            Some(value) => self.falsy_values.iter().any(|f| f == value),
        }
    }

    pub fn route(&self, raw: Option<&str>) -> Route {
        if !self.is_falsy(raw) {
            return Route::Destination(raw.map(|v| v.trim().to_string()));
        }
        match &self.mode {
            RoutingMode::SingleAccount {
                default_destination,
            } => Route::Destination(default_destination.clone()),
            RoutingMode::MultiAccount => Route::Skip,
        }
    }
}

/// SHA-256 hex digest of an already null-coalesced fingerprint input.
pub fn content_fingerprint(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Builds the fingerprint input from column values in mapping order.
pub fn fingerprint_input<'a>(values: impl IntoIterator<Item = Option<&'a str>>) -> String {
    let mut out = String::new();
    for (idx, value) in values.into_iter().enumerate() {
        if idx > 0 {
            out.push(COLUMN_SEPARATOR);
        }
        out.push_str(value.unwrap_or(NULL_SENTINEL));
    }
    out
}

pub fn format_import_timestamp(at: DateTime<Utc>) -> String {
    at.format(IMPORT_TIMESTAMP_FORMAT).to_string()
}
