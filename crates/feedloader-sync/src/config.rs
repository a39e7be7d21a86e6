//! Per-run configuration assembled from the environment at run entry.

use std::path::PathBuf;

use chrono::{FixedOffset, Offset, Utc};
use feedloader_core::{RoutingMode, RoutingPolicy};

use crate::threshold::ThresholdConfig;

pub const DEFAULT_EXPIRATION_THRESHOLD_DAYS: i64 = 25;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketConfig {
    /// Where the ingestion stage drops the `EOF` / `EOF.retry` markers.
    pub update: String,
    pub lock: String,
    pub feed: String,
    pub archive: String,
    pub completed: String,
    pub retrigger: String,
    pub outbox: String,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            update: "update".to_string(),
            lock: "lock".to_string(),
            feed: "feed".to_string(),
            archive: "feed".to_string(),
            completed: "completed".to_string(),
            retrigger: "retrigger".to_string(),
            outbox: "outbox".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpirationConfig {
    pub threshold_days: i64,
    /// Offset in which "today" is evaluated against last touched dates.
    pub utc_offset: FixedOffset,
}

impl Default for ExpirationConfig {
    fn default() -> Self {
        Self {
            threshold_days: DEFAULT_EXPIRATION_THRESHOLD_DAYS,
            utc_offset: utc(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub name: String,
    pub location: String,
    /// HTTP endpoint of the work queue; `None` writes to the outbox bucket.
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "trigger-initiator".to_string(),
            location: "us-central1".to_string(),
            endpoint: None,
            timeout_secs: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub data_dir: PathBuf,
    pub dataset: String,
    pub buckets: BucketConfig,
    pub thresholds: ThresholdConfig,
    pub expiration: ExpirationConfig,
    pub routing: RoutingPolicy,
    pub schema_config_path: PathBuf,
    pub queue: QueueConfig,
}

impl ReconcileConfig {
    /// Defaults rooted at `data_dir`, used by tests and local runs.
    pub fn rooted_at(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            schema_config_path: data_dir.join("config.json"),
            data_dir,
            dataset: "feed_data".to_string(),
            buckets: BucketConfig::default(),
            thresholds: ThresholdConfig::default(),
            expiration: ExpirationConfig::default(),
            routing: RoutingPolicy::default(),
            queue: QueueConfig::default(),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let bucket = |key: &str, default: &str| {
            var(key)
                .map(|v| strip_bucket_prefix(&v))
                .unwrap_or_else(|| default.to_string())
        };

        let data_dir = var("FEEDLOADER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));
        let feed = bucket("FEED_BUCKET", "feed");
        let buckets = BucketConfig {
            update: bucket("UPDATE_BUCKET", "update"),
            lock: bucket("LOCK_BUCKET", "lock"),
            archive: bucket("ARCHIVE_BUCKET", &feed),
            completed: bucket("COMPLETED_FILES_BUCKET", "completed"),
            retrigger: bucket("RETRIGGER_BUCKET", "retrigger"),
            outbox: bucket("OUTBOX_BUCKET", "outbox"),
            feed,
        };

        let is_multi_account = var("IS_MCA")
            .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
            .unwrap_or(false);
        let defaults = RoutingPolicy::default();
        let routing = RoutingPolicy {
            mode: if is_multi_account {
                RoutingMode::MultiAccount
            } else {
                RoutingMode::SingleAccount {
                    default_destination: var("MERCHANT_ID").map(|v| v.trim().to_string()),
                }
            },
            destination_column: var("DESTINATION_COLUMN").unwrap_or(defaults.destination_column),
            falsy_values: lookup("FALSY_DESTINATION_VALUES")
                .map(|v| parse_falsy_values(&v))
                .unwrap_or(defaults.falsy_values),
        };

        let expiration = ExpirationConfig {
            threshold_days: var("EXPIRATION_THRESHOLD")
                .and_then(|v| v.trim().parse().ok())
                .filter(|days: &i64| *days >= 0)
                .unwrap_or(DEFAULT_EXPIRATION_THRESHOLD_DAYS),
            utc_offset: var("TIMEZONE_UTC_OFFSET")
                .and_then(|v| parse_utc_offset(&v))
                .unwrap_or_else(utc),
        };

        let queue = QueueConfig {
            name: var("TASK_QUEUE_NAME").unwrap_or_else(|| "trigger-initiator".to_string()),
            location: var("TASK_QUEUE_LOCATION").unwrap_or_else(|| "us-central1".to_string()),
            endpoint: var("TASK_QUEUE_URL"),
            timeout_secs: var("TASK_QUEUE_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        };

        Self {
            schema_config_path: var("SCHEMA_CONFIG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config.json")),
            dataset: var("BQ_DATASET").unwrap_or_else(|| "feed_data".to_string()),
            thresholds: ThresholdConfig::from_raw(
                var("DELETES_THRESHOLD").as_deref(),
                var("UPSERTS_THRESHOLD").as_deref(),
            ),
            data_dir,
            buckets,
            expiration,
            routing,
            queue,
        }
    }

    pub fn buckets_root(&self) -> PathBuf {
        self.data_dir.join("buckets")
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.sqlite", self.dataset))
    }
}

fn utc() -> FixedOffset {
    Utc.fix()
}

/// Accepts `gs://name`, `gs://name/` and plain `name`.
pub fn strip_bucket_prefix(raw: &str) -> String {
    raw.trim()
        .trim_start_matches("gs://")
        .trim_end_matches('/')
        .to_string()
}

/// Parses `+HH:MM` / `-HH:MM` (and `Z`).
pub fn parse_utc_offset(raw: &str) -> Option<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return None,
    };
    let (hours, minutes) = rest.split_once(':')?;
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Comma-separated list; blanks are always falsy so they are dropped here.
pub fn parse_falsy_values(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}
