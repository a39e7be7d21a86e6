//! Safety ceilings that suppress bulk deletes/upserts caused by corrupted input.

use tracing::error;

pub const DEFAULT_DELETES_THRESHOLD: u64 = 100_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThresholdConfig {
    deletes: Option<u64>,
    upserts: Option<u64>,
}

impl ThresholdConfig {
    pub fn new(deletes: Option<u64>, upserts: Option<u64>) -> Self {
        Self {
            deletes: deletes.filter(|v| *v > 0),
            upserts: upserts.filter(|v| *v > 0),
        }
    }

    /// Non-numeric, zero or negative values count as "not configured".
    pub fn from_raw(deletes: Option<&str>, upserts: Option<&str>) -> Self {
        Self {
            deletes: parse_ceiling(deletes),
            upserts: parse_ceiling(upserts),
        }
    }

    pub fn delete_ceiling(&self) -> u64 {
        self.deletes.unwrap_or(DEFAULT_DELETES_THRESHOLD)
    }

    /// `None` disables the upsert check entirely.
    pub fn upsert_ceiling(&self) -> Option<u64> {
        self.upserts
    }
}

fn parse_ceiling(raw: Option<&str>) -> Option<u64> {
    raw?.trim().parse::<i64>().ok().filter(|v| *v > 0).map(|v| v as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdDecision {
    pub delete_count: u64,
    pub upsert_count: u64,
    /// The delete working set is left untouched; only the dispatched count is zeroed.
    pub deletes_suppressed: bool,
    /// The caller must roll back this run's fingerprints.
    pub upserts_suppressed: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ThresholdGuard {
    config: ThresholdConfig,
}

impl ThresholdGuard {
    pub fn new(config: ThresholdConfig) -> Self {
        Self { config }
    }

    pub fn apply(&self, delete_count: u64, upsert_count: u64) -> ThresholdDecision {
        let mut decision = ThresholdDecision {
            delete_count,
            upsert_count,
            deletes_suppressed: false,
            upserts_suppressed: false,
        };

        let delete_ceiling = self.config.delete_ceiling();
        if delete_count > delete_ceiling {
            error!(
                error_class = "threshold_breach",
                delete_count,
                threshold = delete_ceiling,
                "deletes count crossed deletes threshold; skipping delete processing"
            );
            decision.delete_count = 0;
            decision.deletes_suppressed = true;
        }

        if let Some(upsert_ceiling) = self.config.upsert_ceiling() {
            if upsert_count > upsert_ceiling {
                error!(
                    error_class = "threshold_breach",
                    upsert_count,
                    threshold = upsert_ceiling,
                    "upserts count crossed upserts threshold; skipping upsert processing"
                );
                decision.upsert_count = 0;
                decision.upserts_suppressed = true;
            }
        }

        decision
    }
}
