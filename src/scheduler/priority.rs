use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};

/// Source of weights for promoted tasks, always below anything handed out before
static PROMOTED_WEIGHT: AtomicI64 = AtomicI64::new(-1);

fn next_promoted_weight() -> i64 {
    PROMOTED_WEIGHT.fetch_sub(1, AtomicOrdering::SeqCst)
}

/// Ordering key of a pending series download. Lower weight runs first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadPriority {
    pub patient: String,
    pub study: String,
    pub series: String,
    pub weight: i64,
}

impl DownloadPriority {
    pub fn new(
        patient: impl Into<String>,
        study: impl Into<String>,
        series: impl Into<String>,
        weight: i64,
    ) -> Self {
        Self {
            patient: patient.into(),
            study: study.into(),
            series: series.into(),
            weight,
        }
    }

    /// Move ahead of every task prioritized so far
    pub fn promote(&mut self) {
        self.weight = next_promoted_weight();
    }
}
