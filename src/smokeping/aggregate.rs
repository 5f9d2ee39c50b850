//! Cascading aggregation through the tier ladder.
//!
//! Rows of a finer tier that fall out of its retention horizon are folded
//! into the next coarser tier and deleted in the same transaction. Tiers
//! are walked finest first, so a freshly promoted row can move up again in
//! the same pass.

use std::collections::BTreeMap;

use crate::db::{DbError, SmokepingBucket, Store};

use super::bucket::BUCKET_SECONDS;

const UNITS_PER_DAY: i64 = 86_400 / BUCKET_SECONDS;

/// One resolution of the ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tier {
    /// Bucket width in base units.
    pub duration: i64,
    /// How long rows of this tier are kept.
    pub retention_days: i64,
}

impl Tier {
    pub const fn new(duration: i64, retention_days: i64) -> Self {
        Self { duration, retention_days }
    }

    fn retention_units(&self) -> i64 {
        self.retention_days * UNITS_PER_DAY
    }
}

/// Default ladder: 10s, 30s, 1m, 5m and 10m buckets.
pub const DEFAULT_TIERS: [Tier; 5] = [
    Tier::new(1, 7),
    Tier::new(3, 14),
    Tier::new(6, 28),
    Tier::new(30, 84),
    Tier::new(60, 364),
];

/// Validate a tier ladder.
pub fn validate_ladder(tiers: &[Tier]) -> Result<(), String> {
    let Some(first) = tiers.first() else {
        return Err("tier ladder is empty".to_string());
    };
    if first.duration != 1 {
        return Err(format!("finest tier must be 1 unit wide, got {}", first.duration));
    }

    for pair in tiers.windows(2) {
        let (finer, coarser) = (pair[0], pair[1]);
        if coarser.duration <= finer.duration {
            return Err(format!(
                "tier durations must increase: {} after {}",
                coarser.duration, finer.duration
            ));
        }
        if coarser.duration % finer.duration != 0 {
            return Err(format!(
                "duration {} is not a multiple of finer duration {}",
                coarser.duration, finer.duration
            ));
        }
        if coarser.retention_days <= finer.retention_days {
            return Err(format!(
                "tier retention must increase: {} days after {} days",
                coarser.retention_days, finer.retention_days
            ));
        }
    }

    Ok(())
}

/// Start of the `duration` wide window containing `time`.
pub fn align_down(time: i64, duration: i64) -> i64 {
    time - time.rem_euclid(duration)
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

fn sum_nonzero(values: impl Iterator<Item = Option<i64>>) -> Option<i64> {
    let total: i64 = values.flatten().sum();
    (total > 0).then_some(total)
}

/// Fold finer rows of one service into a coarser row starting at `start_time`.
///
/// Latency statistics are the means over rows that have a median; fully
/// down rows contribute loss only.
pub fn fold(rows: &[SmokepingBucket], start_time: i64, duration: i64) -> Option<SmokepingBucket> {
    let first = rows.first()?;
    let answered: Vec<&SmokepingBucket> = rows.iter().filter(|r| r.med_response_time.is_some()).collect();

    Some(SmokepingBucket {
        service_id: first.service_id,
        checker_id: first.checker_id,
        start_time,
        duration,
        sent: rows.iter().map(|r| r.sent).sum(),
        lost: sum_nonzero(rows.iter().map(|r| r.lost)),
        downs: sum_nonzero(rows.iter().map(|r| r.downs)),
        med_response_time: mean(answered.iter().filter_map(|r| r.med_response_time)),
        min_response_time: mean(answered.iter().filter_map(|r| r.min_response_time)),
        max_response_time: mean(answered.iter().filter_map(|r| r.max_response_time)),
    })
}

/// Row counts of one cascade pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeStats {
    pub promoted: usize,
    pub folded: usize,
    pub expired: usize,
}

/// Run one cascade pass at `now` (in base units).
///
/// A failing tier aborts the pass; its transaction leaves no partial state
/// and the next pass starts over.
pub fn cascade(store: &Store, checker_id: i64, tiers: &[Tier], now: i64) -> Result<CascadeStats, DbError> {
    let mut stats = CascadeStats::default();

    for pair in tiers.windows(2) {
        let (finer, coarser) = (pair[0], pair[1]);
        // Whole coarser windows only.
        let cutoff = align_down(now - finer.retention_units(), coarser.duration);

        let rows = store.get_buckets_before(checker_id, finer.duration, cutoff)?;
        if rows.is_empty() {
            continue;
        }

        let mut windows: BTreeMap<(i64, i64), Vec<SmokepingBucket>> = BTreeMap::new();
        for row in &rows {
            let start = align_down(row.start_time, coarser.duration);
            windows.entry((row.service_id, start)).or_default().push(*row);
        }

        let coarse: Vec<SmokepingBucket> = windows
            .iter()
            .filter_map(|(&(_, start), group)| fold(group, start, coarser.duration))
            .collect();

        stats.folded += store.promote_buckets(&coarse, &rows)?;
        stats.promoted += coarse.len();

        tracing::debug!(
            "Smokeping: Folded {} rows of duration {} into {} rows of duration {}",
            rows.len(),
            finer.duration,
            coarse.len(),
            coarser.duration
        );
    }

    if let Some(last) = tiers.last() {
        stats.expired = store.delete_buckets_before(checker_id, last.duration, now - last.retention_units())?;
    }

    Ok(stats)
}
