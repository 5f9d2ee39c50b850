//! Daily rollup of per-minute status samples.

use chrono::{DateTime, Utc};

use crate::db::{DailyStatus, DbError, Service, StatusSample, Store};

const MINUTES_PER_DAY: i64 = 24 * 60;
const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// The last fully elapsed day at `now`, in days since the epoch.
pub fn previous_day(now: DateTime<Utc>) -> i64 {
    now.timestamp().div_euclid(SECONDS_PER_DAY) - 1
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Summarize the samples of one day. `None` when there are none.
pub fn summarize_day(service_id: i64, checker_id: i64, day: i64, samples: &[StatusSample]) -> Option<DailyStatus> {
    if samples.is_empty() {
        return None;
    }

    let online: Vec<&StatusSample> = samples.iter().filter(|s| s.online).collect();
    let uptime = round_to(online.len() as f64 / samples.len() as f64 * 100.0, 3);

    let times: Vec<f64> = online.iter().filter_map(|s| s.response_time).collect();
    let response_time = if times.is_empty() {
        None
    } else {
        Some(round_to(times.iter().sum::<f64>() / times.len() as f64, 1))
    };

    Some(DailyStatus {
        service_id,
        checker_id,
        day,
        statuses_amount: samples.len() as i64,
        uptime,
        response_time,
    })
}

/// Fold yesterday's samples of `service` into one daily row, once.
///
/// The summary is written before the samples are deleted. Samples left by a
/// failed delete go away with the next successful rollup since the delete
/// covers everything before the end of the rolled up day.
pub fn rollup_if_due(store: &Store, checker_id: i64, service: &Service, now: DateTime<Utc>) -> Result<(), DbError> {
    let day = previous_day(now);
    if store.daily_status_exists(service.id, checker_id, day)? {
        return Ok(());
    }

    let first_minute = day * MINUTES_PER_DAY;
    let end_minute = first_minute + MINUTES_PER_DAY;
    let samples = store.get_statuses(service.id, checker_id, first_minute, end_minute)?;

    let Some(daily) = summarize_day(service.id, checker_id, day, &samples) else {
        return Ok(());
    };
    store.add_daily_status(&daily)?;

    tracing::debug!(
        "Scheduler: Rolled up day {} for {}: {} samples, {}% uptime",
        day,
        service.name,
        daily.statuses_amount,
        daily.uptime
    );

    if let Err(e) = store.delete_statuses_before(service.id, checker_id, end_minute) {
        tracing::warn!("Scheduler: Failed to delete rolled up statuses for {}: {}", service.name, e);
    }

    Ok(())
}
