//! Base-tier buckets: per-bucket statistics and the pending sample queue.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::db::SmokepingBucket;

/// Seconds covered by one base bucket.
pub const BUCKET_SECONDS: i64 = 10;
/// Echoes expected in a complete base bucket, one per sampling tick.
pub const SAMPLES_PER_BUCKET: usize = 5;
/// A bucket is closed once it is this many buckets in the past.
pub const SETTLE_BUCKETS: i64 = 2;

/// Base bucket index containing `now`.
pub fn bucket_of(now: DateTime<Utc>) -> i64 {
    now.timestamp().div_euclid(BUCKET_SECONDS)
}

/// One echo attempt. `latency` is `None` when the echo was lost.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub service_id: i64,
    pub bucket: i64,
    pub latency: Option<f64>,
}

/// Median of already sorted values.
pub fn median(sorted: &[f64]) -> Option<f64> {
    let n = sorted.len();
    match n {
        0 => None,
        _ if n % 2 == 1 => Some(sorted[n / 2]),
        _ => Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2.0),
    }
}

/// Statistics of one base bucket.
///
/// Latency statistics cover answered echoes only. `lost` is `None` when
/// nothing was lost and `downs` is 1 when nothing was answered.
pub fn summarize(service_id: i64, checker_id: i64, start_time: i64, latencies: &[Option<f64>]) -> SmokepingBucket {
    let mut answered: Vec<f64> = latencies.iter().flatten().copied().collect();
    answered.sort_by(|a, b| a.total_cmp(b));

    let sent = latencies.len() as i64;
    let lost = sent - answered.len() as i64;

    SmokepingBucket {
        service_id,
        checker_id,
        start_time,
        duration: 1,
        sent,
        lost: (lost > 0).then_some(lost),
        downs: answered.is_empty().then_some(1),
        med_response_time: median(&answered),
        min_response_time: answered.first().copied(),
        max_response_time: answered.last().copied(),
    }
}

/// Samples waiting for their bucket to close.
#[derive(Debug, Default)]
pub struct SampleQueue {
    samples: Vec<Sample>,
}

impl SampleQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Remove every settled bucket and summarize the complete ones.
    ///
    /// Settled buckets without exactly [`SAMPLES_PER_BUCKET`] samples are
    /// dropped.
    pub fn take_complete(&mut self, current_bucket: i64, checker_id: i64) -> Vec<SmokepingBucket> {
        let cutoff = current_bucket - SETTLE_BUCKETS;
        let (settled, pending): (Vec<Sample>, Vec<Sample>) =
            self.samples.drain(..).partition(|s| s.bucket <= cutoff);
        self.samples = pending;

        let mut grouped: BTreeMap<(i64, i64), Vec<Option<f64>>> = BTreeMap::new();
        for sample in settled {
            grouped.entry((sample.bucket, sample.service_id)).or_default().push(sample.latency);
        }

        grouped
            .into_iter()
            .filter_map(|((bucket, service_id), latencies)| {
                if latencies.len() != SAMPLES_PER_BUCKET {
                    tracing::debug!(
                        "Smokeping: Dropping bucket {} of service {} with {} samples",
                        bucket,
                        service_id,
                        latencies.len()
                    );
                    return None;
                }
                Some(summarize(service_id, checker_id, bucket, &latencies))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_median() {
        assert_eq!(median(&[10.0, 20.0, 30.0, 40.0]), Some(25.0));
        assert_eq!(median(&[10.0, 20.0, 30.0]), Some(20.0));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_summarize_partial_loss() {
        let b = summarize(3, 1, 100, &[Some(30.0), None, Some(10.0), Some(40.0), Some(20.0)]);
        assert_eq!(b.sent, 5);
        assert_eq!(b.lost, Some(1));
        assert_eq!(b.downs, None);
        assert_eq!(b.med_response_time, Some(25.0));
        assert_eq!(b.min_response_time, Some(10.0));
        assert_eq!(b.max_response_time, Some(40.0));
        assert_eq!((b.start_time, b.duration), (100, 1));
    }

    #[test]
    fn test_summarize_all_lost() {
        let b = summarize(3, 1, 100, &[None; 5]);
        assert_eq!(b.lost, Some(5));
        assert_eq!(b.downs, Some(1));
        assert_eq!(b.med_response_time, None);
        assert_eq!(b.min_response_time, None);
        assert_eq!(b.max_response_time, None);
    }

    #[test]
    fn test_summarize_no_loss() {
        let b = summarize(3, 1, 100, &[Some(1.0); 5]);
        assert_eq!(b.lost, None);
        assert_eq!(b.downs, None);
    }

    #[test]
    fn test_bucket_of() {
        let now = Utc.timestamp_opt(1_700_000_019, 0).unwrap();
        assert_eq!(bucket_of(now), 170_000_001);
    }

    #[test]
    fn test_take_complete_waits_and_drops_partial() {
        let mut queue = SampleQueue::new();
        for _ in 0..5 {
            queue.push(Sample { service_id: 1, bucket: 10, latency: Some(5.0) });
        }
        for _ in 0..3 {
            queue.push(Sample { service_id: 2, bucket: 10, latency: Some(5.0) });
        }
        queue.push(Sample { service_id: 1, bucket: 11, latency: Some(5.0) });

        // Bucket 10 is not settled until bucket 12.
        assert!(queue.take_complete(11, 1).is_empty());
        assert_eq!(queue.len(), 9);

        let complete = queue.take_complete(12, 1);
        assert_eq!(complete.len(), 1);
        assert_eq!((complete[0].service_id, complete[0].start_time), (1, 10));

        // Service 2's partial bucket is gone, bucket 11 still waits.
        assert_eq!(queue.len(), 1);
    }
}
