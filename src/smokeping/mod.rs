//! Smokeping engine: fast ICMP sampling of raw hosts and multi-resolution
//! latency history.
//!
//! Three loops run side by side: sampling every [`SAMPLE_TICK`], the tier
//! cascade every [`AGGREGATE_INTERVAL`] and the overflow drain every
//! [`DRAIN_INTERVAL`].

mod aggregate;
mod bucket;
mod drain;

pub use aggregate::*;
pub use bucket::*;
pub use drain::*;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::{Interval, MissedTickBehavior};

use crate::db::{BucketSink, OverflowBuffer, Store};
use crate::probe::Pinger;
use crate::resolver::Targets;
use crate::scheduler::round_ms;

pub const SAMPLE_TICK: Duration = Duration::from_secs(2);
/// Echo timeout. Lost echoes are not retried.
pub const PING_TIMEOUT: Duration = Duration::from_secs(1);
pub const AGGREGATE_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const DRAIN_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Interval for the engine loops. A stalled runtime must not replay missed
/// sampling ticks: a burst would put extra samples into one bucket.
fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Single-slot "in progress" flag.
#[derive(Debug, Default)]
pub struct InProgress(AtomicBool);

/// Clears its [`InProgress`] flag when dropped.
pub struct InProgressGuard<'a>(&'a AtomicBool);

impl InProgress {
    /// `None` when a run is already in progress.
    pub fn try_begin(&self) -> Option<InProgressGuard<'_>> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InProgressGuard(&self.0))
    }
}

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the sample queue and the background loops.
pub struct Smokeping {
    checker_id: i64,
    store: Arc<Store>,
    overflow: Arc<OverflowBuffer>,
    targets: Arc<Targets>,
    pinger: Arc<dyn Pinger>,
    tiers: Vec<Tier>,
    queue: Mutex<SampleQueue>,
    drainer: Drainer,
    aggregating: InProgress,
    stop: broadcast::Sender<()>,
}

impl Smokeping {
    pub fn new(
        checker_id: i64,
        store: Arc<Store>,
        overflow: Arc<OverflowBuffer>,
        targets: Arc<Targets>,
        pinger: Arc<dyn Pinger>,
        tiers: Vec<Tier>,
    ) -> Self {
        let (stop, _) = broadcast::channel(1);
        let sink: Arc<dyn BucketSink> = store.clone();
        Self {
            drainer: Drainer::new(sink, overflow.clone()),
            checker_id,
            store,
            overflow,
            targets,
            pinger,
            tiers,
            queue: Mutex::new(SampleQueue::new()),
            aggregating: InProgress::default(),
            stop,
        }
    }

    /// Start the sampling, aggregation and drain loops.
    pub fn start(self: &Arc<Self>) {
        tracing::info!(
            "Smokeping: Sampling every {:?}, aggregating every {:?}",
            SAMPLE_TICK,
            AGGREGATE_INTERVAL
        );

        self.spawn_loop(SAMPLE_TICK, |engine| engine.sample_tick());
        self.spawn_loop(AGGREGATE_INTERVAL, |engine| {
            engine.aggregate();
        });
        self.spawn_loop(DRAIN_INTERVAL, |engine| {
            engine.drain();
        });
    }

    fn spawn_loop<F>(self: &Arc<Self>, period: Duration, mut tick: F)
    where
        F: FnMut(&Arc<Self>) + Send + 'static,
    {
        let engine = self.clone();
        let mut rx = self.stop.subscribe();

        tokio::spawn(async move {
            let mut interval = ticker(period);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => tick(&engine),
                }
            }
        });
    }

    /// Stop all loops.
    pub fn stop(&self) {
        let _ = self.stop.send(());
    }

    /// One sampling tick: spread one echo per tracked host over the tick,
    /// then persist the buckets that closed.
    pub fn sample_tick(self: &Arc<Self>) {
        let hosts = self.targets.current().smokeping_targets();
        let spread = SAMPLE_TICK / hosts.len().max(1) as u32;

        for (i, (service_id, ip)) in hosts.into_iter().enumerate() {
            let engine = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(spread * i as u32).await;
                let bucket = bucket_of(Utc::now());
                let latency = engine.pinger.ping(ip, PING_TIMEOUT).await.ok().map(round_ms);
                engine.record(Sample { service_id, bucket, latency });
            });
        }

        self.flush_complete();
    }

    fn record(&self, sample: Sample) {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).push(sample);
    }

    /// Persist every closed bucket. Returns the number of buckets written
    /// to either store.
    pub fn flush_complete(&self) -> usize {
        let buckets = self
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take_complete(bucket_of(Utc::now()), self.checker_id);

        persist_buckets(self.store.as_ref(), &self.overflow, &buckets);
        buckets.len()
    }

    /// One cascade pass, skipped when another is still running.
    pub fn aggregate(&self) -> Option<CascadeStats> {
        let Some(_guard) = self.aggregating.try_begin() else {
            tracing::debug!("Smokeping: Aggregation already running");
            return None;
        };

        match cascade(&self.store, self.checker_id, &self.tiers, bucket_of(Utc::now())) {
            Ok(stats) => {
                tracing::debug!(
                    "Smokeping: Aggregated {} rows into {}, expired {}",
                    stats.folded,
                    stats.promoted,
                    stats.expired
                );
                Some(stats)
            }
            Err(e) => {
                tracing::error!("Smokeping: Aggregation failed: {}", e);
                None
            }
        }
    }

    /// One overflow drain pass.
    pub fn drain(&self) -> Option<usize> {
        self.drainer.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_store;
    use crate::probe::ProbeError;
    use crate::resolver::{ResolvedService, ResolvedTargets};
    use crate::db::{Service, ServiceKind};
    use async_trait::async_trait;
    use std::net::IpAddr;
    use tempfile::NamedTempFile;

    struct FixedPinger;

    #[async_trait]
    impl Pinger for FixedPinger {
        async fn ping(&self, ip: IpAddr, _timeout: Duration) -> Result<f64, ProbeError> {
            if ip.is_loopback() {
                Ok(0.44)
            } else {
                Err(ProbeError::Timeout(PING_TIMEOUT))
            }
        }
    }

    fn engine() -> (NamedTempFile, NamedTempFile, Arc<Store>, Arc<Smokeping>) {
        let (db_tmp, store) = test_store();
        let store = Arc::new(store);
        let buf_tmp = NamedTempFile::new().unwrap();
        let overflow = Arc::new(OverflowBuffer::new(buf_tmp.path()).unwrap());

        let targets = Arc::new(Targets::new());
        targets.replace(ResolvedTargets::new(vec![ResolvedService {
            service: Service { id: 7, kind: ServiceKind::RawHost, host: "127.0.0.1".to_string(), ..Default::default() },
            ipv4: "127.0.0.1".parse().ok(),
            ipv6: None,
            ip: "127.0.0.1".parse().ok(),
            error: None,
        }]));

        let engine = Arc::new(Smokeping::new(
            1,
            store.clone(),
            overflow,
            targets,
            Arc::new(FixedPinger),
            DEFAULT_TIERS.to_vec(),
        ));
        (db_tmp, buf_tmp, store, engine)
    }

    #[test]
    fn test_in_progress_guard() {
        let flag = InProgress::default();
        let guard = flag.try_begin();
        assert!(guard.is_some());
        assert!(flag.try_begin().is_none());
        drop(guard);
        assert!(flag.try_begin().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_does_not_replay_missed_ticks() {
        let mut interval = ticker(SAMPLE_TICK);
        let start = tokio::time::Instant::now();
        interval.tick().await;

        // Stall across the ticks due at 2s, 4s and 6s.
        tokio::time::advance(Duration::from_secs(7)).await;
        interval.tick().await;
        assert_eq!(start.elapsed(), Duration::from_secs(7));

        // Back on the 2s grid, no catch-up burst.
        interval.tick().await;
        assert_eq!(start.elapsed(), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_flush_persists_closed_buckets() {
        let (_db, _buf, store, engine) = engine();
        let closed = bucket_of(Utc::now()) - SETTLE_BUCKETS - 1;
        for _ in 0..SAMPLES_PER_BUCKET {
            engine.record(Sample { service_id: 7, bucket: closed, latency: Some(0.4) });
        }

        assert_eq!(engine.flush_complete(), 1);
        let rows = store.get_buckets(7, 1, 1).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].start_time, closed);
        assert_eq!(rows[0].med_response_time, Some(0.4));
    }

    #[tokio::test]
    async fn test_sample_tick_queues_one_echo_per_host() {
        let (_db, _buf, _store, engine) = engine();
        engine.sample_tick();

        // Single host: no stagger delay, only the echo itself.
        for _ in 0..50 {
            if !engine.queue.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let queue = engine.queue.lock().unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_aggregate_on_empty_store() {
        let (_db, _buf, _store, engine) = engine();
        assert_eq!(engine.aggregate(), Some(CascadeStats::default()));
        assert_eq!(engine.drain(), Some(0));
    }
}
