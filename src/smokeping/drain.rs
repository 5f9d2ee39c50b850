//! Overflow buffer drain.

use std::sync::Arc;

use crate::db::{BucketSink, OverflowBuffer, SmokepingBucket};

use super::InProgress;

/// Store `buckets`, falling back to the overflow buffer when the primary
/// store rejects them. Returns how many were buffered.
pub fn persist_buckets(sink: &dyn BucketSink, overflow: &OverflowBuffer, buckets: &[SmokepingBucket]) -> usize {
    if buckets.is_empty() {
        return 0;
    }

    let Err(e) = sink.upsert_buckets(buckets) else {
        return 0;
    };
    tracing::warn!("Smokeping: Store write failed, buffering {} buckets: {}", buckets.len(), e);

    let mut buffered = 0;
    for bucket in buckets {
        match overflow.push(bucket) {
            Ok(()) => buffered += 1,
            Err(e) => tracing::error!(
                "Smokeping: Lost bucket {} of service {}: {}",
                bucket.start_time,
                bucket.service_id,
                e
            ),
        }
    }
    buffered
}

/// Replays buffered buckets into the primary store.
pub struct Drainer {
    sink: Arc<dyn BucketSink>,
    overflow: Arc<OverflowBuffer>,
    saving: InProgress,
}

impl Drainer {
    pub fn new(sink: Arc<dyn BucketSink>, overflow: Arc<OverflowBuffer>) -> Self {
        Self { sink, overflow, saving: InProgress::default() }
    }

    /// One drain pass. Each row is upserted on its own and removed from the
    /// buffer once stored. Returns the number of rows drained, or `None`
    /// when another pass is already running.
    pub fn drain(&self) -> Option<usize> {
        let _guard = self.saving.try_begin()?;

        let rows = match self.overflow.all() {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!("Smokeping: Failed to read overflow buffer: {}", e);
                return Some(0);
            }
        };

        let mut drained = 0;
        let mut failed = 0;
        for row in &rows {
            if self.sink.upsert_buckets(std::slice::from_ref(row)).is_err() {
                failed += 1;
                continue;
            }
            match self.overflow.remove(row) {
                Ok(()) => drained += 1,
                Err(e) => tracing::error!("Smokeping: Failed to remove drained bucket: {}", e),
            }
        }

        if failed > 0 {
            tracing::warn!("Smokeping: {} buffered buckets still waiting for the store", failed);
        }
        if drained > 0 {
            tracing::info!("Smokeping: Drained {} buffered buckets", drained);
        }
        Some(drained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{bucket, test_store};
    use crate::db::{DbError, Store};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::NamedTempFile;

    /// A store that can be switched offline.
    struct SwitchableSink {
        store: Store,
        offline: AtomicBool,
    }

    impl BucketSink for SwitchableSink {
        fn upsert_buckets(&self, buckets: &[SmokepingBucket]) -> Result<(), DbError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(DbError::Migration("store unreachable".to_string()));
            }
            self.store.upsert_buckets(buckets)
        }
    }

    fn setup() -> (NamedTempFile, NamedTempFile, Arc<SwitchableSink>, Arc<OverflowBuffer>) {
        let (db_tmp, store) = test_store();
        let buf_tmp = NamedTempFile::new().unwrap();
        let overflow = Arc::new(OverflowBuffer::new(buf_tmp.path()).unwrap());
        let sink = Arc::new(SwitchableSink { store, offline: AtomicBool::new(true) });
        (db_tmp, buf_tmp, sink, overflow)
    }

    #[test]
    fn test_failed_write_is_recovered_by_drain() {
        let (_db, _buf, sink, overflow) = setup();
        let rows = [bucket(1, 100, 1), bucket(1, 101, 1)];

        assert_eq!(persist_buckets(sink.as_ref(), &overflow, &rows), 2);
        assert_eq!(overflow.len().unwrap(), 2);

        let drainer = Drainer::new(sink.clone(), overflow.clone());

        // Still offline: nothing moves.
        assert_eq!(drainer.drain(), Some(0));
        assert_eq!(overflow.len().unwrap(), 2);

        sink.offline.store(false, Ordering::SeqCst);
        assert_eq!(drainer.drain(), Some(2));
        assert_eq!(overflow.len().unwrap(), 0);
        assert_eq!(sink.store.get_buckets(1, 1, 1).unwrap(), rows.to_vec());
    }

    #[test]
    fn test_drain_racing_direct_write_keeps_one_row() {
        let (_db, _buf, sink, overflow) = setup();
        let row = bucket(1, 100, 1);
        persist_buckets(sink.as_ref(), &overflow, &[row]);

        // The same key reaches the store directly before the drain runs.
        sink.offline.store(false, Ordering::SeqCst);
        sink.store.upsert_buckets(&[row]).unwrap();

        let drainer = Drainer::new(sink.clone(), overflow.clone());
        assert_eq!(drainer.drain(), Some(1));
        assert_eq!(sink.store.get_buckets(1, 1, 1).unwrap().len(), 1);
        assert_eq!(overflow.len().unwrap(), 0);
    }

    #[test]
    fn test_drain_leaves_existing_row_untouched() {
        let (_db, _buf, sink, overflow) = setup();
        let mut buffered = bucket(1, 100, 1);
        buffered.sent = 4;
        buffered.med_response_time = Some(99.0);
        persist_buckets(sink.as_ref(), &overflow, &[buffered]);

        sink.offline.store(false, Ordering::SeqCst);
        let stored = bucket(1, 100, 1);
        sink.store.upsert_buckets(&[stored]).unwrap();

        let drainer = Drainer::new(sink.clone(), overflow.clone());
        assert_eq!(drainer.drain(), Some(1));
        assert_eq!(sink.store.get_buckets(1, 1, 1).unwrap(), vec![stored]);
        assert_eq!(overflow.len().unwrap(), 0);
    }

    #[test]
    fn test_drain_skips_while_running() {
        let (_db, _buf, sink, overflow) = setup();
        let drainer = Drainer::new(sink, overflow);

        let _held = drainer.saving.try_begin().unwrap();
        assert_eq!(drainer.drain(), None);
    }

    #[test]
    fn test_successful_write_bypasses_buffer() {
        let (_db, _buf, sink, overflow) = setup();
        sink.offline.store(false, Ordering::SeqCst);

        assert_eq!(persist_buckets(sink.as_ref(), &overflow, &[bucket(1, 5, 1)]), 0);
        assert_eq!(overflow.len().unwrap(), 0);
    }
}
