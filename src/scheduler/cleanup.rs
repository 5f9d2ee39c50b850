//! Cleanup manager for history rows of deleted services.

use crate::db::Store;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// How often orphaned rows are purged.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Manager for deleting rows whose service no longer exists.
pub struct CleanupManager {
    store: Arc<Store>,
    stop: broadcast::Sender<()>,
}

impl CleanupManager {
    pub fn new(store: Arc<Store>) -> Self {
        let (stop, _) = broadcast::channel(1);
        Self { store, stop }
    }

    /// Start the cleanup manager background task.
    pub fn start(&self) {
        let store = self.store.clone();
        let mut rx = self.stop.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        process_cleanup(&store);
                    }
                }
            }
        });
    }

    /// Stop the cleanup manager.
    pub fn stop(&self) {
        let _ = self.stop.send(());
    }
}

fn process_cleanup(store: &Store) -> usize {
    match store.purge_orphans() {
        Ok(0) => 0,
        Ok(deleted) => {
            tracing::info!("CleanupManager: Deleted {} orphaned rows", deleted);
            deleted
        }
        Err(e) => {
            tracing::error!("CleanupManager: Failed to purge orphaned rows: {}", e);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_store;
    use crate::db::{Service, StatusEvent};

    #[test]
    fn test_process_cleanup_removes_deleted_service_rows() {
        let (_tmp, store) = test_store();
        let mut kept = Service { name: "kept".to_string(), host: "192.0.2.1".to_string(), ..Default::default() };
        let kept_id = store.add_service(&mut kept).unwrap();

        for service_id in [kept_id, kept_id + 100] {
            store
                .add_event(&StatusEvent { service_id, checker_id: 1, minute: 1, online: true })
                .unwrap();
        }

        assert_eq!(process_cleanup(&store), 1);
        assert_eq!(process_cleanup(&store), 0);
        assert_eq!(store.get_events(kept_id, 1).unwrap().len(), 1);
    }
}
