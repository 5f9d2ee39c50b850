//! Fixtures shared by tests across the crate.

use tempfile::NamedTempFile;

use super::{Checker, SmokepingBucket, Store};

/// Fresh store with checker 1 ("Checker", Paris, check second 30).
pub(crate) fn test_store() -> (NamedTempFile, Store) {
    let tmp = NamedTempFile::new().unwrap();
    let store = Store::new(tmp.path()).unwrap();
    store
        .add_checker(&Checker {
            id: 1,
            name: "Checker".to_string(),
            location: "Paris".to_string(),
            check_second: 30,
        })
        .unwrap();
    (tmp, store)
}

/// A fully answered base-tier style bucket for checker 1.
pub(crate) fn bucket(service_id: i64, start_time: i64, duration: i64) -> SmokepingBucket {
    SmokepingBucket {
        service_id,
        checker_id: 1,
        start_time,
        duration,
        sent: 5,
        lost: None,
        downs: None,
        med_response_time: Some(10.0),
        min_response_time: Some(5.0),
        max_response_time: Some(15.0),
    }
}
