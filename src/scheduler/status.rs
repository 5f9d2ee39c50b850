//! Online/offline state machine.

use crate::db::{DbError, Service, StatusEvent, StatusSample, Store};

use super::CheckResult;

/// Record one observation of `service` for `minute`.
///
/// An event is appended only when the observed state differs from the last
/// recorded one; a service with no history counts as offline. Enabled
/// services also get a per-minute sample. Returns the previous state.
///
/// Fails only when the previous state cannot be read, in which case nothing
/// is written.
pub fn apply(
    store: &Store,
    checker_id: i64,
    service: &Service,
    result: &CheckResult,
    minute: i64,
) -> Result<bool, DbError> {
    let was_online = store
        .last_event(service.id, checker_id)?
        .map(|event| event.online)
        .unwrap_or(false);

    if was_online != result.online {
        let event = StatusEvent { service_id: service.id, checker_id, minute, online: result.online };
        if let Err(e) = store.add_event(&event) {
            tracing::error!("Scheduler: Failed to record event for {}: {}", service.name, e);
        }
    }

    if !service.disabled {
        let sample = StatusSample {
            service_id: service.id,
            checker_id,
            minute,
            online: result.online,
            response_time: if result.online { result.response_time } else { None },
        };
        if let Err(e) = store.add_status(&sample) {
            tracing::error!("Scheduler: Failed to record status for {}: {}", service.name, e);
        }
    }

    Ok(was_online)
}
