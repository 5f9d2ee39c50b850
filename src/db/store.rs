//! SQLite database store implementation.

use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("connection lock poisoned")]
    Poisoned,
}

/// Destination for finished smokeping buckets.
///
/// Writes must be conflict tolerant: a bucket whose key already exists is
/// left untouched.
pub trait BucketSink: Send + Sync {
    fn upsert_buckets(&self, buckets: &[SmokepingBucket]) -> Result<(), DbError>;
}

pub(crate) const BUCKET_COLUMNS: &str = "service_id, checker_id, start_time, duration, sent, lost, downs, \
     med_response_time, min_response_time, max_response_time";

pub(crate) const INSERT_BUCKET_SQL: &str = "INSERT INTO services_smokeping (service_id, checker_id, start_time, duration, sent, lost, downs, \
     med_response_time, min_response_time, max_response_time) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
     ON CONFLICT(service_id, checker_id, start_time, duration) DO NOTHING";

pub(crate) fn bucket_from_row(row: &Row<'_>) -> SqlResult<SmokepingBucket> {
    Ok(SmokepingBucket {
        service_id: row.get(0)?,
        checker_id: row.get(1)?,
        start_time: row.get(2)?,
        duration: row.get(3)?,
        sent: row.get(4)?,
        lost: row.get(5)?,
        downs: row.get(6)?,
        med_response_time: row.get(7)?,
        min_response_time: row.get(8)?,
        max_response_time: row.get(9)?,
    })
}

pub(crate) fn insert_bucket(conn: &Connection, b: &SmokepingBucket) -> SqlResult<usize> {
    conn.execute(
        INSERT_BUCKET_SQL,
        params![
            b.service_id,
            b.checker_id,
            b.start_time,
            b.duration,
            b.sent,
            b.lost,
            b.downs,
            b.med_response_time,
            b.min_response_time,
            b.max_response_time,
        ],
    )
}

pub(crate) fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, DbError> {
    conn.lock().map_err(|_| DbError::Poisoned)
}

/// Thread-safe primary store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the store at the given path and run migrations.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), DbError> {
        let conn = lock(&self.conn)?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    // --- Checkers & services ---

    /// Look up a checker by ID.
    pub fn get_checker(&self, id: i64) -> Result<Checker, DbError> {
        let conn = lock(&self.conn)?;
        conn.query_row(
            "SELECT checker_id, name, location, check_second FROM checkers WHERE checker_id = ?1",
            params![id],
            |row| {
                Ok(Checker {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    location: row.get(2)?,
                    check_second: row.get(3)?,
                })
            },
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Services monitored by a checker, through the groups it belongs to.
    pub fn get_checker_services(&self, checker_id: i64) -> Result<Vec<Service>, DbError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT s.service_id, s.name, s.type, s.host, s.protocol, s.disabled, s.alert
             FROM groups_services gs
             INNER JOIN services s ON s.service_id = gs.service_id
             WHERE gs.group_id IN (SELECT group_id FROM groups_checkers WHERE checker_id = ?1)
             ORDER BY s.service_id ASC",
        )?;

        let rows = stmt
            .query_map(params![checker_id], |row| {
                let kind: String = row.get(2)?;
                Ok((
                    kind,
                    Service {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        host: row.get(3)?,
                        protocol: row.get(4)?,
                        disabled: row.get(5)?,
                        alert: row.get(6)?,
                        ..Default::default()
                    },
                ))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        let services = rows
            .into_iter()
            .filter_map(|(kind, service)| match ServiceKind::from_db(&kind) {
                Some(kind) => Some(Service { kind, ..service }),
                None => {
                    tracing::warn!("Store: Skipping service {} with unknown type {:?}", service.id, kind);
                    None
                }
            })
            .collect();

        Ok(services)
    }

    // --- Status events ---

    /// Most recent event for a (service, checker) pair.
    pub fn last_event(&self, service_id: i64, checker_id: i64) -> Result<Option<StatusEvent>, DbError> {
        let conn = lock(&self.conn)?;
        let event = conn
            .query_row(
                "SELECT service_id, checker_id, minute, online FROM services_events
                 WHERE service_id = ?1 AND checker_id = ?2 ORDER BY minute DESC LIMIT 1",
                params![service_id, checker_id],
                |row| {
                    Ok(StatusEvent {
                        service_id: row.get(0)?,
                        checker_id: row.get(1)?,
                        minute: row.get(2)?,
                        online: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(event)
    }

    pub fn add_event(&self, event: &StatusEvent) -> Result<(), DbError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO services_events (service_id, checker_id, minute, online) VALUES (?1, ?2, ?3, ?4)",
            params![event.service_id, event.checker_id, event.minute, event.online],
        )?;
        Ok(())
    }

    // --- Status samples ---

    pub fn add_status(&self, sample: &StatusSample) -> Result<(), DbError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO services_statuses (service_id, checker_id, minute, online, response_time) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                sample.service_id,
                sample.checker_id,
                sample.minute,
                sample.online,
                sample.response_time,
            ],
        )?;
        Ok(())
    }

    /// Samples with `start <= minute < end`.
    pub fn get_statuses(
        &self,
        service_id: i64,
        checker_id: i64,
        start: i64,
        end: i64,
    ) -> Result<Vec<StatusSample>, DbError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT service_id, checker_id, minute, online, response_time FROM services_statuses
             WHERE service_id = ?1 AND checker_id = ?2 AND minute >= ?3 AND minute < ?4
             ORDER BY minute ASC",
        )?;
        let samples = stmt
            .query_map(params![service_id, checker_id, start, end], |row| {
                Ok(StatusSample {
                    service_id: row.get(0)?,
                    checker_id: row.get(1)?,
                    minute: row.get(2)?,
                    online: row.get(3)?,
                    response_time: row.get(4)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(samples)
    }

    /// Delete samples strictly before a minute.
    pub fn delete_statuses_before(&self, service_id: i64, checker_id: i64, minute: i64) -> Result<usize, DbError> {
        let conn = lock(&self.conn)?;
        let deleted = conn.execute(
            "DELETE FROM services_statuses WHERE service_id = ?1 AND checker_id = ?2 AND minute < ?3",
            params![service_id, checker_id, minute],
        )?;
        Ok(deleted)
    }

    // --- Daily statuses ---

    pub fn daily_status_exists(&self, service_id: i64, checker_id: i64, day: i64) -> Result<bool, DbError> {
        let conn = lock(&self.conn)?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM services_daily_statuses WHERE service_id = ?1 AND checker_id = ?2 AND day = ?3)",
            params![service_id, checker_id, day],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn add_daily_status(&self, daily: &DailyStatus) -> Result<(), DbError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO services_daily_statuses (service_id, checker_id, day, statuses_amount, uptime, response_time) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                daily.service_id,
                daily.checker_id,
                daily.day,
                daily.statuses_amount,
                daily.uptime,
                daily.response_time,
            ],
        )?;
        Ok(())
    }

    // --- Smokeping buckets ---

    /// Buckets of one tier whose window starts before `cutoff`.
    pub fn get_buckets_before(&self, checker_id: i64, duration: i64, cutoff: i64) -> Result<Vec<SmokepingBucket>, DbError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM services_smokeping
             WHERE checker_id = ?1 AND duration = ?2 AND start_time < ?3
             ORDER BY service_id ASC, start_time ASC",
            BUCKET_COLUMNS
        ))?;
        let buckets = stmt
            .query_map(params![checker_id, duration, cutoff], bucket_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(buckets)
    }

    /// Insert coarser buckets and delete the finer rows they were folded from,
    /// in one transaction. Existing coarser buckets are kept as they are.
    pub fn promote_buckets(&self, coarse: &[SmokepingBucket], folded: &[SmokepingBucket]) -> Result<usize, DbError> {
        let conn = lock(&self.conn)?;
        let tx = conn.unchecked_transaction()?;

        for b in coarse {
            insert_bucket(&tx, b)?;
        }

        let mut deleted = 0;
        {
            let mut stmt = tx.prepare(
                "DELETE FROM services_smokeping
                 WHERE service_id = ?1 AND checker_id = ?2 AND start_time = ?3 AND duration = ?4",
            )?;
            for b in folded {
                deleted += stmt.execute(params![b.service_id, b.checker_id, b.start_time, b.duration])?;
            }
        }

        tx.commit()?;
        Ok(deleted)
    }

    /// Delete buckets of one tier whose window starts before `cutoff`.
    pub fn delete_buckets_before(&self, checker_id: i64, duration: i64, cutoff: i64) -> Result<usize, DbError> {
        let conn = lock(&self.conn)?;
        let deleted = conn.execute(
            "DELETE FROM services_smokeping WHERE checker_id = ?1 AND duration = ?2 AND start_time < ?3",
            params![checker_id, duration, cutoff],
        )?;
        Ok(deleted)
    }

    // --- Maintenance ---

    /// Delete history rows that belong to services which no longer exist.
    pub fn purge_orphans(&self) -> Result<usize, DbError> {
        let conn = lock(&self.conn)?;
        let tx = conn.unchecked_transaction()?;
        let mut deleted = 0;
        for table in [
            "services_events",
            "services_statuses",
            "services_daily_statuses",
            "services_smokeping",
            "groups_services",
        ] {
            deleted += tx.execute(
                &format!(
                    "DELETE FROM {} WHERE service_id NOT IN (SELECT service_id FROM services)",
                    table
                ),
                [],
            )?;
        }
        tx.commit()?;
        Ok(deleted)
    }
}

/// Writers and readers used by the test fixtures only.
#[cfg(test)]
impl Store {
    /// Drop a table so that every later query against it fails.
    pub fn drop_table(&self, table: &str) -> Result<(), DbError> {
        let conn = lock(&self.conn)?;
        conn.execute_batch(&format!("DROP TABLE {}", table))?;
        Ok(())
    }

    pub fn add_checker(&self, checker: &Checker) -> Result<(), DbError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO checkers (checker_id, name, location, check_second) VALUES (?1, ?2, ?3, ?4)",
            params![checker.id, checker.name, checker.location, checker.check_second],
        )?;
        Ok(())
    }

    /// Add a new service and return its ID.
    pub fn add_service(&self, service: &mut Service) -> Result<i64, DbError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO services (name, type, host, protocol, disabled, alert) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                service.name,
                service.kind.as_db(),
                service.host,
                service.protocol,
                service.disabled,
                service.alert,
            ],
        )?;
        let id = conn.last_insert_rowid();
        service.id = id;
        Ok(id)
    }

    pub fn delete_service(&self, id: i64) -> Result<(), DbError> {
        let conn = lock(&self.conn)?;
        conn.execute("DELETE FROM groups_services WHERE service_id = ?1", params![id])?;
        conn.execute("DELETE FROM services WHERE service_id = ?1", params![id])?;
        Ok(())
    }

    pub fn add_group_service(&self, group_id: i64, service_id: i64) -> Result<(), DbError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT OR IGNORE INTO groups_services (group_id, service_id) VALUES (?1, ?2)",
            params![group_id, service_id],
        )?;
        Ok(())
    }

    pub fn add_group_checker(&self, group_id: i64, checker_id: i64) -> Result<(), DbError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT OR IGNORE INTO groups_checkers (group_id, checker_id) VALUES (?1, ?2)",
            params![group_id, checker_id],
        )?;
        Ok(())
    }

    /// All events for a (service, checker) pair, oldest first.
    pub fn get_events(&self, service_id: i64, checker_id: i64) -> Result<Vec<StatusEvent>, DbError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT service_id, checker_id, minute, online FROM services_events
             WHERE service_id = ?1 AND checker_id = ?2 ORDER BY minute ASC",
        )?;
        let events = stmt
            .query_map(params![service_id, checker_id], |row| {
                Ok(StatusEvent {
                    service_id: row.get(0)?,
                    checker_id: row.get(1)?,
                    minute: row.get(2)?,
                    online: row.get(3)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(events)
    }

    pub fn get_daily_statuses(&self, service_id: i64, checker_id: i64) -> Result<Vec<DailyStatus>, DbError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT service_id, checker_id, day, statuses_amount, uptime, response_time FROM services_daily_statuses
             WHERE service_id = ?1 AND checker_id = ?2 ORDER BY day ASC",
        )?;
        let dailies = stmt
            .query_map(params![service_id, checker_id], |row| {
                Ok(DailyStatus {
                    service_id: row.get(0)?,
                    checker_id: row.get(1)?,
                    day: row.get(2)?,
                    statuses_amount: row.get(3)?,
                    uptime: row.get(4)?,
                    response_time: row.get(5)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(dailies)
    }

    /// Buckets of one tier for a service, oldest first.
    pub fn get_buckets(&self, service_id: i64, checker_id: i64, duration: i64) -> Result<Vec<SmokepingBucket>, DbError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM services_smokeping
             WHERE service_id = ?1 AND checker_id = ?2 AND duration = ?3
             ORDER BY start_time ASC",
            BUCKET_COLUMNS
        ))?;
        let buckets = stmt
            .query_map(params![service_id, checker_id, duration], bucket_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(buckets)
    }
}

impl BucketSink for Store {
    fn upsert_buckets(&self, buckets: &[SmokepingBucket]) -> Result<(), DbError> {
        if buckets.is_empty() {
            return Ok(());
        }

        let conn = lock(&self.conn)?;
        let tx = conn.unchecked_transaction()?;
        for b in buckets {
            insert_bucket(&tx, b)?;
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{bucket, test_store};

    #[test]
    fn test_checker_lookup() {
        let (_tmp, store) = test_store();
        let checker = store.get_checker(1).unwrap();
        assert_eq!(checker.location, "Paris");
        assert_eq!(checker.check_second, 30);
        assert!(matches!(store.get_checker(2), Err(DbError::NotFound)));
    }

    #[test]
    fn test_checker_services_through_groups() {
        let (_tmp, store) = test_store();

        let mut web = Service {
            name: "Web".to_string(),
            host: "https://example.com".to_string(),
            ..Default::default()
        };
        let mut other = Service {
            name: "Other".to_string(),
            kind: ServiceKind::RawHost,
            host: "10.0.0.1".to_string(),
            ..Default::default()
        };
        store.add_service(&mut web).unwrap();
        store.add_service(&mut other).unwrap();

        // Web is in two groups of this checker, other only in a foreign group.
        store.add_group_checker(1, 1).unwrap();
        store.add_group_checker(2, 1).unwrap();
        store.add_group_checker(3, 99).unwrap();
        store.add_group_service(1, web.id).unwrap();
        store.add_group_service(2, web.id).unwrap();
        store.add_group_service(3, other.id).unwrap();

        let services = store.get_checker_services(1).unwrap();
        assert_eq!(services, vec![web]);
    }

    #[test]
    fn test_last_event_is_most_recent() {
        let (_tmp, store) = test_store();
        assert!(store.last_event(1, 1).unwrap().is_none());

        for (minute, online) in [(10, true), (12, false), (11, true)] {
            store
                .add_event(&StatusEvent { service_id: 1, checker_id: 1, minute, online })
                .unwrap();
        }

        let last = store.last_event(1, 1).unwrap().unwrap();
        assert_eq!(last.minute, 12);
        assert!(!last.online);
    }

    #[test]
    fn test_bucket_upsert_keeps_existing_row() {
        let (_tmp, store) = test_store();
        let first = bucket(1, 100, 1);
        let mut replay = first;
        replay.med_response_time = Some(99.0);

        store.upsert_buckets(&[first]).unwrap();
        store.upsert_buckets(&[replay]).unwrap();

        let rows = store.get_buckets(1, 1, 1).unwrap();
        assert_eq!(rows, vec![first]);
    }

    #[test]
    fn test_promote_buckets_replaces_folded_rows() {
        let (_tmp, store) = test_store();
        let finer = vec![bucket(1, 0, 1), bucket(1, 1, 1), bucket(1, 2, 1), bucket(1, 3, 1)];
        store.upsert_buckets(&finer).unwrap();

        let mut coarse = bucket(1, 0, 3);
        coarse.sent = 15;
        let deleted = store.promote_buckets(&[coarse], &finer[..3]).unwrap();

        assert_eq!(deleted, 3);
        assert_eq!(store.get_buckets(1, 1, 1).unwrap(), vec![finer[3]]);
        assert_eq!(store.get_buckets(1, 1, 3).unwrap(), vec![coarse]);
    }

    #[test]
    fn test_purge_orphans() {
        let (_tmp, store) = test_store();
        let mut kept = Service { name: "Kept".to_string(), ..Default::default() };
        let mut gone = Service { name: "Gone".to_string(), ..Default::default() };
        store.add_service(&mut kept).unwrap();
        store.add_service(&mut gone).unwrap();

        for id in [kept.id, gone.id] {
            store
                .add_event(&StatusEvent { service_id: id, checker_id: 1, minute: 1, online: true })
                .unwrap();
            store.upsert_buckets(&[bucket(id, 0, 1)]).unwrap();
        }

        store.delete_service(gone.id).unwrap();
        assert_eq!(store.purge_orphans().unwrap(), 2);
        assert_eq!(store.get_events(kept.id, 1).unwrap().len(), 1);
        assert!(store.get_events(gone.id, 1).unwrap().is_empty());
        assert!(store.get_buckets(gone.id, 1, 1).unwrap().is_empty());
    }
}
