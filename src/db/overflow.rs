//! Local overflow buffer for smokeping buckets.
//!
//! Buckets land here only when the primary store rejected them. The drain
//! task replays them later and removes each one once it is persisted.

use rusqlite::{params, Connection, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::models::SmokepingBucket;
use super::store::{bucket_from_row, lock, DbError, BUCKET_COLUMNS};

/// Durable side store with the smokeping bucket shape.
#[derive(Clone)]
pub struct OverflowBuffer {
    conn: Arc<Mutex<Connection>>,
}

impl OverflowBuffer {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(include_str!("../../migrations/000001_buffer.up.sql"))
            .map_err(|e| DbError::Migration(format!("Buffer migration failed: {}", e)))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Buffer a bucket. A second push of the same key replaces the first.
    pub fn push(&self, b: &SmokepingBucket) -> Result<(), DbError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO services_smokeping ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                BUCKET_COLUMNS
            ),
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
        )?;
        Ok(())
    }

    pub fn all(&self) -> Result<Vec<SmokepingBucket>, DbError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM services_smokeping ORDER BY start_time ASC",
            BUCKET_COLUMNS
        ))?;
        let buckets = stmt
            .query_map([], bucket_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(buckets)
    }

    /// Remove a bucket by key.
    pub fn remove(&self, b: &SmokepingBucket) -> Result<(), DbError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "DELETE FROM services_smokeping
             WHERE service_id = ?1 AND checker_id = ?2 AND start_time = ?3 AND duration = ?4",
            params![b.service_id, b.checker_id, b.start_time, b.duration],
        )?;
        Ok(())
    }

    pub fn len(&self) -> Result<usize, DbError> {
        let conn = lock(&self.conn)?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM services_smokeping", [], |r| r.get(0))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::bucket;
    use tempfile::NamedTempFile;

    #[test]
    fn test_push_all_remove() {
        let tmp = NamedTempFile::new().unwrap();
        let buffer = OverflowBuffer::new(tmp.path()).unwrap();

        let a = bucket(1, 10, 1);
        let b = bucket(2, 10, 1);
        buffer.push(&a).unwrap();
        buffer.push(&b).unwrap();
        buffer.push(&a).unwrap();
        assert_eq!(buffer.len().unwrap(), 2);

        buffer.remove(&a).unwrap();
        assert_eq!(buffer.all().unwrap(), vec![b]);
    }

    #[test]
    fn test_buffer_survives_reopen() {
        let tmp = NamedTempFile::new().unwrap();
        OverflowBuffer::new(tmp.path()).unwrap().push(&bucket(1, 10, 1)).unwrap();

        let reopened = OverflowBuffer::new(tmp.path()).unwrap();
        assert_eq!(reopened.all().unwrap(), vec![bucket(1, 10, 1)]);
    }
}
