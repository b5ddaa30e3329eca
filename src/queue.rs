//! The durable hook delivery queue (`queue.db`).
//!
//! Every fence payload destined for a hook is enqueued here under a
//! monotonic index before delivery is attempted. The queue survives server
//! restarts, so payloads that were accepted but not yet delivered are not
//! lost with the process. Entries expire after a TTL (the hook layer uses
//! 30 seconds): an endpoint that stays down longer than that loses events
//! rather than buffering without bound.
//!
//! Backed by an embedded SQLite database: one `hook_log` table keyed by the
//! global index with a `(hook, idx)` index for per-hook range iteration,
//! plus a one-row meta table holding the index counter.

use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Db(#[from] rusqlite::Error),
}

/// One queued payload, as drained for delivery.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Global monotonic index; delivery order within a hook follows it.
    pub idx: u64,
    /// The JSON payload to deliver.
    pub value: String,
    /// Absolute expiry in unix milliseconds.
    pub expires_at: i64,
}

impl QueueEntry {
    /// Residual time to live, or `None` when already expired.
    pub fn remaining(&self) -> Option<Duration> {
        let ms = self.expires_at - Utc::now().timestamp_millis();
        if ms > 0 {
            Some(Duration::from_millis(ms as u64))
        } else {
            None
        }
    }
}

/// The hook delivery queue.
#[derive(Debug)]
pub struct HookQueue {
    conn: Mutex<Connection>,
}

impl HookQueue {
    /// Opens (or creates) the queue database at `path`.
    pub fn open(path: &Path) -> Result<HookQueue, QueueError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS hook_log (
                 idx        INTEGER PRIMARY KEY,
                 hook       TEXT NOT NULL,
                 value      TEXT NOT NULL,
                 expires_at INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS hook_log_by_hook ON hook_log (hook, idx);
             CREATE TABLE IF NOT EXISTS queue_meta (
                 key   TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );",
        )?;
        Ok(HookQueue {
            conn: Mutex::new(conn),
        })
    }

    /// An in-memory queue for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<HookQueue, QueueError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS hook_log (
                 idx        INTEGER PRIMARY KEY,
                 hook       TEXT NOT NULL,
                 value      TEXT NOT NULL,
                 expires_at INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS hook_log_by_hook ON hook_log (hook, idx);
             CREATE TABLE IF NOT EXISTS queue_meta (
                 key   TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );",
        )?;
        Ok(HookQueue {
            conn: Mutex::new(conn),
        })
    }

    /// The last assigned global index.
    pub fn last_idx(&self) -> Result<u64, QueueError> {
        let conn = self.conn.lock().unwrap();
        last_idx_inner(&conn)
    }

    /// Appends payloads for a hook, each with the given TTL. Payload order
    /// is preserved through ascending indexes.
    pub fn push(&self, hook: &str, values: &[String], ttl: Duration) -> Result<(), QueueError> {
        if values.is_empty() {
            return Ok(());
        }
        let expires_at = Utc::now().timestamp_millis() + ttl.as_millis() as i64;
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut idx = last_idx_inner(&tx)?;
        for value in values {
            idx += 1;
            tx.execute(
                "INSERT INTO hook_log (idx, hook, value, expires_at) VALUES (?1, ?2, ?3, ?4)",
                params![idx as i64, hook, value, expires_at],
            )?;
        }
        tx.execute(
            "INSERT INTO queue_meta (key, value) VALUES ('hook:idx', ?1)
             ON CONFLICT(key) DO UPDATE SET value = ?1",
            params![idx.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Removes and returns every live entry for a hook in index order.
    /// Expired entries are purged in the same transaction. The caller
    /// attempts delivery outside the transaction and `reinsert`s the
    /// undelivered tail on failure.
    pub fn drain(&self, hook: &str) -> Result<Vec<QueueEntry>, QueueError> {
        let now = Utc::now().timestamp_millis();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut entries = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT idx, value, expires_at FROM hook_log
                 WHERE hook = ?1 AND expires_at > ?2 ORDER BY idx",
            )?;
            let rows = stmt.query_map(params![hook, now], |row| {
                Ok(QueueEntry {
                    idx: row.get::<_, i64>(0)? as u64,
                    value: row.get(1)?,
                    expires_at: row.get(2)?,
                })
            })?;
            for row in rows {
                entries.push(row?);
            }
        }
        tx.execute("DELETE FROM hook_log WHERE hook = ?1", params![hook])?;
        tx.commit()?;
        Ok(entries)
    }

    /// Puts undelivered entries back, keeping their original indexes and
    /// deadlines. Entries that expired while delivery was being attempted
    /// are silently dropped.
    pub fn reinsert(&self, hook: &str, entries: &[QueueEntry]) -> Result<(), QueueError> {
        let now = Utc::now().timestamp_millis();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for entry in entries {
            if entry.expires_at <= now {
                continue;
            }
            tx.execute(
                "INSERT OR REPLACE INTO hook_log (idx, hook, value, expires_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![entry.idx as i64, hook, entry.value, entry.expires_at],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Drops every entry for a hook (hook deleted or replaced).
    pub fn purge(&self, hook: &str) -> Result<(), QueueError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM hook_log WHERE hook = ?1", params![hook])?;
        Ok(())
    }

    /// Drops expired entries across all hooks. Called by the auto-GC loop.
    pub fn purge_expired(&self) -> Result<usize, QueueError> {
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM hook_log WHERE expires_at <= ?1", params![now])?;
        Ok(n)
    }
}

fn last_idx_inner(conn: &Connection) -> Result<u64, QueueError> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM queue_meta WHERE key = 'hook:idx'",
            [],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_drain_in_order() {
        let q = HookQueue::open_in_memory().unwrap();
        q.push(
            "h",
            &["a".to_string(), "b".to_string()],
            Duration::from_secs(30),
        )
        .unwrap();
        q.push("h", &["c".to_string()], Duration::from_secs(30)).unwrap();

        let entries = q.drain("h").unwrap();
        let values: Vec<&str> = entries.iter().map(|e| e.value.as_str()).collect();
        assert_eq!(values, vec!["a", "b", "c"]);
        assert!(entries[0].idx < entries[1].idx);

        // drained means gone
        assert!(q.drain("h").unwrap().is_empty());
    }

    #[test]
    fn test_per_hook_isolation() {
        let q = HookQueue::open_in_memory().unwrap();
        q.push("h1", &["x".to_string()], Duration::from_secs(30)).unwrap();
        q.push("h2", &["y".to_string()], Duration::from_secs(30)).unwrap();

        let entries = q.drain("h1").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, "x");
        assert_eq!(q.drain("h2").unwrap().len(), 1);
    }

    #[test]
    fn test_reinsert_preserves_index() {
        let q = HookQueue::open_in_memory().unwrap();
        q.push(
            "h",
            &["a".to_string(), "b".to_string()],
            Duration::from_secs(30),
        )
        .unwrap();
        let entries = q.drain("h").unwrap();

        // pretend "a" was delivered and "b" failed
        q.reinsert("h", &entries[1..]).unwrap();
        let again = q.drain("h").unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].value, "b");
        assert_eq!(again[0].idx, entries[1].idx);
    }

    #[test]
    fn test_expired_entries_dropped() {
        let q = HookQueue::open_in_memory().unwrap();
        q.push("h", &["old".to_string()], Duration::from_millis(0)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(q.drain("h").unwrap().is_empty());
    }

    #[test]
    fn test_idx_survives_across_pushes() {
        let q = HookQueue::open_in_memory().unwrap();
        q.push("h", &["a".to_string()], Duration::from_secs(30)).unwrap();
        assert_eq!(q.last_idx().unwrap(), 1);
        q.push("h", &["b".to_string()], Duration::from_secs(30)).unwrap();
        assert_eq!(q.last_idx().unwrap(), 2);
    }

    #[test]
    fn test_purge() {
        let q = HookQueue::open_in_memory().unwrap();
        q.push("h", &["a".to_string()], Duration::from_secs(30)).unwrap();
        q.purge("h").unwrap();
        assert!(q.drain("h").unwrap().is_empty());
    }
}
