//! SQLite persistence for traffic statistics.
//!
//! Uses `rusqlite` with bundled SQLite. Handles:
//! - The application registry with cumulative per-app totals (`app`)
//! - Hour/day/month buckets per app and globally (`traffic_*`)
//! - Small engine state that must survive restarts (`meta`)
//!
//! Bucket times (`traf_time`) are local-clock hours since the epoch, aligned
//! to the table's resolution.

mod apps;
mod traffic;

pub use apps::AppRecord;
pub use traffic::{AppTotalDelta, BucketDelta, TrafficBucket, GLOBAL_OWNER};

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS app (
        app_id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT NOT NULL UNIQUE,
        creat_time INTEGER NOT NULL,
        traf_time INTEGER NOT NULL DEFAULT 0,
        in_bytes INTEGER NOT NULL DEFAULT 0,
        out_bytes INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS traffic_app_hour (
        app_id INTEGER NOT NULL,
        traf_time INTEGER NOT NULL,
        in_bytes INTEGER NOT NULL DEFAULT 0,
        out_bytes INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (app_id, traf_time)
    );
    CREATE TABLE IF NOT EXISTS traffic_app_day (
        app_id INTEGER NOT NULL,
        traf_time INTEGER NOT NULL,
        in_bytes INTEGER NOT NULL DEFAULT 0,
        out_bytes INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (app_id, traf_time)
    );
    CREATE TABLE IF NOT EXISTS traffic_app_month (
        app_id INTEGER NOT NULL,
        traf_time INTEGER NOT NULL,
        in_bytes INTEGER NOT NULL DEFAULT 0,
        out_bytes INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (app_id, traf_time)
    );
    CREATE INDEX IF NOT EXISTS idx_traffic_app_hour_time ON traffic_app_hour(traf_time);
    CREATE INDEX IF NOT EXISTS idx_traffic_app_day_time ON traffic_app_day(traf_time);
    CREATE INDEX IF NOT EXISTS idx_traffic_app_month_time ON traffic_app_month(traf_time);

    CREATE TABLE IF NOT EXISTS traffic_hour (
        traf_time INTEGER PRIMARY KEY,
        in_bytes INTEGER NOT NULL DEFAULT 0,
        out_bytes INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS traffic_day (
        traf_time INTEGER PRIMARY KEY,
        in_bytes INTEGER NOT NULL DEFAULT 0,
        out_bytes INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS traffic_month (
        traf_time INTEGER PRIMARY KEY,
        in_bytes INTEGER NOT NULL DEFAULT 0,
        out_bytes INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

/// Manages the SQLite statistics database.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        // WAL keeps readers (bucket queries) off the flush transaction's lock.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection mutex poisoned"))
    }

    pub fn meta_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached("SELECT value FROM meta WHERE key = ?1")?;
        Ok(stmt.query_row(params![key], |row| row.get(0)).optional()?)
    }

    pub fn meta_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn meta_delete(&self, key: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM meta WHERE key = ?1", params![key])?;
        Ok(())
    }
}

/// Current Unix timestamp in seconds.
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
impl Database {
    pub(crate) fn execute_batch_for_test(&self, sql: &str) -> Result<()> {
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }
}
