//! Application registry.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::Database;

/// A registered application with its cumulative traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRecord {
    pub app_id: i64,
    pub path: String,
    /// Unix time the path was first observed.
    pub first_seen: i64,
    /// Hour bucket of the most recent traffic, 0 if none.
    pub last_traffic: i64,
    pub in_bytes: u64,
    pub out_bytes: u64,
}

impl Database {
    pub fn app_id_by_path(&self, path: &str) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached("SELECT app_id FROM app WHERE path = ?1")?;
        Ok(stmt.query_row(params![path], |row| row.get(0)).optional()?)
    }

    /// Registers `path`; the id is never reused, even after deletion.
    pub fn insert_app(&self, path: &str, unix_time: i64) -> Result<i64> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached("INSERT INTO app (path, creat_time) VALUES (?1, ?2)")?;
        stmt.execute(params![path, unix_time])?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_apps(&self) -> Result<Vec<AppRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT app_id, path, creat_time, traf_time, in_bytes, out_bytes
             FROM app ORDER BY app_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(AppRecord {
                app_id: row.get(0)?,
                path: row.get(1)?,
                first_seen: row.get(2)?,
                last_traffic: row.get(3)?,
                in_bytes: row.get(4)?,
                out_bytes: row.get(5)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Deletes an app and all of its buckets. Global rows keep its traffic.
    pub fn delete_app(&self, app_id: i64) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for table in ["traffic_app_hour", "traffic_app_day", "traffic_app_month"] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE app_id = ?1"),
                params![app_id],
            )?;
        }
        let deleted = tx.execute("DELETE FROM app WHERE app_id = ?1", params![app_id])?;
        tx.commit()?;
        Ok(deleted > 0)
    }
}
