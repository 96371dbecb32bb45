//! Traffic bucket upserts, queries and retention.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::Database;
use crate::core::period::Resolution;

/// Owner id of the global rows.
pub const GLOBAL_OWNER: i64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficBucket {
    /// App id, or 0 for the global rows.
    pub owner_id: i64,
    pub resolution: Resolution,
    pub bucket_time: i64,
    pub in_bytes: u64,
    pub out_bytes: u64,
}

/// Bytes to add to one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketDelta {
    pub owner_id: i64,
    pub resolution: Resolution,
    pub bucket_time: i64,
    pub in_bytes: u64,
    pub out_bytes: u64,
}

/// Bytes to add to an app's cumulative total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppTotalDelta {
    pub app_id: i64,
    pub hour: i64,
    pub in_bytes: u64,
    pub out_bytes: u64,
}

fn upsert_sql(owner_id: i64, resolution: Resolution) -> String {
    if owner_id == GLOBAL_OWNER {
        format!(
            "INSERT INTO {} (traf_time, in_bytes, out_bytes) VALUES (?1, ?2, ?3)
             ON CONFLICT(traf_time) DO UPDATE SET
                in_bytes = in_bytes + excluded.in_bytes,
                out_bytes = out_bytes + excluded.out_bytes",
            resolution.total_table()
        )
    } else {
        format!(
            "INSERT INTO {} (app_id, traf_time, in_bytes, out_bytes) VALUES (?4, ?1, ?2, ?3)
             ON CONFLICT(app_id, traf_time) DO UPDATE SET
                in_bytes = in_bytes + excluded.in_bytes,
                out_bytes = out_bytes + excluded.out_bytes",
            resolution.app_table()
        )
    }
}

impl Database {
    /// Adds every delta in one transaction; nothing is applied on failure.
    pub fn add_traffic(&self, buckets: &[BucketDelta], totals: &[AppTotalDelta]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for d in buckets {
            let mut stmt = tx.prepare_cached(&upsert_sql(d.owner_id, d.resolution))?;
            if d.owner_id == GLOBAL_OWNER {
                stmt.execute(params![d.bucket_time, d.in_bytes, d.out_bytes])?;
            } else {
                stmt.execute(params![d.bucket_time, d.in_bytes, d.out_bytes, d.owner_id])?;
            }
        }
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE app SET
                    in_bytes = in_bytes + ?2,
                    out_bytes = out_bytes + ?3,
                    traf_time = MAX(traf_time, ?4)
                 WHERE app_id = ?1",
            )?;
            for t in totals {
                stmt.execute(params![t.app_id, t.in_bytes, t.out_bytes, t.hour])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn bucket(
        &self,
        owner_id: i64,
        resolution: Resolution,
        bucket_time: i64,
    ) -> Result<Option<TrafficBucket>> {
        Ok(self
            .query_buckets(owner_id, resolution, bucket_time, bucket_time)?
            .into_iter()
            .next())
    }

    /// Buckets of `owner_id` with `from <= bucket_time <= to`, oldest first.
    pub fn query_buckets(
        &self,
        owner_id: i64,
        resolution: Resolution,
        from: i64,
        to: i64,
    ) -> Result<Vec<TrafficBucket>> {
        let conn = self.conn()?;
        let mut rows = Vec::new();
        if owner_id == GLOBAL_OWNER {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT traf_time, in_bytes, out_bytes FROM {}
                 WHERE traf_time >= ?1 AND traf_time <= ?2 ORDER BY traf_time",
                resolution.total_table()
            ))?;
            for row in stmt.query_map(params![from, to], map_bucket_row)? {
                rows.push(row?);
            }
        } else {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT traf_time, in_bytes, out_bytes FROM {}
                 WHERE app_id = ?3 AND traf_time >= ?1 AND traf_time <= ?2 ORDER BY traf_time",
                resolution.app_table()
            ))?;
            for row in stmt.query_map(params![from, to, owner_id], map_bucket_row)? {
                rows.push(row?);
            }
        }

        let results = rows
            .into_iter()
            .map(|(bucket_time, in_bytes, out_bytes)| TrafficBucket {
                owner_id,
                resolution,
                bucket_time,
                in_bytes,
                out_bytes,
            })
            .collect();
        Ok(results)
    }

    /// Deletes app and global buckets of `resolution` older than `before`.
    pub fn prune_buckets(&self, resolution: Resolution, before: i64) -> Result<usize> {
        let conn = self.conn()?;
        let mut deleted = 0;
        for table in [resolution.app_table(), resolution.total_table()] {
            deleted += conn.execute(
                &format!("DELETE FROM {table} WHERE traf_time < ?1"),
                params![before],
            )?;
        }
        Ok(deleted)
    }

    /// Drops every bucket and zeroes the per-app totals; the registry stays.
    pub fn clear_traffic(&self) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for resolution in Resolution::ALL {
            tx.execute(&format!("DELETE FROM {}", resolution.app_table()), [])?;
            tx.execute(&format!("DELETE FROM {}", resolution.total_table()), [])?;
        }
        tx.execute(
            "UPDATE app SET traf_time = 0, in_bytes = 0, out_bytes = 0",
            [],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn app_totals(&self, app_id: i64) -> Result<Option<(u64, u64)>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare_cached("SELECT in_bytes, out_bytes FROM app WHERE app_id = ?1")?;
        Ok(stmt
            .query_row(params![app_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?)
    }
}

fn map_bucket_row(row: &rusqlite::Row) -> rusqlite::Result<(i64, u64, u64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}
