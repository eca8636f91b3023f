//! SQL-backed storages.

// SQLite stores counts and sizes as i64; they are never negative here.
#![allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]

use super::{DbClient, StorageError};
use crate::models::{Event, Impression, Segment, Split};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Highest latency bucket index.
pub const MAX_LATENCY_BUCKET: usize = 21;

/// Called when a queue grows past its configured size.
pub type TableFullHook = Arc<dyn Fn() + Send + Sync>;

const CHANGE_NUMBER: &str = "change_number";

/// Split definitions keyed by name.
#[derive(Debug, Clone)]
pub struct SqlSplitStorage {
    db: DbClient,
}

impl SqlSplitStorage {
    pub fn new(db: DbClient) -> Self {
        Self { db }
    }

    /// Retrieve a split.
    pub fn get(&self, split_name: &str) -> Result<Option<Split>, StorageError> {
        self.db.with_conn(|conn| get_split(conn, split_name))
    }

    /// Retrieve several splits; names without a definition map to `None`.
    pub fn fetch_many(
        &self,
        split_names: &[&str],
    ) -> Result<HashMap<String, Option<Split>>, StorageError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT json_data FROM split_splits WHERE name = ?1")?;
            let mut found = HashMap::with_capacity(split_names.len());
            for name in split_names {
                let json: Option<String> = stmt
                    .query_row(params![name], |row| row.get(0))
                    .optional()?;
                let split = json.map(|j| serde_json::from_str(&j)).transpose()?;
                found.insert((*name).to_string(), split);
            }
            Ok(found)
        })
    }

    /// Store a split, replacing any existing definition with the same name.
    pub fn put(&self, split: &Split) -> Result<(), StorageError> {
        self.db.with_conn(|conn| put_split(conn, split))
    }

    /// Remove a split. Returns whether it existed.
    pub fn remove(&self, split_name: &str) -> Result<bool, StorageError> {
        self.db.with_conn(|conn| remove_split(conn, split_name))
    }

    /// Store `to_add`, remove `to_remove` and record `change_number`, all or
    /// nothing. Returns how many of `to_remove` existed.
    pub fn update(
        &self,
        to_add: &[Split],
        to_remove: &[&str],
        change_number: i64,
    ) -> Result<usize, StorageError> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            for split in to_add {
                put_split(&tx, split)?;
            }
            let mut removed = 0;
            for name in to_remove {
                if remove_split(&tx, name)? {
                    removed += 1;
                }
            }
            write_change_number(&tx, change_number)?;
            tx.commit()?;
            Ok(removed)
        })
    }

    /// Change number of the stored definitions, `-1` if none was recorded.
    pub fn get_change_number(&self) -> Result<i64, StorageError> {
        self.db.with_conn(|conn| read_change_number(conn))
    }

    pub fn set_change_number(&self, change_number: i64) -> Result<(), StorageError> {
        self.db
            .with_conn(|conn| write_change_number(conn, change_number))
    }

    pub fn get_split_names(&self) -> Result<Vec<String>, StorageError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM split_splits ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(names)
        })
    }

    pub fn get_all_splits(&self) -> Result<Vec<Split>, StorageError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT json_data FROM split_splits ORDER BY name")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            rows.iter()
                .map(|json| serde_json::from_str(json).map_err(StorageError::from))
                .collect()
        })
    }

    /// Whether any definitions have been written to the store.
    pub fn has_definitions(&self) -> Result<bool, StorageError> {
        self.db.with_conn(|conn| {
            if read_change_number(conn)? >= 0 {
                return Ok(true);
            }
            let any: Option<i64> = conn
                .query_row("SELECT 1 FROM split_splits LIMIT 1", [], |row| row.get(0))
                .optional()?;
            Ok(any.is_some())
        })
    }

    /// Whether at least one split uses the traffic type.
    pub fn is_valid_traffic_type(&self, traffic_type_name: &str) -> Result<bool, StorageError> {
        self.db.with_conn(|conn| {
            let any: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM split_splits WHERE traffic_type_name = ?1 LIMIT 1",
                    params![traffic_type_name],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(any.is_some())
        })
    }

    /// All segments referenced by stored splits.
    pub fn get_segment_names(&self) -> Result<BTreeSet<String>, StorageError> {
        Ok(self
            .get_all_splits()?
            .iter()
            .flat_map(Split::segment_names)
            .collect())
    }

    /// Kill a split locally unless the store already holds a newer change.
    pub fn kill_locally(
        &self,
        split_name: &str,
        default_treatment: &str,
        change_number: i64,
    ) -> Result<(), StorageError> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            if read_change_number(&tx)? > change_number {
                return Ok(());
            }
            if let Some(mut split) = get_split(&tx, split_name)? {
                split.local_kill(default_treatment, change_number);
                put_split(&tx, &split)?;
            }
            tx.commit()?;
            Ok(())
        })
    }
}

fn get_split(conn: &Connection, split_name: &str) -> Result<Option<Split>, StorageError> {
    let json: Option<String> = conn
        .query_row(
            "SELECT json_data FROM split_splits WHERE name = ?1",
            params![split_name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(json.map(|j| serde_json::from_str(&j)).transpose()?)
}

fn put_split(conn: &Connection, split: &Split) -> Result<(), StorageError> {
    let json = serde_json::to_string(split)?;
    conn.execute(
        "INSERT INTO split_splits (name, traffic_type_name, json_data) VALUES (?1, ?2, ?3)
         ON CONFLICT (name) DO UPDATE SET
             traffic_type_name = excluded.traffic_type_name,
             json_data = excluded.json_data",
        params![split.name, split.traffic_type_name, json],
    )?;
    Ok(())
}

fn remove_split(conn: &Connection, split_name: &str) -> Result<bool, StorageError> {
    let removed = conn.execute(
        "DELETE FROM split_splits WHERE name = ?1",
        params![split_name],
    )?;
    Ok(removed > 0)
}

fn write_change_number(conn: &Connection, change_number: i64) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO split_metadata (name, number) VALUES (?1, ?2)
         ON CONFLICT (name) DO UPDATE SET number = excluded.number",
        params![CHANGE_NUMBER, change_number],
    )?;
    Ok(())
}

fn read_change_number(conn: &Connection) -> Result<i64, StorageError> {
    let number: Option<i64> = conn
        .query_row(
            "SELECT number FROM split_metadata WHERE name = ?1",
            params![CHANGE_NUMBER],
            |row| row.get(0),
        )
        .optional()?;
    Ok(number.unwrap_or(-1))
}

/// Full segment definitions.
#[derive(Debug, Clone)]
pub struct SqlSegmentStorage {
    db: DbClient,
}

impl SqlSegmentStorage {
    pub fn new(db: DbClient) -> Self {
        Self { db }
    }

    pub fn get(&self, segment_name: &str) -> Result<Option<Segment>, StorageError> {
        self.db.with_conn(|conn| {
            let row: Option<(i64, i64)> = conn
                .query_row(
                    "SELECT id, change_number FROM split_segments WHERE name = ?1",
                    params![segment_name],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((id, change_number)) = row else {
                return Ok(None);
            };

            let mut stmt =
                conn.prepare("SELECT name FROM split_segment_keys WHERE segment_id = ?1")?;
            let keys = stmt
                .query_map(params![id], |row| row.get(0))?
                .collect::<Result<BTreeSet<String>, _>>()?;
            Ok(Some(Segment {
                name: segment_name.to_string(),
                keys,
                change_number,
            }))
        })
    }

    /// Store a segment, replacing its key set.
    pub fn put(&self, segment: &Segment) -> Result<(), StorageError> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let id = upsert_segment(&tx, &segment.name, Some(segment.change_number))?;
            tx.execute(
                "DELETE FROM split_segment_keys WHERE segment_id = ?1",
                params![id],
            )?;
            insert_segment_keys(&tx, id, segment.keys.iter())?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Apply a delta to a segment, creating it if it doesn't exist.
    pub fn update(
        &self,
        segment_name: &str,
        to_add: &[String],
        to_remove: &[String],
        change_number: Option<i64>,
    ) -> Result<(), StorageError> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let id = upsert_segment(&tx, segment_name, change_number)?;
            {
                let mut remove = tx.prepare(
                    "DELETE FROM split_segment_keys WHERE segment_id = ?1 AND name = ?2",
                )?;
                for key in to_remove {
                    remove.execute(params![id, key])?;
                }
            }
            insert_segment_keys(&tx, id, to_add.iter())?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_change_number(&self, segment_name: &str) -> Result<Option<i64>, StorageError> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT change_number FROM split_segments WHERE name = ?1",
                    params![segment_name],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    /// Set a segment's change number. Unknown segments are left alone.
    pub fn set_change_number(
        &self,
        segment_name: &str,
        change_number: i64,
    ) -> Result<(), StorageError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE split_segments SET change_number = ?2 WHERE name = ?1",
                params![segment_name, change_number],
            )?;
            Ok(())
        })
    }

    pub fn segment_contains(&self, segment_name: &str, key: &str) -> Result<bool, StorageError> {
        self.db.with_conn(|conn| {
            let any: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM split_segment_keys k
                     JOIN split_segments s ON s.id = k.segment_id
                     WHERE s.name = ?1 AND k.name = ?2",
                    params![segment_name, key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(any.is_some())
        })
    }
}

fn upsert_segment(
    conn: &Connection,
    segment_name: &str,
    change_number: Option<i64>,
) -> Result<i64, StorageError> {
    conn.execute(
        "INSERT INTO split_segments (name, change_number) VALUES (?1, COALESCE(?2, -1))
         ON CONFLICT (name) DO UPDATE SET
             change_number = COALESCE(?2, split_segments.change_number)",
        params![segment_name, change_number],
    )?;
    Ok(conn.query_row(
        "SELECT id FROM split_segments WHERE name = ?1",
        params![segment_name],
        |row| row.get(0),
    )?)
}

fn insert_segment_keys<'a>(
    conn: &Connection,
    segment_id: i64,
    keys: impl Iterator<Item = &'a String>,
) -> Result<(), StorageError> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO split_segment_keys (segment_id, name) VALUES (?1, ?2)",
    )?;
    for key in keys {
        stmt.execute(params![segment_id, key])?;
    }
    Ok(())
}

/// Segment membership per traffic key.
#[derive(Debug, Clone)]
pub struct SqlMySegmentsStorage {
    db: DbClient,
}

impl SqlMySegmentsStorage {
    pub fn new(db: DbClient) -> Self {
        Self { db }
    }

    /// Segments the key belongs to.
    pub fn get(&self, traffic_key: &str) -> Result<Vec<String>, StorageError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT segment_name FROM split_my_segments WHERE traffic_key = ?1
                 ORDER BY segment_name",
            )?;
            let names = stmt
                .query_map(params![traffic_key], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(names)
        })
    }

    /// Replace the key's segment list.
    pub fn put(&self, traffic_key: &str, segment_names: &[String]) -> Result<(), StorageError> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM split_my_segments WHERE traffic_key = ?1",
                params![traffic_key],
            )?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO split_my_segments (traffic_key, segment_name) VALUES (?1, ?2)",
                )?;
                for name in segment_names {
                    stmt.execute(params![traffic_key, name])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn segment_contains(&self, segment_name: &str, key: &str) -> Result<bool, StorageError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM split_my_segments WHERE traffic_key = ?1 AND segment_name = ?2",
                params![key, segment_name],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM split_my_segments", [])?;
            Ok(())
        })
    }
}

/// Queue of impressions waiting to be flushed.
#[derive(Clone)]
pub struct SqlImpressionStorage {
    db: DbClient,
    queue_size: usize,
    table_full_hook: Option<TableFullHook>,
}

impl SqlImpressionStorage {
    pub fn new(db: DbClient, queue_size: usize) -> Self {
        Self {
            db,
            queue_size,
            table_full_hook: None,
        }
    }

    /// Set a hook to be called when the queue is full.
    pub fn with_table_full_hook(mut self, hook: TableFullHook) -> Self {
        self.table_full_hook = Some(hook);
        self
    }

    /// Queue impressions.
    pub fn put(&self, impressions: &[Impression]) -> Result<(), StorageError> {
        let now = Utc::now().timestamp_millis();
        let queued = self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO split_impressions (created_at, json_data) VALUES (?1, ?2)",
                )?;
                for impression in impressions {
                    stmt.execute(params![now, serde_json::to_string(impression)?])?;
                }
            }
            let count: i64 =
                tx.query_row("SELECT COUNT(*) FROM split_impressions", [], |row| row.get(0))?;
            tx.commit()?;
            Ok(count as usize)
        })?;

        if queued > self.queue_size {
            if let Some(hook) = &self.table_full_hook {
                hook();
            }
        }
        Ok(())
    }

    /// Pop the oldest `count` impressions.
    pub fn pop_many(&self, count: usize) -> Result<Vec<Impression>, StorageError> {
        self.db.with_conn(|conn| pop_rows(conn, "split_impressions", count))
    }

    pub fn count(&self) -> Result<usize, StorageError> {
        self.db.with_conn(|conn| count_rows(conn, "split_impressions"))
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM split_impressions", [])?;
            Ok(())
        })
    }
}

/// Queue of tracked events waiting to be flushed.
#[derive(Clone)]
pub struct SqlEventStorage {
    db: DbClient,
    queue_size: usize,
    table_full_hook: Option<TableFullHook>,
}

impl SqlEventStorage {
    /// Queued bytes that force a flush regardless of count.
    pub const MAX_SIZE_BYTES: usize = 5 * 1024 * 1024;

    pub fn new(db: DbClient, queue_size: usize) -> Self {
        Self {
            db,
            queue_size,
            table_full_hook: None,
        }
    }

    /// Set a hook to be called when the queue is full.
    pub fn with_table_full_hook(mut self, hook: TableFullHook) -> Self {
        self.table_full_hook = Some(hook);
        self
    }

    /// Queue events.
    pub fn put(&self, events: &[Event]) -> Result<(), StorageError> {
        let now = Utc::now().timestamp_millis();
        let (count, bytes) = self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO split_events (created_at, json_data, size) VALUES (?1, ?2, ?3)",
                )?;
                for event in events {
                    stmt.execute(params![
                        now,
                        serde_json::to_string(event)?,
                        event.size() as i64
                    ])?;
                }
            }
            let totals: (i64, i64) = tx.query_row(
                "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM split_events",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            tx.commit()?;
            Ok((totals.0 as usize, totals.1 as usize))
        })?;

        if count > self.queue_size || bytes >= Self::MAX_SIZE_BYTES {
            if let Some(hook) = &self.table_full_hook {
                hook();
            }
        }
        Ok(())
    }

    /// Pop the oldest `count` events.
    pub fn pop_many(&self, count: usize) -> Result<Vec<Event>, StorageError> {
        self.db.with_conn(|conn| pop_rows(conn, "split_events", count))
    }

    pub fn count(&self) -> Result<usize, StorageError> {
        self.db.with_conn(|conn| count_rows(conn, "split_events"))
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM split_events", [])?;
            Ok(())
        })
    }
}

/// Select, decode and delete the oldest rows of a queue table in one
/// transaction. Rows that no longer decode are deleted and skipped.
fn pop_rows<T: DeserializeOwned>(
    conn: &mut Connection,
    table: &str,
    count: usize,
) -> Result<Vec<T>, StorageError> {
    let tx = conn.transaction()?;
    let rows: Vec<(i64, String)> = {
        let mut stmt = tx.prepare(&format!(
            "SELECT id, json_data FROM {table} ORDER BY created_at, id LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![count as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    {
        let mut delete = tx.prepare(&format!("DELETE FROM {table} WHERE id = ?1"))?;
        for (id, _) in &rows {
            delete.execute(params![id])?;
        }
    }
    let decoded = rows
        .into_iter()
        .filter_map(|(id, json)| match serde_json::from_str(&json) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(table, id, error = %e, "discarding undecodable queued record");
                None
            }
        })
        .collect();
    tx.commit()?;
    Ok(decoded)
}

fn count_rows(conn: &Connection, table: &str) -> Result<usize, StorageError> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })?;
    Ok(count as usize)
}

/// Latencies, counters and gauges.
#[derive(Debug, Clone)]
pub struct SqlTelemetryStorage {
    db: DbClient,
}

impl SqlTelemetryStorage {
    pub fn new(db: DbClient) -> Self {
        Self { db }
    }

    /// Count one sample in a latency bucket. Out-of-range buckets are ignored.
    pub fn inc_latency(&self, name: &str, bucket: usize) -> Result<(), StorageError> {
        if bucket > MAX_LATENCY_BUCKET {
            return Ok(());
        }
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO split_latencies (name, bucket, count) VALUES (?1, ?2, 1)
                 ON CONFLICT (name, bucket) DO UPDATE SET count = count + 1",
                params![name, bucket as i64],
            )?;
            Ok(())
        })
    }

    pub fn inc_counter(&self, name: &str) -> Result<(), StorageError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO split_counters (name, value) VALUES (?1, 1)
                 ON CONFLICT (name) DO UPDATE SET value = value + 1",
                params![name],
            )?;
            Ok(())
        })
    }

    pub fn put_gauge(&self, name: &str, value: i64) -> Result<(), StorageError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO split_gauges (name, value) VALUES (?1, ?2)
                 ON CONFLICT (name) DO UPDATE SET value = excluded.value",
                params![name, value],
            )?;
            Ok(())
        })
    }

    /// Take and reset all counters.
    pub fn pop_counters(&self) -> Result<HashMap<String, i64>, StorageError> {
        self.pop_named_values("split_counters")
    }

    /// Take and reset all gauges.
    pub fn pop_gauges(&self) -> Result<HashMap<String, i64>, StorageError> {
        self.pop_named_values("split_gauges")
    }

    /// Take and reset all latencies, as one count per bucket.
    pub fn pop_latencies(&self) -> Result<HashMap<String, Vec<u64>>, StorageError> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let rows: Vec<(String, i64, i64)> = {
                let mut stmt = tx.prepare("SELECT name, bucket, count FROM split_latencies")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };
            tx.execute("DELETE FROM split_latencies", [])?;
            tx.commit()?;

            let mut latencies: HashMap<String, Vec<u64>> = HashMap::new();
            for (name, bucket, count) in rows {
                let buckets = latencies
                    .entry(name)
                    .or_insert_with(|| vec![0; MAX_LATENCY_BUCKET + 1]);
                if let Some(slot) = buckets.get_mut(bucket as usize) {
                    *slot = count as u64;
                }
            }
            Ok(latencies)
        })
    }

    fn pop_named_values(&self, table: &str) -> Result<HashMap<String, i64>, StorageError> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let values = {
                let mut stmt = tx.prepare(&format!("SELECT name, value FROM {table}"))?;
                let values = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<HashMap<String, i64>, _>>()?;
                values
            };
            tx.execute(&format!("DELETE FROM {table}"), [])?;
            tx.commit()?;
            Ok(values)
        })
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        self.db.with_conn(|conn| {
            conn.execute_batch(
                "DELETE FROM split_latencies; DELETE FROM split_counters; DELETE FROM split_gauges;",
            )?;
            Ok(())
        })
    }
}
