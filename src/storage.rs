use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::snapshot::CountSnapshot;
use crate::{now_s, CameraId};

/// Persisted camera registration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CameraRecord {
    pub id: CameraId,
    pub stream_url: String,
    pub branch: Option<String>,
    pub is_active: bool,
}

impl CameraRecord {
    pub fn new(id: CameraId, stream_url: &str, branch: Option<&str>) -> Self {
        Self {
            id,
            stream_url: crate::normalize_source_url(stream_url).to_string(),
            branch: branch.map(str::to_string),
            is_active: true,
        }
    }
}

/// Persistence collaborator for camera records and count snapshots.
pub trait CountStore: Send {
    /// Insert the record if no record with its id exists. Existing records are untouched.
    fn ensure_camera(&mut self, record: &CameraRecord) -> Result<()>;

    /// `None` when no record exists.
    fn camera_active(&mut self, id: &CameraId) -> Result<Option<bool>>;

    /// Returns whether a record was found and updated.
    fn set_camera_active(&mut self, id: &CameraId, active: bool) -> Result<bool>;

    fn cameras(&mut self) -> Result<Vec<CameraRecord>>;

    fn save(&mut self, snapshot: &CountSnapshot) -> Result<()>;

    /// Snapshots for `id` with `from <= timestamp < to`, oldest first.
    fn snapshots(&mut self, id: &CameraId, from: u64, to: u64) -> Result<Vec<CountSnapshot>>;
}

pub type SharedStore = Arc<Mutex<dyn CountStore>>;

pub fn shared_store<S: CountStore + 'static>(store: S) -> SharedStore {
    Arc::new(Mutex::new(store))
}

pub struct SqliteCountStore {
    conn: Connection,
}

impl SqliteCountStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS cameras (
              id TEXT PRIMARY KEY,
              stream_url TEXT NOT NULL,
              branch TEXT,
              is_active INTEGER NOT NULL DEFAULT 1,
              created_at INTEGER NOT NULL,
              updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS person_counts (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              camera_id TEXT NOT NULL REFERENCES cameras(id),
              count INTEGER NOT NULL,
              total_count INTEGER NOT NULL,
              timestamp INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_counts_camera_time ON person_counts(camera_id, timestamp);
            "#,
        )?;
        Ok(())
    }
}

fn to_i64(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("{} exceeds i64 range", what))
}

impl CountStore for SqliteCountStore {
    fn ensure_camera(&mut self, record: &CameraRecord) -> Result<()> {
        let now = to_i64(now_s()?, "timestamp")?;
        self.conn.execute(
            r#"
            INSERT OR IGNORE INTO cameras(id, stream_url, branch, is_active, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            "#,
            params![
                record.id.as_str(),
                record.stream_url,
                record.branch,
                record.is_active,
                now
            ],
        )?;
        Ok(())
    }

    fn camera_active(&mut self, id: &CameraId) -> Result<Option<bool>> {
        let active = self
            .conn
            .query_row(
                "SELECT is_active FROM cameras WHERE id = ?1",
                params![id.as_str()],
                |row| row.get::<_, bool>(0),
            )
            .optional()?;
        Ok(active)
    }

    fn set_camera_active(&mut self, id: &CameraId, active: bool) -> Result<bool> {
        let now = to_i64(now_s()?, "timestamp")?;
        let changed = self.conn.execute(
            "UPDATE cameras SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
            params![active, now, id.as_str()],
        )?;
        Ok(changed > 0)
    }

    fn cameras(&mut self) -> Result<Vec<CameraRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, stream_url, branch, is_active FROM cameras ORDER BY branch, stream_url",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            out.push(CameraRecord {
                id: CameraId::parse(&id)?,
                stream_url: row.get(1)?,
                branch: row.get(2)?,
                is_active: row.get(3)?,
            });
        }
        Ok(out)
    }

    fn save(&mut self, snapshot: &CountSnapshot) -> Result<()> {
        let timestamp = to_i64(snapshot.timestamp, "snapshot timestamp")?;
        self.conn.execute(
            r#"
            INSERT INTO person_counts(camera_id, count, total_count, timestamp)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                snapshot.camera_id.as_str(),
                snapshot.current_count,
                snapshot.total_unique,
                timestamp
            ],
        )?;
        Ok(())
    }

    fn snapshots(&mut self, id: &CameraId, from: u64, to: u64) -> Result<Vec<CountSnapshot>> {
        let from = to_i64(from, "range start")?;
        let to = to_i64(to, "range end")?;
        let mut stmt = self.conn.prepare(
            r#"
            SELECT count, total_count, timestamp FROM person_counts
            WHERE camera_id = ?1 AND timestamp >= ?2 AND timestamp < ?3
            ORDER BY timestamp ASC, id ASC
            "#,
        )?;
        let mut rows = stmt.query(params![id.as_str(), from, to])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let timestamp: i64 = row.get(2)?;
            out.push(CountSnapshot {
                camera_id: id.clone(),
                current_count: row.get(0)?,
                total_unique: row.get(1)?,
                timestamp: u64::try_from(timestamp)
                    .map_err(|_| anyhow!("negative snapshot timestamp"))?,
            });
        }
        Ok(out)
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryCountStore {
    cameras: BTreeMap<CameraId, CameraRecord>,
    snapshots: Vec<CountSnapshot>,
}

impl InMemoryCountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every snapshot saved so far, in save order.
    pub fn saved(&self) -> &[CountSnapshot] {
        &self.snapshots
    }

    pub fn remove_camera(&mut self, id: &CameraId) -> bool {
        self.cameras.remove(id).is_some()
    }
}

impl CountStore for InMemoryCountStore {
    fn ensure_camera(&mut self, record: &CameraRecord) -> Result<()> {
        self.cameras
            .entry(record.id.clone())
            .or_insert_with(|| record.clone());
        Ok(())
    }

    fn camera_active(&mut self, id: &CameraId) -> Result<Option<bool>> {
        Ok(self.cameras.get(id).map(|record| record.is_active))
    }

    fn set_camera_active(&mut self, id: &CameraId, active: bool) -> Result<bool> {
        match self.cameras.get_mut(id) {
            Some(record) => {
                record.is_active = active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn cameras(&mut self) -> Result<Vec<CameraRecord>> {
        Ok(self.cameras.values().cloned().collect())
    }

    fn save(&mut self, snapshot: &CountSnapshot) -> Result<()> {
        self.snapshots.push(snapshot.clone());
        Ok(())
    }

    fn snapshots(&mut self, id: &CameraId, from: u64, to: u64) -> Result<Vec<CountSnapshot>> {
        let mut out: Vec<CountSnapshot> = self
            .snapshots
            .iter()
            .filter(|s| &s.camera_id == id && s.timestamp >= from && s.timestamp < to)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.timestamp);
        Ok(out)
    }
}
