//! Persistence collaborators: camera configuration, status reports, capture records
//! and the recognition job outbox.
//!
//! The stream core only talks to the traits. `SqliteStore` is the durable
//! implementation used by `triggerd`; `InMemoryStore` keeps everything in memory and
//! records every status report in order, which the tests rely on.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::recognition::{RecognitionJob, RecognitionQueue};
use crate::zone::{BBox, ZoneSpec};
use crate::{open_db_connection, CameraStatus};

fn default_fps() -> f32 {
    2.0
}

fn default_enabled() -> bool {
    true
}

/// Camera configuration as stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub stream_url: Option<String>,
    #[serde(default = "default_fps")]
    pub fps: f32,
    #[serde(default)]
    pub trigger_zone: Option<ZoneSpec>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl CameraRecord {
    pub fn new(id: &str, stream_url: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            stream_url: Some(stream_url.to_string()),
            fps: default_fps(),
            trigger_zone: None,
            enabled: true,
        }
    }
}

/// Capture about to be recorded for a triggered track.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NewCapture {
    pub camera_id: String,
    pub track_id: u64,
    /// Origin tag, `"STREAM"` for stream triggers.
    pub source: String,
    pub image_path: String,
    pub sha256: String,
    pub bbox: BBox,
    pub captured_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CaptureRecord {
    pub id: i64,
    #[serde(flatten)]
    pub capture: NewCapture,
}

/// One status report as received by a `StatusSink`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusReport {
    pub camera_id: String,
    pub status: CameraStatus,
    pub at: DateTime<Utc>,
}

pub trait CameraStore: Send + Sync {
    fn get_camera(&self, camera_id: &str) -> Result<Option<CameraRecord>>;

    fn list_cameras(&self) -> Result<Vec<CameraRecord>>;
}

/// Receives ONLINE/OFFLINE reports. Best effort: callers log failures and carry on.
pub trait StatusSink: Send + Sync {
    fn report(&self, camera_id: &str, status: CameraStatus, at: DateTime<Utc>) -> Result<()>;
}

pub trait CaptureStore: Send + Sync {
    /// Record a capture and return its id.
    fn insert_capture(&self, capture: &NewCapture) -> Result<i64>;
}

// ----------------------------------------------------------------------------
// SQLite
// ----------------------------------------------------------------------------

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("sqlite connection lock poisoned"))
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cameras (
              id TEXT PRIMARY KEY,
              name TEXT NOT NULL,
              stream_url TEXT,
              fps REAL NOT NULL,
              trigger_zone TEXT,
              enabled INTEGER NOT NULL,
              status TEXT NOT NULL DEFAULT 'OFFLINE',
              status_at TEXT
            );

            CREATE TABLE IF NOT EXISTS captures (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              camera_id TEXT NOT NULL,
              track_id INTEGER NOT NULL,
              source TEXT NOT NULL,
              image_path TEXT NOT NULL,
              sha256 TEXT NOT NULL,
              bbox_json TEXT NOT NULL,
              captured_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS recognition_jobs (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              capture_id INTEGER NOT NULL,
              payload_json TEXT NOT NULL,
              created_at TEXT NOT NULL,
              done INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_captures_camera ON captures(camera_id);
            CREATE INDEX IF NOT EXISTS idx_jobs_pending ON recognition_jobs(done, id);
            "#,
        )?;
        Ok(())
    }

    /// Insert or replace a camera row. Status columns are preserved.
    pub fn upsert_camera(&self, camera: &CameraRecord) -> Result<()> {
        let zone_json = camera
            .trigger_zone
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.conn()?.execute(
            r#"
            INSERT INTO cameras(id, name, stream_url, fps, trigger_zone, enabled)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
              name = excluded.name,
              stream_url = excluded.stream_url,
              fps = excluded.fps,
              trigger_zone = excluded.trigger_zone,
              enabled = excluded.enabled
            "#,
            params![
                camera.id,
                camera.name,
                camera.stream_url,
                f64::from(camera.fps),
                zone_json,
                camera.enabled
            ],
        )?;
        Ok(())
    }

    /// Replace a camera's trigger zone. Returns false when the camera is unknown.
    pub fn update_trigger_zone(&self, camera_id: &str, zone: Option<&ZoneSpec>) -> Result<bool> {
        let zone_json = zone.map(serde_json::to_string).transpose()?;
        let changed = self.conn()?.execute(
            "UPDATE cameras SET trigger_zone = ?1 WHERE id = ?2",
            params![zone_json, camera_id],
        )?;
        Ok(changed > 0)
    }

    pub fn camera_status(&self, camera_id: &str) -> Result<Option<(CameraStatus, Option<DateTime<Utc>>)>> {
        let row: Option<(String, Option<String>)> = self
            .conn()?
            .query_row(
                "SELECT status, status_at FROM cameras WHERE id = ?1",
                params![camera_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((status, at)) = row else {
            return Ok(None);
        };
        let status = status.parse::<CameraStatus>()?;
        let at = at.map(|s| parse_ts(&s)).transpose()?;
        Ok(Some((status, at)))
    }

    pub fn list_captures(&self, camera_id: &str) -> Result<Vec<CaptureRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, camera_id, track_id, source, image_path, sha256, bbox_json, captured_at
            FROM captures WHERE camera_id = ?1 ORDER BY id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![camera_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, camera_id, track_id, source, image_path, sha256, bbox_json, captured_at) = row?;
            out.push(CaptureRecord {
                id,
                capture: NewCapture {
                    camera_id,
                    track_id: u64::try_from(track_id)
                        .map_err(|_| anyhow!("corrupt capture {}: negative track id", id))?,
                    source,
                    image_path,
                    sha256,
                    bbox: serde_json::from_str(&bbox_json)?,
                    captured_at: parse_ts(&captured_at)?,
                },
            });
        }
        Ok(out)
    }

    /// Oldest unfinished recognition jobs, with their outbox ids.
    pub fn pending_recognition_jobs(&self, limit: usize) -> Result<Vec<(i64, RecognitionJob)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, payload_json FROM recognition_jobs WHERE done = 0 ORDER BY id ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, payload) = row?;
            out.push((id, serde_json::from_str(&payload)?));
        }
        Ok(out)
    }

    pub fn complete_recognition_job(&self, job_id: i64) -> Result<bool> {
        let changed = self.conn()?.execute(
            "UPDATE recognition_jobs SET done = 1 WHERE id = ?1",
            params![job_id],
        )?;
        Ok(changed > 0)
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("parse timestamp {:?}", s))?
        .with_timezone(&Utc))
}

type CameraRow = (String, String, Option<String>, f64, Option<String>, bool);

fn camera_from_row(row: CameraRow) -> Result<CameraRecord> {
    let (id, name, stream_url, fps, zone_json, enabled) = row;
    let trigger_zone = zone_json
        .as_deref()
        .map(serde_json::from_str::<ZoneSpec>)
        .transpose()
        .with_context(|| format!("camera {}: malformed trigger_zone", id))?;
    Ok(CameraRecord {
        id,
        name,
        stream_url,
        fps: fps as f32,
        trigger_zone,
        enabled,
    })
}

impl CameraStore for SqliteStore {
    fn get_camera(&self, camera_id: &str) -> Result<Option<CameraRecord>> {
        let row: Option<CameraRow> = self
            .conn()?
            .query_row(
                "SELECT id, name, stream_url, fps, trigger_zone, enabled FROM cameras WHERE id = ?1",
                params![camera_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()?;
        row.map(camera_from_row).transpose()
    }

    fn list_cameras(&self) -> Result<Vec<CameraRecord>> {
        let rows: Vec<CameraRow> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT id, name, stream_url, fps, trigger_zone, enabled FROM cameras ORDER BY id ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?;
            let collected = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            collected
        };
        rows.into_iter().map(camera_from_row).collect()
    }
}

impl StatusSink for SqliteStore {
    fn report(&self, camera_id: &str, status: CameraStatus, at: DateTime<Utc>) -> Result<()> {
        self.conn()?.execute(
            "UPDATE cameras SET status = ?1, status_at = ?2 WHERE id = ?3",
            params![status.as_str(), at.to_rfc3339(), camera_id],
        )?;
        Ok(())
    }
}

impl CaptureStore for SqliteStore {
    fn insert_capture(&self, capture: &NewCapture) -> Result<i64> {
        let track_id = i64::try_from(capture.track_id)
            .map_err(|_| anyhow!("track id exceeds i64 range"))?;
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO captures(camera_id, track_id, source, image_path, sha256, bbox_json, captured_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                capture.camera_id,
                track_id,
                capture.source,
                capture.image_path,
                capture.sha256,
                serde_json::to_string(&capture.bbox)?,
                capture.captured_at.to_rfc3339()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

impl RecognitionQueue for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite-outbox"
    }

    fn enqueue(&self, job: &RecognitionJob) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO recognition_jobs(capture_id, payload_json, created_at) VALUES (?1, ?2, ?3)",
            params![
                job.capture_id,
                serde_json::to_string(job)?,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// In-memory
// ----------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    cameras: BTreeMap<String, CameraRecord>,
    reports: Vec<StatusReport>,
    captures: Vec<CaptureRecord>,
    jobs: Vec<RecognitionJob>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    pub fn upsert_camera(&self, camera: CameraRecord) -> Result<()> {
        self.state()?.cameras.insert(camera.id.clone(), camera);
        Ok(())
    }

    pub fn update_trigger_zone(&self, camera_id: &str, zone: Option<ZoneSpec>) -> Result<bool> {
        let mut state = self.state()?;
        match state.cameras.get_mut(camera_id) {
            Some(camera) => {
                camera.trigger_zone = zone;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Every status report received, in order.
    pub fn status_reports(&self) -> Vec<StatusReport> {
        self.state().map(|s| s.reports.clone()).unwrap_or_default()
    }

    /// Status sequence reported for one camera.
    pub fn statuses_for(&self, camera_id: &str) -> Vec<CameraStatus> {
        self.status_reports()
            .into_iter()
            .filter(|r| r.camera_id == camera_id)
            .map(|r| r.status)
            .collect()
    }

    pub fn captures(&self) -> Vec<CaptureRecord> {
        self.state().map(|s| s.captures.clone()).unwrap_or_default()
    }

    pub fn jobs(&self) -> Vec<RecognitionJob> {
        self.state().map(|s| s.jobs.clone()).unwrap_or_default()
    }
}

impl CameraStore for InMemoryStore {
    fn get_camera(&self, camera_id: &str) -> Result<Option<CameraRecord>> {
        Ok(self.state()?.cameras.get(camera_id).cloned())
    }

    fn list_cameras(&self) -> Result<Vec<CameraRecord>> {
        Ok(self.state()?.cameras.values().cloned().collect())
    }
}

impl StatusSink for InMemoryStore {
    fn report(&self, camera_id: &str, status: CameraStatus, at: DateTime<Utc>) -> Result<()> {
        self.state()?.reports.push(StatusReport {
            camera_id: camera_id.to_string(),
            status,
            at,
        });
        Ok(())
    }
}

impl CaptureStore for InMemoryStore {
    fn insert_capture(&self, capture: &NewCapture) -> Result<i64> {
        let mut state = self.state()?;
        let id = state.captures.len() as i64 + 1;
        state.captures.push(CaptureRecord {
            id,
            capture: capture.clone(),
        });
        Ok(id)
    }
}

impl RecognitionQueue for InMemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn enqueue(&self, job: &RecognitionJob) -> Result<()> {
        self.state()?.jobs.push(job.clone());
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_memory_uri;

    fn capture(camera_id: &str, track_id: u64) -> NewCapture {
        NewCapture {
            camera_id: camera_id.to_string(),
            track_id,
            source: "STREAM".to_string(),
            image_path: format!("/tmp/{camera_id}_{track_id}.jpg"),
            sha256: "ab".repeat(32),
            bbox: BBox::new(1.0, 2.0, 30.0, 40.0),
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn sqlite_camera_round_trip_and_zone_update() -> Result<()> {
        let store = SqliteStore::open(&shared_memory_uri())?;
        let mut camera = CameraRecord::new("gate", "stub://gate");
        camera.trigger_zone = Some(ZoneSpec::rectangle([0.1, 0.1], [0.9, 0.9]));
        store.upsert_camera(&camera)?;

        assert_eq!(store.get_camera("gate")?, Some(camera.clone()));
        assert_eq!(store.get_camera("missing")?, None);

        assert!(store.update_trigger_zone("gate", None)?);
        assert!(!store.update_trigger_zone("missing", None)?);
        assert_eq!(store.get_camera("gate")?.unwrap().trigger_zone, None);

        camera.enabled = false;
        store.upsert_camera(&camera)?;
        let listed = store.list_cameras()?;
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].enabled);
        Ok(())
    }

    #[test]
    fn sqlite_status_reports_update_camera_row() -> Result<()> {
        let store = SqliteStore::open(&shared_memory_uri())?;
        store.upsert_camera(&CameraRecord::new("gate", "stub://gate"))?;
        assert_eq!(store.camera_status("gate")?.map(|s| s.0), Some(CameraStatus::Offline));

        let at = Utc::now();
        store.report("gate", CameraStatus::Online, at)?;
        let (status, reported_at) = store.camera_status("gate")?.unwrap();
        assert_eq!(status, CameraStatus::Online);
        assert_eq!(reported_at.map(|t| t.timestamp()), Some(at.timestamp()));
        Ok(())
    }

    #[test]
    fn sqlite_captures_and_outbox() -> Result<()> {
        let store = SqliteStore::open(&shared_memory_uri())?;
        let first = store.insert_capture(&capture("gate", 7))?;
        let second = store.insert_capture(&capture("gate", 8))?;
        assert!(second > first);

        let captures = store.list_captures("gate")?;
        assert_eq!(captures.len(), 2);
        assert_eq!(captures[0].capture.track_id, 7);
        assert_eq!(captures[0].capture.bbox, BBox::new(1.0, 2.0, 30.0, 40.0));

        let job = RecognitionJob {
            capture_id: first,
            image_path: captures[0].capture.image_path.clone(),
            camera_id: "gate".to_string(),
            track_id: 7,
            bbox: captures[0].capture.bbox,
            captured_at: captures[0].capture.captured_at,
        };
        store.enqueue(&job)?;
        let pending = store.pending_recognition_jobs(10)?;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1.capture_id, first);

        assert!(store.complete_recognition_job(pending[0].0)?);
        assert!(store.pending_recognition_jobs(10)?.is_empty());
        Ok(())
    }

    #[test]
    fn in_memory_records_reports_in_order() -> Result<()> {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store.report("a", CameraStatus::Online, now)?;
        store.report("b", CameraStatus::Online, now)?;
        store.report("a", CameraStatus::Offline, now)?;

        assert_eq!(
            store.statuses_for("a"),
            vec![CameraStatus::Online, CameraStatus::Offline]
        );
        assert_eq!(store.status_reports().len(), 3);
        Ok(())
    }

    #[test]
    fn camera_record_defaults_from_json() -> Result<()> {
        let camera: CameraRecord = serde_json::from_str(r#"{"id": "gate"}"#)?;
        assert_eq!(camera.fps, 2.0);
        assert!(camera.enabled);
        assert_eq!(camera.stream_url, None);
        Ok(())
    }
}
