//! Hand-off from a triggered track to the external plate-recognition pipeline.
//!
//! On trigger, `CaptureHandoff` writes the best-shot frame to
//! `<storage_dir>/original/`, records a capture and enqueues a `RecognitionJob`
//! for whichever worker performs recognition (SQLite outbox or MQTT topic).

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use log::{info, warn};
use rumqttc::{Client, Connection, Event, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::frame::Frame;
use crate::storage::{CaptureStore, NewCapture};
use crate::track::Track;
use crate::zone::BBox;

/// Capture source tag for stream-triggered captures.
pub const STREAM_SOURCE: &str = "STREAM";

const JPEG_QUALITY: u8 = 92;

/// A track handed off by a stream, with its best shot.
#[derive(Clone, Debug)]
pub struct Trigger {
    pub camera_id: String,
    pub track: Track,
    pub frame: Frame,
    pub bbox: BBox,
    pub score: f64,
    pub captured_at: DateTime<Utc>,
}

/// Recognition-trigger callback. Invoked at most once per track; errors are logged
/// by the stream and never stop processing.
pub type TriggerCallback = Arc<dyn Fn(&Trigger) -> Result<()> + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecognitionJob {
    pub capture_id: i64,
    pub image_path: String,
    pub camera_id: String,
    pub track_id: u64,
    pub bbox: BBox,
    pub captured_at: DateTime<Utc>,
}

/// Where recognition jobs go.
pub trait RecognitionQueue: Send + Sync {
    fn name(&self) -> &'static str;

    fn enqueue(&self, job: &RecognitionJob) -> Result<()>;
}

// ----------------------------------------------------------------------------
// CaptureHandoff
// ----------------------------------------------------------------------------

#[derive(Clone)]
pub struct CaptureHandoff {
    storage_dir: PathBuf,
    captures: Arc<dyn CaptureStore>,
    queue: Arc<dyn RecognitionQueue>,
}

impl CaptureHandoff {
    pub fn new(
        storage_dir: impl Into<PathBuf>,
        captures: Arc<dyn CaptureStore>,
        queue: Arc<dyn RecognitionQueue>,
    ) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            captures,
            queue,
        }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Persist the best shot, record the capture and enqueue recognition.
    pub fn handle(&self, trigger: &Trigger) -> Result<RecognitionJob> {
        let dir = self.storage_dir.join("original");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create capture dir {}", dir.display()))?;

        let file_name = format!(
            "stream_{}_track_{}_{}.jpg",
            file_safe(&trigger.camera_id),
            trigger.track.track_id,
            trigger.captured_at.format("%Y%m%d_%H%M%S_%3f")
        );
        let path = dir.join(file_name);

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
            .encode_image(trigger.frame.image())
            .context("encode best shot as JPEG")?;
        std::fs::write(&path, &jpeg).with_context(|| format!("write {}", path.display()))?;
        let sha256 = hex::encode(Sha256::digest(&jpeg));
        let image_path = path.to_string_lossy().into_owned();

        let capture_id = self.captures.insert_capture(&NewCapture {
            camera_id: trigger.camera_id.clone(),
            track_id: trigger.track.track_id,
            source: STREAM_SOURCE.to_string(),
            image_path: image_path.clone(),
            sha256,
            bbox: trigger.bbox,
            captured_at: trigger.captured_at,
        })?;

        let job = RecognitionJob {
            capture_id,
            image_path,
            camera_id: trigger.camera_id.clone(),
            track_id: trigger.track.track_id,
            bbox: trigger.bbox,
            captured_at: trigger.captured_at,
        };
        self.queue.enqueue(&job)?;

        info!(
            "camera {}: track {} captured as {} (queued via {})",
            trigger.camera_id,
            trigger.track.track_id,
            capture_id,
            self.queue.name()
        );
        Ok(job)
    }

    pub fn into_callback(self) -> TriggerCallback {
        Arc::new(move |trigger: &Trigger| self.handle(trigger).map(|_| ()))
    }
}

fn file_safe(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ----------------------------------------------------------------------------
// MQTT
// ----------------------------------------------------------------------------

/// Publishes recognition jobs as JSON (QoS 1) for an external recognition worker.
pub struct MqttRecognitionQueue {
    client: Client,
    topic: String,
    stopping: Arc<AtomicBool>,
    connection_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttRecognitionQueue {
    /// Connect to `host:port` (optionally prefixed with `mqtt://` or `tcp://`).
    pub fn connect(broker_addr: &str, topic: &str, client_id: &str) -> Result<Self> {
        let (host, port) = parse_broker_addr(broker_addr)?;
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));

        let (client, connection) = Client::new(options, 64);
        let stopping = Arc::new(AtomicBool::new(false));
        let handle = spawn_connection_loop(connection, stopping.clone());
        info!("recognition jobs will be published to {} on {}", topic, broker_addr);

        Ok(Self {
            client,
            topic: topic.to_string(),
            stopping,
            connection_handle: Mutex::new(Some(handle)),
        })
    }

    pub fn disconnect(&self) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        self.client.disconnect()?;
        let handle = self
            .connection_handle
            .lock()
            .map_err(|_| anyhow!("mqtt handle lock poisoned"))?
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        Ok(())
    }
}

fn spawn_connection_loop(mut connection: Connection, stopping: Arc<AtomicBool>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for event in connection.iter() {
            if stopping.load(Ordering::SeqCst) {
                break;
            }
            match event {
                Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                Err(e) => {
                    warn!("MQTT connection error: {}", e);
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        }
    })
}

impl RecognitionQueue for MqttRecognitionQueue {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn enqueue(&self, job: &RecognitionJob) -> Result<()> {
        let payload = serde_json::to_vec(job)?;
        self.client
            .publish(self.topic.as_str(), QoS::AtLeastOnce, false, payload)?;
        Ok(())
    }
}

fn parse_broker_addr(addr: &str) -> Result<(String, u16)> {
    let mut remainder = addr.trim();
    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    if let Some(rest) = remainder.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port.parse().context("invalid MQTT port")?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = remainder
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    let port: u16 = port.parse().context("invalid MQTT port")?;
    Ok((host.to_string(), port))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use std::time::Instant;

    fn trigger(camera_id: &str) -> Trigger {
        let now = Instant::now();
        let frame = Frame::blank(64, 48);
        let bbox = BBox::new(4.0, 4.0, 30.0, 40.0);
        let mut track = Track::new(42, 30, now);
        track.update(bbox, frame.clone(), 0.9, now);
        Trigger {
            camera_id: camera_id.to_string(),
            track,
            frame,
            bbox,
            score: 0.5,
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn handoff_writes_image_records_capture_and_enqueues() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(InMemoryStore::new());
        let handoff = CaptureHandoff::new(dir.path(), store.clone(), store.clone());

        let job = handoff.handle(&trigger("gate/north"))?;

        let path = Path::new(&job.image_path);
        assert!(path.exists());
        assert!(path.starts_with(dir.path().join("original")));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("stream_gate_north_track_42_"), "{name}");
        assert!(name.ends_with(".jpg"));

        let captures = store.captures();
        assert_eq!(captures.len(), 1);
        assert_eq!(captures[0].capture.source, STREAM_SOURCE);
        assert_eq!(captures[0].id, job.capture_id);
        let bytes = std::fs::read(path)?;
        assert_eq!(captures[0].capture.sha256, hex::encode(Sha256::digest(&bytes)));

        assert_eq!(store.jobs(), vec![job]);
        Ok(())
    }

    #[test]
    fn callback_reports_storage_failures() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"")?;
        let store = Arc::new(InMemoryStore::new());
        let callback = CaptureHandoff::new(&blocker, store.clone(), store.clone()).into_callback();

        assert!(callback(&trigger("gate")).is_err());
        assert!(store.captures().is_empty());
        Ok(())
    }

    #[test]
    fn broker_addresses() -> Result<()> {
        assert_eq!(parse_broker_addr("localhost:1883")?, ("localhost".to_string(), 1883));
        assert_eq!(parse_broker_addr("mqtt://10.0.0.2:1884")?, ("10.0.0.2".to_string(), 1884));
        assert_eq!(parse_broker_addr("[::1]:1883")?, ("::1".to_string(), 1883));
        assert!(parse_broker_addr("localhost").is_err());
        assert!(parse_broker_addr("ws://host:80").is_err());
        assert!(parse_broker_addr(":1883").is_err());
        Ok(())
    }
}
