use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::DetectionFilter;
use crate::storage::CameraRecord;
use crate::stream::StreamSettings;
use crate::tracker::TrackerConfig;
use crate::zone::ZoneGeometry;

const DEFAULT_DB_PATH: &str = "triggerd.db";
const DEFAULT_STORAGE_DIR: &str = "storage";
const DEFAULT_DETECTOR: &str = "motion";
const DEFAULT_MQTT_TOPIC: &str = "alpr/recognition/jobs";
const DEFAULT_MQTT_CLIENT_ID: &str = "triggerd";
const DEFAULT_STATS_INTERVAL_SECS: u64 = 60;
/// Upper bound for every configured interval and timeout.
const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Deserialize, Default)]
struct TriggerdConfigFile {
    db_path: Option<String>,
    storage_dir: Option<PathBuf>,
    font_path: Option<PathBuf>,
    stats_interval_secs: Option<u64>,
    detector: Option<DetectorConfigFile>,
    tracker: Option<TrackerConfigFile>,
    stream: Option<StreamConfigFile>,
    mqtt: Option<MqttConfigFile>,
    #[serde(default)]
    cameras: Vec<CameraRecord>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    min_confidence: Option<f32>,
    vehicle_only: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackerConfigFile {
    max_disappeared_frames: Option<u32>,
    max_distance: Option<f64>,
    min_frames_in_zone: Option<u32>,
    min_frames_out_of_zone: Option<u32>,
    history_len: Option<usize>,
    processed_grace_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    queue_capacity: Option<usize>,
    connect_timeout_secs: Option<f64>,
    read_failure_limit: Option<u32>,
    backoff_base_secs: Option<f64>,
    heartbeat_secs: Option<f64>,
    join_timeout_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker_addr: Option<String>,
    topic: Option<String>,
    client_id: Option<String>,
}

/// Daemon configuration: optional file (`TRIGGERD_CONFIG`), then environment overrides.
#[derive(Debug, Clone)]
pub struct TriggerdConfig {
    pub db_path: String,
    pub storage_dir: PathBuf,
    pub font_path: Option<PathBuf>,
    pub stats_interval: Duration,
    pub detector: DetectorSettings,
    /// Stream worker tuning, including the tracker configuration.
    pub stream: StreamSettings,
    pub mqtt: Option<MqttSettings>,
    /// Camera records seeded into the store at startup.
    pub cameras: Vec<CameraRecord>,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: String,
    pub filter: DetectionFilter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    pub broker_addr: String,
    pub topic: String,
    pub client_id: String,
}

impl TriggerdConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("TRIGGERD_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Like `load`, with the config file given explicitly instead of via `TRIGGERD_CONFIG`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self> {
        let file_cfg = match config_path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: TriggerdConfigFile) -> Self {
        let detector = file.detector.unwrap_or_default();
        let default_filter = DetectionFilter::default();
        let detector = DetectorSettings {
            backend: detector
                .backend
                .unwrap_or_else(|| DEFAULT_DETECTOR.to_string()),
            filter: DetectionFilter {
                min_confidence: detector
                    .min_confidence
                    .unwrap_or(default_filter.min_confidence),
                vehicle_only: detector.vehicle_only.unwrap_or(default_filter.vehicle_only),
            },
        };

        let tracker_file = file.tracker.unwrap_or_default();
        let defaults = TrackerConfig::default();
        let tracker = TrackerConfig {
            max_disappeared_frames: tracker_file
                .max_disappeared_frames
                .unwrap_or(defaults.max_disappeared_frames),
            max_distance: tracker_file.max_distance.unwrap_or(defaults.max_distance),
            min_frames_in_zone: tracker_file
                .min_frames_in_zone
                .unwrap_or(defaults.min_frames_in_zone),
            min_frames_out_of_zone: tracker_file
                .min_frames_out_of_zone
                .unwrap_or(defaults.min_frames_out_of_zone),
            history_len: tracker_file.history_len.unwrap_or(defaults.history_len),
            processed_grace: tracker_file
                .processed_grace_secs
                .map(secs)
                .unwrap_or(defaults.processed_grace),
            fps: defaults.fps,
        };

        let stream_file = file.stream.unwrap_or_default();
        let defaults = StreamSettings::default();
        let stream = StreamSettings {
            queue_capacity: stream_file.queue_capacity.unwrap_or(defaults.queue_capacity),
            connect_timeout: stream_file
                .connect_timeout_secs
                .map(secs)
                .unwrap_or(defaults.connect_timeout),
            read_failure_limit: stream_file
                .read_failure_limit
                .unwrap_or(defaults.read_failure_limit),
            backoff_base: stream_file
                .backoff_base_secs
                .map(secs)
                .unwrap_or(defaults.backoff_base),
            heartbeat_interval: stream_file
                .heartbeat_secs
                .map(secs)
                .unwrap_or(defaults.heartbeat_interval),
            join_timeout: stream_file
                .join_timeout_secs
                .map(secs)
                .unwrap_or(defaults.join_timeout),
            tracker,
            detection_filter: detector.filter,
            ..defaults
        };

        let mqtt = file.mqtt.and_then(|mqtt| {
            mqtt.broker_addr.map(|broker_addr| MqttSettings {
                broker_addr,
                topic: mqtt.topic.unwrap_or_else(|| DEFAULT_MQTT_TOPIC.to_string()),
                client_id: mqtt
                    .client_id
                    .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
            })
        });

        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            storage_dir: file
                .storage_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR)),
            font_path: file.font_path,
            stats_interval: Duration::from_secs(
                file.stats_interval_secs
                    .unwrap_or(DEFAULT_STATS_INTERVAL_SECS),
            ),
            detector,
            stream,
            mqtt,
            cameras: file.cameras,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("TRIGGERD_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(dir) = std::env::var("TRIGGERD_STORAGE_DIR") {
            if !dir.trim().is_empty() {
                self.storage_dir = PathBuf::from(dir);
            }
        }
        if let Ok(path) = std::env::var("TRIGGERD_FONT_PATH") {
            if !path.trim().is_empty() {
                self.font_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(backend) = std::env::var("TRIGGERD_DETECTOR") {
            if !backend.trim().is_empty() {
                self.detector.backend = backend.trim().to_string();
            }
        }
        if let Ok(addr) = std::env::var("TRIGGERD_MQTT_ADDR") {
            if !addr.trim().is_empty() {
                match self.mqtt.as_mut() {
                    Some(mqtt) => mqtt.broker_addr = addr,
                    None => {
                        self.mqtt = Some(MqttSettings {
                            broker_addr: addr,
                            topic: DEFAULT_MQTT_TOPIC.to_string(),
                            client_id: DEFAULT_MQTT_CLIENT_ID.to_string(),
                        })
                    }
                }
            }
        }
        if let Ok(timeout) = std::env::var("TRIGGERD_CONNECT_TIMEOUT_SECS") {
            let seconds: u64 = timeout.parse().map_err(|_| {
                anyhow!("TRIGGERD_CONNECT_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.stream.connect_timeout = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        let stream = &self.stream;
        for (name, value) in [
            ("connect timeout", stream.connect_timeout),
            ("backoff base", stream.backoff_base),
            ("heartbeat interval", stream.heartbeat_interval),
            ("join timeout", stream.join_timeout),
            ("stats interval", self.stats_interval),
        ] {
            if value.is_zero() {
                return Err(anyhow!("{} must be greater than zero", name));
            }
            if value > MAX_INTERVAL {
                return Err(anyhow!(
                    "{} must not exceed {}s",
                    name,
                    MAX_INTERVAL.as_secs()
                ));
            }
        }
        if self.stream.tracker.processed_grace > MAX_INTERVAL {
            return Err(anyhow!(
                "tracker processed_grace_secs must not exceed {}s",
                MAX_INTERVAL.as_secs()
            ));
        }
        if stream.queue_capacity == 0 {
            return Err(anyhow!("stream queue capacity must be at least 1"));
        }
        if stream.read_failure_limit == 0 {
            return Err(anyhow!("read failure limit must be at least 1"));
        }

        let tracker = &self.stream.tracker;
        if tracker.min_frames_in_zone == 0
            || tracker.min_frames_out_of_zone == 0
            || tracker.max_disappeared_frames == 0
            || tracker.history_len == 0
        {
            return Err(anyhow!("tracker frame thresholds must be at least 1"));
        }
        if !(tracker.max_distance.is_finite() && tracker.max_distance > 0.0) {
            return Err(anyhow!("tracker max_distance must be a positive number"));
        }

        let confidence = self.detector.filter.min_confidence;
        if !(0.0..=1.0).contains(&confidence) {
            return Err(anyhow!("detector min_confidence must be within [0, 1]"));
        }

        for camera in &self.cameras {
            if camera.id.trim().is_empty() {
                return Err(anyhow!("camera id must not be empty"));
            }
            if let Some(zone) = &camera.trigger_zone {
                ZoneGeometry::from_spec(zone)
                    .map_err(|e| anyhow!("camera {}: {}", camera.id, e))?;
            }
        }
        Ok(())
    }
}

/// Non-positive or non-finite values map to zero and out-of-range ones to
/// `Duration::MAX`; `validate` rejects both.
fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

fn read_config_file(path: &Path) -> Result<TriggerdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
