use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use alpr_trigger::config::TriggerdConfig;
use alpr_trigger::ZoneKind;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "TRIGGERD_CONFIG",
        "TRIGGERD_DB_PATH",
        "TRIGGERD_STORAGE_DIR",
        "TRIGGERD_FONT_PATH",
        "TRIGGERD_DETECTOR",
        "TRIGGERD_MQTT_ADDR",
        "TRIGGERD_CONNECT_TIMEOUT_SECS",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    std::io::Write::write_all(&mut file, contents.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_json_config_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".json",
        r#"{
            "db_path": "alpr_prod.db",
            "storage_dir": "/var/lib/alpr",
            "stats_interval_secs": 15,
            "detector": { "backend": "stub", "min_confidence": 0.5, "vehicle_only": false },
            "tracker": { "min_frames_in_zone": 4, "max_distance": 80.0, "processed_grace_secs": 2.5 },
            "stream": { "queue_capacity": 4, "backoff_base_secs": 1.5, "heartbeat_secs": 10 },
            "mqtt": { "broker_addr": "mqtt://broker:1883" },
            "cameras": [
                {
                    "id": "gate",
                    "stream_url": "rtsp://user:pw@10.0.0.5/stream1",
                    "fps": 5,
                    "trigger_zone": { "points": [[0.1, 0.1], [0.9, 0.9]], "type": "rectangle" }
                },
                { "id": "dock", "enabled": false }
            ]
        }"#,
    );

    std::env::set_var("TRIGGERD_CONFIG", file.path());
    std::env::set_var("TRIGGERD_DB_PATH", "override.db");
    std::env::set_var("TRIGGERD_CONNECT_TIMEOUT_SECS", "12");

    let cfg = TriggerdConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "override.db");
    assert_eq!(cfg.storage_dir, PathBuf::from("/var/lib/alpr"));
    assert_eq!(cfg.stats_interval, Duration::from_secs(15));
    assert_eq!(cfg.detector.backend, "stub");
    assert_eq!(cfg.detector.filter.min_confidence, 0.5);
    assert!(!cfg.detector.filter.vehicle_only);
    assert_eq!(cfg.stream.detection_filter.min_confidence, 0.5);
    assert_eq!(cfg.stream.tracker.min_frames_in_zone, 4);
    assert_eq!(cfg.stream.tracker.min_frames_out_of_zone, 5);
    assert_eq!(cfg.stream.tracker.max_distance, 80.0);
    assert_eq!(cfg.stream.tracker.processed_grace, Duration::from_millis(2500));
    assert_eq!(cfg.stream.queue_capacity, 4);
    assert_eq!(cfg.stream.backoff_base, Duration::from_millis(1500));
    assert_eq!(cfg.stream.heartbeat_interval, Duration::from_secs(10));
    assert_eq!(cfg.stream.connect_timeout, Duration::from_secs(12));

    let mqtt = cfg.mqtt.expect("mqtt settings");
    assert_eq!(mqtt.broker_addr, "mqtt://broker:1883");
    assert_eq!(mqtt.topic, "alpr/recognition/jobs");
    assert_eq!(mqtt.client_id, "triggerd");

    assert_eq!(cfg.cameras.len(), 2);
    let gate = &cfg.cameras[0];
    assert_eq!(gate.fps, 5.0);
    assert!(gate.enabled);
    assert_eq!(gate.trigger_zone.as_ref().unwrap().zone_type, ZoneKind::Rectangle);
    let dock = &cfg.cameras[1];
    assert!(!dock.enabled);
    assert_eq!(dock.stream_url, None);
    assert_eq!(dock.fps, 2.0);

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".toml",
        r#"
db_path = "alpr.db"

[detector]
backend = "motion"

[[cameras]]
id = "north"
stream_url = "stub://north"

[cameras.trigger_zone]
points = [[0.0, 0.0], [100.0, 0.0], [100.0, 80.0]]
"#,
    );

    let cfg = TriggerdConfig::load_from(Some(file.path())).expect("load config");
    assert_eq!(cfg.db_path, "alpr.db");
    assert_eq!(cfg.detector.backend, "motion");
    assert_eq!(cfg.cameras.len(), 1);
    let zone = cfg.cameras[0].trigger_zone.as_ref().unwrap();
    assert_eq!(zone.zone_type, ZoneKind::Polygon);
    assert_eq!(zone.points.len(), 3);

    clear_env();
}

#[test]
fn defaults_without_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    std::env::set_var("TRIGGERD_MQTT_ADDR", "tcp://127.0.0.1:1883");
    std::env::set_var("TRIGGERD_DETECTOR", " stub ");

    let cfg = TriggerdConfig::load().expect("load defaults");
    assert_eq!(cfg.db_path, "triggerd.db");
    assert_eq!(cfg.storage_dir, PathBuf::from("storage"));
    assert_eq!(cfg.font_path, None);
    assert_eq!(cfg.stats_interval, Duration::from_secs(60));
    assert_eq!(cfg.detector.backend, "stub");
    assert_eq!(cfg.stream.connect_timeout, Duration::from_secs(30));
    assert_eq!(cfg.stream.read_failure_limit, 10);
    assert_eq!(cfg.stream.tracker.max_disappeared_frames, 30);
    assert_eq!(cfg.mqtt.unwrap().broker_addr, "tcp://127.0.0.1:1883");
    assert!(cfg.cameras.is_empty());

    clear_env();
}

#[test]
fn rejects_invalid_connect_timeout_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    std::env::set_var("TRIGGERD_CONNECT_TIMEOUT_SECS", "soon");

    let err = TriggerdConfig::load().unwrap_err();
    assert!(err.to_string().contains("TRIGGERD_CONNECT_TIMEOUT_SECS"));

    std::env::set_var("TRIGGERD_CONNECT_TIMEOUT_SECS", "0");
    let err = TriggerdConfig::load().unwrap_err();
    assert!(err.to_string().contains("connect timeout"));

    clear_env();
}

#[test]
fn rejects_invalid_camera_zone() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".json",
        r#"{ "cameras": [ { "id": "gate", "trigger_zone": { "points": [[0, 0], [1, 1]] } } ] }"#,
    );
    let err = TriggerdConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("camera gate"));

    let file = write_config(
        ".json",
        r#"{ "cameras": [ { "id": "gate", "trigger_zone": { "points": [[0, 0]], "type": "circle" } } ] }"#,
    );
    assert!(TriggerdConfig::load_from(Some(file.path())).is_err());

    clear_env();
}

#[test]
fn rejects_out_of_range_settings() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(".json", r#"{ "detector": { "min_confidence": 1.5 } }"#);
    let err = TriggerdConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("min_confidence"));

    let file = write_config(".json", r#"{ "stream": { "queue_capacity": 0 } }"#);
    assert!(TriggerdConfig::load_from(Some(file.path())).is_err());

    let file = write_config(".json", r#"{ "tracker": { "max_distance": -1.0 } }"#);
    assert!(TriggerdConfig::load_from(Some(file.path())).is_err());

    clear_env();
}

#[test]
fn rejects_oversized_intervals() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(".json", r#"{ "stream": { "backoff_base_secs": 1e20 } }"#);
    let err = TriggerdConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("backoff base"), "{err}");

    let file = write_config(".json", r#"{ "stream": { "heartbeat_secs": 172800 } }"#);
    let err = TriggerdConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("heartbeat interval"), "{err}");

    let file = write_config(".json", r#"{ "tracker": { "processed_grace_secs": 1e300 } }"#);
    assert!(TriggerdConfig::load_from(Some(file.path())).is_err());

    std::env::set_var("TRIGGERD_CONNECT_TIMEOUT_SECS", "18446744073709551615");
    let err = TriggerdConfig::load().unwrap_err();
    assert!(err.to_string().contains("connect timeout"), "{err}");

    let file = write_config(".json", r#"{ "stream": { "backoff_base_secs": 3600 } }"#);
    std::env::remove_var("TRIGGERD_CONNECT_TIMEOUT_SECS");
    let cfg = TriggerdConfig::load_from(Some(file.path())).expect("load config");
    assert_eq!(cfg.stream.backoff_base, Duration::from_secs(3600));

    clear_env();
}
