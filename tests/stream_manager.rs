use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use image::RgbImage;

use alpr_trigger::detect::{BackendFactory, DetectorBackend, ScriptStep, ScriptedBackend};
use alpr_trigger::ingest::SourceFactory;
use alpr_trigger::recognition::{Trigger, TriggerCallback};
use alpr_trigger::stream::{ProcessedFrame, SubscriberCallback};
use alpr_trigger::{
    BBox, BackendRegistry, CameraStatus, Detection, FrameSource, InMemoryStore, ObjectClass,
    ReleaseError, StreamConfig, StreamManager, StreamSettings, ZoneSpec,
};

#[derive(Clone, Copy, Debug)]
enum Read {
    Frame,
    Miss,
    Error,
}

/// Source replaying a shared script of reads; yields frames once the script runs out.
struct ScriptedSource {
    script: Arc<Mutex<VecDeque<Read>>>,
    releases: Arc<AtomicUsize>,
    width: u32,
    height: u32,
    open: bool,
}

impl FrameSource for ScriptedSource {
    fn open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn read(&mut self) -> Result<Option<RgbImage>> {
        if !self.open {
            return Err(anyhow!("source not open"));
        }
        let next = self.script.lock().unwrap().pop_front().unwrap_or(Read::Frame);
        match next {
            Read::Frame => Ok(Some(RgbImage::new(self.width, self.height))),
            Read::Miss => Ok(None),
            Read::Error => Err(anyhow!("decoder lost sync")),
        }
    }

    fn release(&mut self) -> Result<(), ReleaseError> {
        if self.open {
            self.open = false;
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

struct SourceHarness {
    script: Arc<Mutex<VecDeque<Read>>>,
    releases: Arc<AtomicUsize>,
    connects: Arc<AtomicUsize>,
}

impl SourceHarness {
    fn new(script: impl IntoIterator<Item = Read>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into_iter().collect())),
            releases: Arc::new(AtomicUsize::new(0)),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn factory(&self, width: u32, height: u32) -> SourceFactory {
        let script = self.script.clone();
        let releases = self.releases.clone();
        let connects = self.connects.clone();
        Arc::new(move |_url: &str| {
            connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedSource {
                script: script.clone(),
                releases: releases.clone(),
                width,
                height,
                open: false,
            }) as Box<dyn FrameSource>)
        })
    }
}

fn fast_settings() -> StreamSettings {
    StreamSettings {
        connect_timeout: Duration::from_secs(2),
        read_retry_delay: Duration::from_millis(1),
        backoff_base: Duration::from_millis(10),
        heartbeat_interval: Duration::from_secs(3600),
        join_timeout: Duration::from_secs(2),
        dequeue_timeout: Duration::from_millis(20),
        ..StreamSettings::default()
    }
}

fn fast_config(camera_id: &str) -> StreamConfig {
    let mut config = StreamConfig::new(camera_id, "stub://test");
    config.fps = 50.0;
    config
}

fn stub_detector() -> BackendFactory {
    BackendRegistry::with_builtin().default_factory().unwrap()
}

fn scripted_detector(backend: ScriptedBackend) -> BackendFactory {
    Arc::new(move || Ok(Box::new(backend.clone()) as Box<dyn DetectorBackend>))
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn failed_reads_force_one_offline_then_one_online() {
    let mut script = vec![Read::Frame, Read::Frame];
    script.extend(std::iter::repeat(Read::Miss).take(10));
    let harness = SourceHarness::new(script);
    let status = Arc::new(InMemoryStore::new());

    let manager = StreamManager::new(fast_config("gate"), fast_settings(), status.clone(), stub_detector())
        .with_source_factory(harness.factory(64, 48));
    manager.start().unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        status.statuses_for("gate").len() >= 3
    }));
    assert!(wait_until(Duration::from_secs(2), || manager.stats().frames_processed > 0));
    manager.stop();

    assert_eq!(
        status.statuses_for("gate"),
        vec![
            CameraStatus::Online,
            CameraStatus::Offline,
            CameraStatus::Online,
            CameraStatus::Offline,
        ]
    );
    assert_eq!(harness.connects.load(Ordering::SeqCst), 2);
    assert_eq!(harness.releases.load(Ordering::SeqCst), 2);
    let stats = manager.stats();
    assert_eq!(stats.reconnects, 1);
    assert!(!stats.running);
}

#[test]
fn source_without_frames_never_reports_online() {
    let harness = SourceHarness::new(std::iter::repeat(Read::Miss).take(100_000));
    let status = Arc::new(InMemoryStore::new());
    let settings = StreamSettings {
        connect_timeout: Duration::from_millis(50),
        ..fast_settings()
    };

    let manager = StreamManager::new(fast_config("dark"), settings, status.clone(), stub_detector())
        .with_source_factory(harness.factory(64, 48));
    manager.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        harness.connects.load(Ordering::SeqCst) >= 2
    }));
    manager.stop();

    let statuses = status.statuses_for("dark");
    assert!(statuses.len() >= 2);
    assert!(statuses.iter().all(|s| *s == CameraStatus::Offline));
    assert_eq!(manager.stats().frames_captured, 0);
}

#[test]
fn dwell_then_disappearance_triggers_once_with_best_shot() {
    let harness = SourceHarness::new(Vec::new());
    let status = Arc::new(InMemoryStore::new());
    let in_zone = Detection::new(BBox::new(10.0, 10.0, 50.0, 50.0), 0.9, ObjectClass::Car);
    let detector = ScriptedBackend::from_detections(vec![vec![in_zone]; 3]);

    let triggers: Arc<Mutex<Vec<(u64, BBox)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = triggers.clone();
    let callback: TriggerCallback = Arc::new(move |trigger: &Trigger| -> Result<()> {
        sink.lock().unwrap().push((trigger.track.track_id, trigger.bbox));
        Ok(())
    });

    let mut config = fast_config("lane1");
    config.trigger_zone = Some(ZoneSpec::rectangle([0.0, 0.0], [200.0, 200.0]));
    let manager = StreamManager::new(config, fast_settings(), status, scripted_detector(detector))
        .with_source_factory(harness.factory(320, 240))
        .with_trigger(callback);
    manager.start().unwrap();

    assert!(wait_until(Duration::from_secs(5), || !triggers.lock().unwrap().is_empty()));
    // Let more empty frames through; the gate keeps it at one.
    std::thread::sleep(Duration::from_millis(300));
    manager.stop();

    let fired = triggers.lock().unwrap().clone();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].1, in_zone.bbox);

    let stats = manager.stats();
    assert_eq!(stats.recognition_triggers, 1);
    assert_eq!(stats.tracker.born_in_zone, 1);
    assert_eq!(stats.tracker.captured, 1);
    assert!(stats.trigger_zone_configured);
}

#[test]
fn failing_trigger_does_not_stop_processing() {
    let harness = SourceHarness::new(Vec::new());
    let in_zone = Detection::new(BBox::new(10.0, 10.0, 50.0, 50.0), 0.9, ObjectClass::Truck);
    let detector = ScriptedBackend::from_detections(vec![vec![in_zone]; 2]);
    let callback: TriggerCallback = Arc::new(|_: &Trigger| -> Result<()> { Err(anyhow!("storage unavailable")) });

    let mut config = fast_config("lane2");
    config.trigger_zone = Some(ZoneSpec::rectangle([0.0, 0.0], [200.0, 200.0]));
    let manager = StreamManager::new(
        config,
        fast_settings(),
        Arc::new(InMemoryStore::new()),
        scripted_detector(detector),
    )
    .with_source_factory(harness.factory(320, 240))
    .with_trigger(callback);
    manager.start().unwrap();

    assert!(wait_until(Duration::from_secs(5), || manager.stats().recognition_triggers == 1));
    let processed = manager.stats().frames_processed;
    assert!(wait_until(Duration::from_secs(2), || {
        manager.stats().frames_processed > processed + 5
    }));
    manager.stop();
}

#[test]
fn subscribers_are_isolated() {
    let harness = SourceHarness::new(Vec::new());
    let manager = StreamManager::new(
        fast_config("lobby"),
        fast_settings(),
        Arc::new(InMemoryStore::new()),
        stub_detector(),
    )
    .with_source_factory(harness.factory(64, 48));

    let failing_calls = Arc::new(AtomicUsize::new(0));
    let good_calls = Arc::new(AtomicUsize::new(0));
    let failing = {
        let calls = failing_calls.clone();
        let cb: SubscriberCallback = Arc::new(move |_: &ProcessedFrame| -> Result<()> {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("client went away"))
        });
        cb
    };
    let panicking: SubscriberCallback =
        Arc::new(|_: &ProcessedFrame| -> Result<()> { panic!("subscriber bug") });
    let good = {
        let calls = good_calls.clone();
        let cb: SubscriberCallback = Arc::new(move |frame: &ProcessedFrame| -> Result<()> {
            assert_eq!(frame.camera_id, "lobby");
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        cb
    };

    manager.subscribe(failing);
    manager.subscribe(panicking);
    let good_id = manager.subscribe(good);
    assert_eq!(manager.subscriber_count(), 3);

    manager.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || good_calls.load(Ordering::SeqCst) >= 3));
    assert!(failing_calls.load(Ordering::SeqCst) >= 1);

    assert!(manager.unsubscribe(good_id));
    assert!(!manager.unsubscribe(good_id));
    assert_eq!(manager.subscriber_count(), 2);

    let latest = manager.latest_frame().expect("latest frame");
    assert!(latest.sequence >= 1);
    assert_eq!(latest.annotated.width(), 64);
    manager.stop();
}

#[test]
fn normalized_zone_resolves_against_first_frame() {
    let harness = SourceHarness::new(Vec::new());
    let mut config = fast_config("yard");
    config.trigger_zone = Some(ZoneSpec::polygon(&[
        [0.1, 0.1],
        [0.9, 0.1],
        [0.9, 0.9],
        [0.1, 0.9],
    ]));
    let manager = StreamManager::new(
        config,
        fast_settings(),
        Arc::new(InMemoryStore::new()),
        stub_detector(),
    )
    .with_source_factory(harness.factory(640, 480));
    assert!(manager.current_zone().unwrap().is_normalized());

    manager.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || manager.latest_frame().is_some()));
    manager.stop();

    let zone = manager.current_zone().unwrap();
    let points: Vec<(f64, f64)> = zone.points().iter().map(|p| (p.x, p.y)).collect();
    assert_eq!(
        points,
        vec![(64.0, 48.0), (576.0, 48.0), (576.0, 432.0), (64.0, 432.0)]
    );
}

#[test]
fn zone_reload_and_stop_are_safe() {
    let harness = SourceHarness::new(Vec::new());
    let status = Arc::new(InMemoryStore::new());
    let manager = StreamManager::new(fast_config("dock"), fast_settings(), status.clone(), stub_detector())
        .with_source_factory(harness.factory(64, 48));
    assert!(!manager.stats().trigger_zone_configured);

    manager.start().unwrap();
    manager.start().unwrap();

    manager
        .reload_trigger_zone(Some(&ZoneSpec::rectangle([0.0, 0.0], [32.0, 32.0])))
        .unwrap();
    assert!(manager.stats().trigger_zone_configured);

    let broken = ZoneSpec {
        points: vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]],
        zone_type: alpr_trigger::ZoneKind::Rectangle,
    };
    assert!(manager.reload_trigger_zone(Some(&broken)).is_err());
    assert!(!manager.stats().trigger_zone_configured);

    manager.stop();
    manager.stop();
    assert!(!manager.is_running());
    assert_eq!(status.statuses_for("dock").last(), Some(&CameraStatus::Offline));
    assert_eq!(
        status
            .statuses_for("dock")
            .iter()
            .filter(|s| **s == CameraStatus::Offline)
            .count(),
        1
    );
}

#[test]
fn read_error_forces_reconnect() {
    let harness = SourceHarness::new(vec![Read::Frame, Read::Frame, Read::Error]);
    let status = Arc::new(InMemoryStore::new());

    let manager = StreamManager::new(fast_config("ramp"), fast_settings(), status.clone(), stub_detector())
        .with_source_factory(harness.factory(64, 48));
    manager.start().unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        status.statuses_for("ramp").len() >= 3
    }));
    assert!(wait_until(Duration::from_secs(2), || manager.stats().reconnects == 1));
    manager.stop();

    assert_eq!(
        status.statuses_for("ramp"),
        vec![
            CameraStatus::Online,
            CameraStatus::Offline,
            CameraStatus::Online,
            CameraStatus::Offline,
        ]
    );
    assert_eq!(harness.connects.load(Ordering::SeqCst), 2);
    assert_eq!(harness.releases.load(Ordering::SeqCst), 2);
    assert_eq!(manager.stats().reconnects, 1);
}

#[test]
fn heartbeat_re_reports_online_while_connected() {
    let harness = SourceHarness::new(Vec::new());
    let status = Arc::new(InMemoryStore::new());
    let settings = StreamSettings {
        heartbeat_interval: Duration::from_millis(40),
        ..fast_settings()
    };

    let manager = StreamManager::new(fast_config("pier"), settings, status.clone(), stub_detector())
        .with_source_factory(harness.factory(64, 48));
    manager.start().unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        status.statuses_for("pier").len() >= 4
    }));
    let while_running = status.statuses_for("pier");
    assert!(while_running.iter().all(|s| *s == CameraStatus::Online));
    manager.stop();

    let statuses = status.statuses_for("pier");
    assert_eq!(statuses.last(), Some(&CameraStatus::Offline));
    assert_eq!(
        statuses.iter().filter(|s| **s == CameraStatus::Offline).count(),
        1
    );
    assert_eq!(harness.connects.load(Ordering::SeqCst), 1);
    assert_eq!(manager.stats().reconnects, 0);
}

#[test]
fn detector_errors_count_as_empty_frames() {
    let harness = SourceHarness::new(Vec::new());
    let in_zone = Detection::new(BBox::new(10.0, 10.0, 50.0, 50.0), 0.9, ObjectClass::Car);
    let mut steps = vec![ScriptStep::Detections(vec![in_zone]); 3];
    steps.extend(std::iter::repeat(ScriptStep::Fail("inference timed out".into())).take(40));
    let backend = ScriptedBackend::new(steps);
    let observer = backend.clone();

    let triggers: Arc<Mutex<Vec<(u64, BBox)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = triggers.clone();
    let callback: TriggerCallback = Arc::new(move |trigger: &Trigger| -> Result<()> {
        sink.lock().unwrap().push((trigger.track.track_id, trigger.bbox));
        Ok(())
    });

    let mut config = fast_config("lane3");
    config.trigger_zone = Some(ZoneSpec::rectangle([0.0, 0.0], [200.0, 200.0]));
    let manager = StreamManager::new(
        config,
        fast_settings(),
        Arc::new(InMemoryStore::new()),
        scripted_detector(backend),
    )
    .with_source_factory(harness.factory(320, 240))
    .with_trigger(callback);
    manager.start().unwrap();

    assert!(wait_until(Duration::from_secs(5), || observer.remaining() == 0));
    assert!(wait_until(Duration::from_secs(5), || !triggers.lock().unwrap().is_empty()));
    assert!(wait_until(Duration::from_secs(2), || manager.stats().frames_processed >= 43));
    assert!(manager.is_running());
    manager.stop();

    let fired = triggers.lock().unwrap().clone();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].1, in_zone.bbox);
    let stats = manager.stats();
    assert_eq!(stats.recognition_triggers, 1);
}

#[test]
fn slow_detector_start_keeps_manager_responsive() {
    let harness = SourceHarness::new(Vec::new());
    let building = Arc::new(AtomicUsize::new(0));
    let detector: BackendFactory = {
        let building = building.clone();
        let inner = stub_detector();
        Arc::new(move || {
            building.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(800));
            inner()
        })
    };
    let manager = StreamManager::new(
        fast_config("quay"),
        fast_settings(),
        Arc::new(InMemoryStore::new()),
        detector,
    )
    .with_source_factory(harness.factory(64, 48));

    std::thread::scope(|scope| {
        let starting = scope.spawn(|| manager.start());
        assert!(wait_until(Duration::from_secs(2), || building.load(Ordering::SeqCst) == 1));

        let began = Instant::now();
        assert!(!manager.is_running());
        assert!(!manager.stats().running);
        assert!(began.elapsed() < Duration::from_millis(300));

        starting.join().unwrap().unwrap();
    });
    assert!(manager.is_running());
    manager.stop();
}
