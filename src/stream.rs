//! Per-camera stream lifecycle.
//!
//! A `StreamManager` owns two workers between `start()` and `stop()`:
//!
//! - **capture**: opens the source, verifies the connection by waiting for a first
//!   frame, reports ONLINE, then reads at the target rate into a bounded queue
//!   (drop-newest when full). Consecutive read failures or a read error force a
//!   reconnect with exponential backoff; outages are reported OFFLINE. A heartbeat
//!   re-reports ONLINE while connected.
//! - **process**: dequeues frames in capture order, resolves a normalized zone
//!   against the frame size, runs the detector and tracker, fires the recognition
//!   trigger for ready tracks, renders the overlay and fans the result out to
//!   subscribers and the latest-frame slot.
//!
//! Only the subscriber map and the zone slot are shared between workers and callers;
//! both locks are held for the mutation only. The tracker belongs to the process
//! worker.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::detect::{BackendFactory, Detection, DetectionFilter, DetectorBackend};
use crate::frame::{CapturedFrame, Frame, FrameQueue, LatestSlot, DEFAULT_QUEUE_CAPACITY};
use crate::ingest::{default_source_factory, FrameSource, SourceFactory};
use crate::mask_stream_url;
use crate::overlay::{OverlayCounters, OverlayRenderer};
use crate::recognition::{Trigger, TriggerCallback};
use crate::storage::{CameraRecord, StatusSink};
use crate::track::{Track, TrackSummary};
use crate::tracker::{Tracker, TrackerConfig, TrackerStats};
use crate::zone::{ZoneError, ZoneGeometry, ZoneSpec};
use crate::CameraStatus;

/// Upper bound on any single sleep, so workers notice `stop()` promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(50);
/// Pause between verification reads while waiting for the first frame.
const VERIFY_POLL: Duration = Duration::from_millis(50);
/// Backoff exponent cap: delays stop growing after `base * 2^3`.
const MAX_BACKOFF_EXPONENT: u32 = 3;
const MIN_FPS: f32 = 0.1;

/// Reconnect delay after `failures` consecutive failed attempts:
/// `base * 2^min(failures, 3)`, saturating at `Duration::MAX`.
pub fn reconnect_backoff(base: Duration, failures: u32) -> Duration {
    base.checked_mul(2u32.pow(failures.min(MAX_BACKOFF_EXPONENT))).unwrap_or(Duration::MAX)
}

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Per-camera stream configuration. Fixed for the lifetime of a `StreamManager`;
/// only the trigger zone can be swapped live.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamConfig {
    pub camera_id: String,
    pub name: String,
    pub stream_url: String,
    /// Target capture (and processing) rate.
    pub fps: f32,
    pub trigger_zone: Option<ZoneSpec>,
    pub enabled: bool,
}

impl StreamConfig {
    pub fn new(camera_id: &str, stream_url: &str) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            name: camera_id.to_string(),
            stream_url: stream_url.to_string(),
            fps: 2.0,
            trigger_zone: None,
            enabled: true,
        }
    }

    /// Build from a stored camera record. Fails when the record has no stream URL.
    pub fn from_record(record: &CameraRecord) -> Result<Self> {
        let stream_url = record
            .stream_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| anyhow!("camera {} has no stream url", record.id))?;
        Ok(Self {
            camera_id: record.id.clone(),
            name: if record.name.is_empty() {
                record.id.clone()
            } else {
                record.name.clone()
            },
            stream_url: stream_url.to_string(),
            fps: if record.fps > 0.0 { record.fps } else { 2.0 },
            trigger_zone: record.trigger_zone.clone(),
            enabled: record.enabled,
        })
    }

    fn target_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.fps.max(MIN_FPS)))
    }
}

/// Worker tuning shared by every stream in a pool.
#[derive(Clone, Debug)]
pub struct StreamSettings {
    pub queue_capacity: usize,
    /// Time allowed for the first frame after opening a source.
    pub connect_timeout: Duration,
    /// Consecutive empty reads that force a reconnect.
    pub read_failure_limit: u32,
    /// Pause after an empty read.
    pub read_retry_delay: Duration,
    pub backoff_base: Duration,
    pub heartbeat_interval: Duration,
    /// How long `stop()` waits for each worker.
    pub join_timeout: Duration,
    /// Process worker dequeue timeout; bounds how long it takes to notice `stop()`.
    pub dequeue_timeout: Duration,
    /// Tracker tuning. `fps` is replaced by each camera's target rate.
    pub tracker: TrackerConfig,
    pub detection_filter: DetectionFilter,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            connect_timeout: Duration::from_secs(30),
            read_failure_limit: 10,
            read_retry_delay: Duration::from_millis(100),
            backoff_base: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(20),
            join_timeout: Duration::from_secs(5),
            dequeue_timeout: Duration::from_millis(250),
            tracker: TrackerConfig::default(),
            detection_filter: DetectionFilter::default(),
        }
    }
}

// ----------------------------------------------------------------------------
// Outputs
// ----------------------------------------------------------------------------

/// One processed frame as delivered to subscribers.
#[derive(Clone, Debug)]
pub struct ProcessedFrame {
    pub camera_id: String,
    /// Raw frame with the debug overlay drawn on a copy.
    pub annotated: Frame,
    pub raw: Frame,
    pub captured_at: DateTime<Utc>,
    /// Per-stream sequence number, starting at 1.
    pub sequence: u64,
    pub detections: Vec<Detection>,
    pub tracks: Vec<TrackSummary>,
    pub in_zone_count: usize,
}

/// Subscriber callback. Errors and panics are logged per subscriber.
pub type SubscriberCallback = Arc<dyn Fn(&ProcessedFrame) -> Result<()> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionId(u64);

#[derive(Clone, Debug, Serialize)]
pub struct StreamStats {
    pub camera_id: String,
    pub running: bool,
    pub fps_actual: f64,
    pub fps_target: f32,
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub frames_processed: u64,
    pub recognition_triggers: u64,
    pub reconnects: u64,
    pub subscribers: usize,
    pub trigger_zone_configured: bool,
    pub tracker: TrackerStats,
}

// ----------------------------------------------------------------------------
// Shared state
// ----------------------------------------------------------------------------

#[derive(Default)]
struct Counters {
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
    frames_processed: AtomicU64,
    triggers: AtomicU64,
    /// Verified connections after the first one.
    reconnects: AtomicU64,
    fps_bits: AtomicU64,
}

impl Counters {
    fn fps(&self) -> f64 {
        f64::from_bits(self.fps_bits.load(Ordering::Relaxed))
    }

    fn set_fps(&self, fps: f64) {
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
    }
}

/// Trigger zone as configured, plus whether it still needs resolving to pixels.
#[derive(Default)]
struct ZoneSlot {
    geometry: Option<ZoneGeometry>,
    needs_resolve: bool,
}

impl ZoneSlot {
    fn load(camera_id: &str, spec: Option<&ZoneSpec>) -> Result<Self, ZoneError> {
        let Some(spec) = spec else {
            return Ok(Self::default());
        };
        match ZoneGeometry::from_spec(spec) {
            Ok(geometry) => Ok(Self {
                needs_resolve: geometry.is_normalized(),
                geometry: Some(geometry),
            }),
            Err(e) => {
                warn!("camera {}: invalid trigger zone ({}); running without zone", camera_id, e);
                Err(e)
            }
        }
    }
}

struct Shared {
    config: StreamConfig,
    settings: StreamSettings,
    status: Arc<dyn StatusSink>,
    zone: Mutex<ZoneSlot>,
    subscribers: Mutex<BTreeMap<SubscriptionId, SubscriberCallback>>,
    next_subscription: AtomicU64,
    latest: LatestSlot<Arc<ProcessedFrame>>,
    counters: Counters,
    tracker_stats: Mutex<TrackerStats>,
}

impl Shared {
    fn report(&self, status: CameraStatus) {
        if let Err(e) = self.status.report(&self.config.camera_id, status, Utc::now()) {
            warn!(
                "camera {}: status report {} failed: {:#}",
                self.config.camera_id, status, e
            );
        }
    }

    fn zone(&self) -> MutexGuard<'_, ZoneSlot> {
        self.zone.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Zone for a frame of `width` x `height`, resolving a normalized zone on first use.
    fn zone_for_frame(&self, width: u32, height: u32) -> Option<ZoneGeometry> {
        let mut slot = self.zone();
        if slot.needs_resolve {
            if let Some(geometry) = slot.geometry.take() {
                let resolved = geometry.rescale_to_pixels(width, height);
                info!(
                    "camera {}: trigger zone resolved to {}x{} pixels",
                    self.config.camera_id, width, height
                );
                slot.geometry = Some(resolved);
            }
            slot.needs_resolve = false;
        }
        slot.geometry.clone()
    }

    fn subscribers(&self) -> MutexGuard<'_, BTreeMap<SubscriptionId, SubscriberCallback>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn broadcast(&self, frame: &ProcessedFrame) {
        let subscribers: Vec<(SubscriptionId, SubscriberCallback)> = self
            .subscribers()
            .iter()
            .map(|(id, cb)| (*id, cb.clone()))
            .collect();
        for (id, callback) in subscribers {
            match catch_unwind(AssertUnwindSafe(|| callback(frame))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    "camera {}: subscriber {:?} failed: {:#}",
                    self.config.camera_id, id, e
                ),
                Err(_) => error!(
                    "camera {}: subscriber {:?} panicked",
                    self.config.camera_id, id
                ),
            }
        }
    }
}

/// Sleep for `total`, waking early once `running` is cleared.
fn sleep_while_running(running: &AtomicBool, total: Duration) {
    let started = Instant::now();
    while running.load(Ordering::SeqCst) {
        let elapsed = started.elapsed();
        if elapsed >= total {
            break;
        }
        std::thread::sleep((total - elapsed).min(SLEEP_SLICE));
    }
}

// ----------------------------------------------------------------------------
// StreamManager
// ----------------------------------------------------------------------------

struct Workers {
    running: Arc<AtomicBool>,
    capture: JoinHandle<()>,
    process: JoinHandle<()>,
}

pub struct StreamManager {
    shared: Arc<Shared>,
    source_factory: SourceFactory,
    detector_factory: BackendFactory,
    trigger: Option<TriggerCallback>,
    overlay: OverlayRenderer,
    workers: Mutex<Option<Workers>>,
}

impl StreamManager {
    /// Build a stopped manager. An invalid trigger zone is logged and the stream
    /// runs without zone logic until a valid one is reloaded.
    pub fn new(
        config: StreamConfig,
        settings: StreamSettings,
        status: Arc<dyn StatusSink>,
        detector_factory: BackendFactory,
    ) -> Self {
        let zone = ZoneSlot::load(&config.camera_id, config.trigger_zone.as_ref()).unwrap_or_default();
        Self {
            shared: Arc::new(Shared {
                config,
                settings,
                status,
                zone: Mutex::new(zone),
                subscribers: Mutex::new(BTreeMap::new()),
                next_subscription: AtomicU64::new(1),
                latest: LatestSlot::new(),
                counters: Counters::default(),
                tracker_stats: Mutex::new(TrackerStats::default()),
            }),
            source_factory: default_source_factory(),
            detector_factory,
            trigger: None,
            overlay: OverlayRenderer::new(),
            workers: Mutex::new(None),
        }
    }

    pub fn with_source_factory(mut self, factory: SourceFactory) -> Self {
        self.source_factory = factory;
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerCallback) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_overlay(mut self, overlay: OverlayRenderer) -> Self {
        self.overlay = overlay;
        self
    }

    pub fn config(&self) -> &StreamConfig {
        &self.shared.config
    }

    pub fn camera_id(&self) -> &str {
        &self.shared.config.camera_id
    }

    fn workers(&self) -> MutexGuard<'_, Option<Workers>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.workers().is_some()
    }

    /// Spawn the capture and process workers. Starting a running stream is a no-op.
    ///
    /// The detector is built and warmed up before the worker slot is locked, so
    /// `is_running`, `stats` and `stop` stay responsive during a slow start.
    pub fn start(&self) -> Result<()> {
        if self.is_running() {
            warn!("camera {} already running", self.camera_id());
            return Ok(());
        }

        let mut detector = (self.detector_factory)()
            .with_context(|| format!("create detector for camera {}", self.camera_id()))?;
        if let Err(e) = detector.warm_up() {
            warn!(
                "camera {}: detector {} warm-up failed: {:#}",
                self.camera_id(),
                detector.name(),
                e
            );
        }

        let mut workers = self.workers();
        if workers.is_some() {
            warn!("camera {} already running", self.camera_id());
            return Ok(());
        }

        let running = Arc::new(AtomicBool::new(true));
        let queue = Arc::new(FrameQueue::new(self.shared.settings.queue_capacity));

        let capture = CaptureWorker {
            shared: self.shared.clone(),
            running: running.clone(),
            queue: queue.clone(),
            factory: self.source_factory.clone(),
            source: None,
            epoch: 0,
            failed_attempts: 0,
        };
        let capture = std::thread::Builder::new()
            .name(format!("capture-{}", self.camera_id()))
            .spawn(move || capture.run())
            .context("spawn capture worker")?;

        let process = ProcessWorker::new(
            self.shared.clone(),
            running.clone(),
            queue,
            detector,
            self.trigger.clone(),
            self.overlay.clone(),
        );
        let process = match std::thread::Builder::new()
            .name(format!("process-{}", self.camera_id()))
            .spawn(move || process.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                running.store(false, Ordering::SeqCst);
                join_with_timeout(self.camera_id(), "capture", capture, self.shared.settings.join_timeout);
                return Err(anyhow!("spawn process worker: {}", e));
            }
        };

        *workers = Some(Workers {
            running,
            capture,
            process,
        });
        info!(
            "camera {} started ({})",
            self.camera_id(),
            mask_stream_url(&self.shared.config.stream_url)
        );
        Ok(())
    }

    /// Signal both workers, wait up to the join timeout for each and report OFFLINE.
    /// Workers that do not finish in time are abandoned. Stopping a stopped stream
    /// is a no-op.
    pub fn stop(&self) {
        let Some(workers) = self.workers().take() else {
            return;
        };
        info!("stopping camera {}", self.camera_id());
        workers.running.store(false, Ordering::SeqCst);

        let timeout = self.shared.settings.join_timeout;
        join_with_timeout(self.camera_id(), "capture", workers.capture, timeout);
        join_with_timeout(self.camera_id(), "process", workers.process, timeout);

        self.shared.report(CameraStatus::Offline);
        info!("camera {} stopped", self.camera_id());
    }

    /// Register a frame subscriber.
    pub fn subscribe(&self, callback: SubscriberCallback) -> SubscriptionId {
        let id = SubscriptionId(self.shared.next_subscription.fetch_add(1, Ordering::Relaxed));
        let mut subscribers = self.shared.subscribers();
        subscribers.insert(id, callback);
        info!(
            "camera {}: subscriber added, total {}",
            self.camera_id(),
            subscribers.len()
        );
        id
    }

    /// Remove a subscriber. Returns false for unknown ids.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.shared.subscribers();
        let removed = subscribers.remove(&id).is_some();
        if removed {
            info!(
                "camera {}: subscriber removed, total {}",
                self.camera_id(),
                subscribers.len()
            );
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers().len()
    }

    /// Most recent processed frame, if any has been produced.
    pub fn latest_frame(&self) -> Option<Arc<ProcessedFrame>> {
        self.shared.latest.latest()
    }

    /// Swap the trigger zone without restarting. A normalized zone is resolved on
    /// the next processed frame. On error the stream continues without a zone.
    pub fn reload_trigger_zone(&self, spec: Option<&ZoneSpec>) -> Result<(), ZoneError> {
        let loaded = ZoneSlot::load(self.camera_id(), spec);
        let mut slot = self.shared.zone();
        match loaded {
            Ok(next) => {
                *slot = next;
                info!(
                    "camera {}: trigger zone {}",
                    self.camera_id(),
                    if slot.geometry.is_some() { "reloaded" } else { "cleared" }
                );
                Ok(())
            }
            Err(e) => {
                *slot = ZoneSlot::default();
                Err(e)
            }
        }
    }

    /// Current trigger zone; in pixel space once a frame has been processed.
    pub fn current_zone(&self) -> Option<ZoneGeometry> {
        self.shared.zone().geometry.clone()
    }

    pub fn stats(&self) -> StreamStats {
        let counters = &self.shared.counters;
        StreamStats {
            camera_id: self.shared.config.camera_id.clone(),
            running: self.is_running(),
            fps_actual: counters.fps(),
            fps_target: self.shared.config.fps,
            frames_captured: counters.frames_captured.load(Ordering::Relaxed),
            frames_dropped: counters.frames_dropped.load(Ordering::Relaxed),
            frames_processed: counters.frames_processed.load(Ordering::Relaxed),
            recognition_triggers: counters.triggers.load(Ordering::Relaxed),
            reconnects: counters.reconnects.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
            trigger_zone_configured: self.shared.zone().geometry.is_some(),
            tracker: self
                .shared
                .tracker_stats
                .lock()
                .map(|s| s.clone())
                .unwrap_or_default(),
        }
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_with_timeout(camera_id: &str, role: &str, handle: JoinHandle<()>, timeout: Duration) {
    let started = Instant::now();
    while !handle.is_finished() {
        if started.elapsed() >= timeout {
            warn!(
                "camera {}: {} worker did not stop within {:?}; abandoning it",
                camera_id, role, timeout
            );
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    if handle.join().is_err() {
        error!("camera {}: {} worker panicked", camera_id, role);
    }
}

// ----------------------------------------------------------------------------
// Capture worker
// ----------------------------------------------------------------------------

struct CaptureWorker {
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    queue: Arc<FrameQueue<CapturedFrame>>,
    factory: SourceFactory,
    source: Option<Box<dyn FrameSource>>,
    /// Verified connections so far.
    epoch: u64,
    /// Consecutive connection attempts that did not end in a verified connection.
    failed_attempts: u32,
}

impl CaptureWorker {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn camera_id(&self) -> &str {
        &self.shared.config.camera_id
    }

    fn run(mut self) {
        info!("camera {}: capture worker started", self.camera_id());
        while self.is_running() {
            let outcome = match self.connect() {
                Ok(true) => {
                    self.failed_attempts = 0;
                    self.stream_frames()
                }
                Ok(false) => Ok(()),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => break,
                Err(e) => {
                    error!("camera {}: capture error: {:#}", self.camera_id(), e);
                    self.shared.report(CameraStatus::Offline);
                    self.release_source();
                }
            }

            if !self.is_running() {
                break;
            }
            let delay = reconnect_backoff(self.shared.settings.backoff_base, self.failed_attempts);
            info!(
                "camera {}: reconnecting in {:.1}s (attempt {})",
                self.camera_id(),
                delay.as_secs_f64(),
                self.failed_attempts + 1
            );
            self.failed_attempts = self.failed_attempts.saturating_add(1);
            sleep_while_running(&self.running, delay);
        }
        self.release_source();
        info!("camera {}: capture worker stopped", self.camera_id());
    }

    /// Open the source and wait for a first frame. `Ok(false)` when stopped meanwhile.
    fn connect(&mut self) -> Result<bool> {
        let url = mask_stream_url(&self.shared.config.stream_url);
        info!("camera {}: connecting to {}", self.camera_id(), url);

        let mut source = (self.factory)(&self.shared.config.stream_url)?;
        let opened = source.open();
        self.source = Some(source);
        opened.with_context(|| format!("open {}", url))?;

        let timeout = self.shared.settings.connect_timeout;
        let started = Instant::now();
        while self.is_running() {
            if started.elapsed() >= timeout {
                return Err(anyhow!(
                    "no frame from {} within {:.0}s",
                    url,
                    timeout.as_secs_f64()
                ));
            }
            let source = self
                .source
                .as_mut()
                .ok_or_else(|| anyhow!("stream handle missing"))?;
            match source.read() {
                Ok(Some(first)) => {
                    self.epoch += 1;
                    if self.epoch > 1 {
                        self.shared.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                    }
                    info!(
                        "camera {}: connected ({}x{}, first frame in {:.1}s)",
                        self.camera_id(),
                        first.width(),
                        first.height(),
                        started.elapsed().as_secs_f64()
                    );
                    self.shared.report(CameraStatus::Online);
                    return Ok(true);
                }
                Ok(None) => {}
                Err(e) => debug!("camera {}: verification read failed: {:#}", self.camera_id(), e),
            }
            std::thread::sleep(VERIFY_POLL);
        }
        Ok(false)
    }

    /// Read at the target rate until stopped (`Ok`) or the connection is lost (`Err`).
    fn stream_frames(&mut self) -> Result<()> {
        let interval = self.shared.config.target_interval();
        let limit = self.shared.settings.read_failure_limit.max(1);
        let mut consecutive_failures = 0u32;
        let mut last_capture: Option<Instant> = None;
        let mut last_heartbeat = Instant::now();

        while self.is_running() {
            if let Some(last) = last_capture {
                let elapsed = last.elapsed();
                if elapsed < interval {
                    std::thread::sleep((interval - elapsed).min(SLEEP_SLICE));
                    continue;
                }
            }

            let source = self
                .source
                .as_mut()
                .ok_or_else(|| anyhow!("stream handle missing"))?;
            let image = match source.read().context("read frame")? {
                Some(image) => image,
                None => {
                    consecutive_failures += 1;
                    warn!(
                        "camera {}: failed to read frame ({} consecutive)",
                        self.camera_id(),
                        consecutive_failures
                    );
                    if consecutive_failures >= limit {
                        return Err(anyhow!(
                            "stream lost after {} consecutive failed reads",
                            consecutive_failures
                        ));
                    }
                    sleep_while_running(&self.running, self.shared.settings.read_retry_delay);
                    continue;
                }
            };
            consecutive_failures = 0;
            last_capture = Some(Instant::now());
            self.shared.counters.frames_captured.fetch_add(1, Ordering::Relaxed);

            if last_heartbeat.elapsed() >= self.shared.settings.heartbeat_interval {
                self.shared.report(CameraStatus::Online);
                last_heartbeat = Instant::now();
            }

            let captured = CapturedFrame {
                frame: Frame::new(image),
                captured_at: Utc::now(),
                epoch: self.epoch,
            };
            if !self.queue.push(captured) {
                self.shared.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                debug!("camera {}: frame queue full, frame skipped", self.camera_id());
            }
        }
        Ok(())
    }

    fn release_source(&mut self) {
        if let Some(mut source) = self.source.take() {
            if let Err(e) = source.release() {
                warn!("camera {}: {}", self.camera_id(), e);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Process worker
// ----------------------------------------------------------------------------

struct ProcessWorker {
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    queue: Arc<FrameQueue<CapturedFrame>>,
    detector: Box<dyn DetectorBackend>,
    trigger: Option<TriggerCallback>,
    overlay: OverlayRenderer,
    tracker: Tracker,
    epoch: u64,
    sequence: u64,
    fps_window_start: Instant,
    fps_window_frames: u32,
}

impl ProcessWorker {
    fn new(
        shared: Arc<Shared>,
        running: Arc<AtomicBool>,
        queue: Arc<FrameQueue<CapturedFrame>>,
        detector: Box<dyn DetectorBackend>,
        trigger: Option<TriggerCallback>,
        overlay: OverlayRenderer,
    ) -> Self {
        let mut tracker_config = shared.settings.tracker.clone();
        tracker_config.fps = f64::from(shared.config.fps.max(MIN_FPS));
        Self {
            shared,
            running,
            queue,
            detector,
            trigger,
            overlay,
            tracker: Tracker::new(tracker_config),
            epoch: 0,
            sequence: 0,
            fps_window_start: Instant::now(),
            fps_window_frames: 0,
        }
    }

    fn camera_id(&self) -> &str {
        &self.shared.config.camera_id
    }

    fn run(mut self) {
        info!(
            "camera {}: process worker started (detector {})",
            self.camera_id(),
            self.detector.name()
        );
        let timeout = self.shared.settings.dequeue_timeout;
        while self.running.load(Ordering::SeqCst) {
            if let Some(captured) = self.queue.pop_timeout(timeout) {
                self.process(captured);
            }
        }
        info!("camera {}: process worker stopped", self.camera_id());
    }

    fn process(&mut self, captured: CapturedFrame) {
        if captured.epoch != self.epoch {
            if self.epoch != 0 {
                info!(
                    "camera {}: stream reconnected, tracking restarts",
                    self.camera_id()
                );
                self.tracker.reset();
            }
            self.epoch = captured.epoch;
        }
        self.sequence += 1;

        let frame = captured.frame;
        let zone = self.shared.zone_for_frame(frame.width(), frame.height());
        self.tick_fps();

        let detections = match self.detector.detect(frame.image()) {
            Ok(detections) => self.shared.settings.detection_filter.apply(detections),
            Err(e) => {
                warn!(
                    "camera {}: detector {} failed: {:#}",
                    self.camera_id(),
                    self.detector.name(),
                    e
                );
                Vec::new()
            }
        };

        self.tracker.update(&detections, &frame, zone.as_ref());
        for track in self.tracker.take_ready() {
            self.fire_trigger(track);
        }

        let tracks = self.tracker.snapshot();
        let in_zone_count = self.tracker.in_zone_count();
        let counters = OverlayCounters {
            fps: self.shared.counters.fps(),
            vehicles: tracks.len(),
            in_zone: in_zone_count,
            triggers: self.shared.counters.triggers.load(Ordering::Relaxed),
        };
        let annotated = Frame::new(self.overlay.render(&frame, zone.as_ref(), &tracks, &counters));

        let processed = Arc::new(ProcessedFrame {
            camera_id: self.shared.config.camera_id.clone(),
            annotated,
            raw: frame,
            captured_at: captured.captured_at,
            sequence: self.sequence,
            detections,
            tracks,
            in_zone_count,
        });
        self.shared.broadcast(&processed);
        self.shared.latest.publish(processed);

        self.shared.counters.frames_processed.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut stats) = self.shared.tracker_stats.lock() {
            *stats = self.tracker.stats();
        }
    }

    fn tick_fps(&mut self) {
        self.fps_window_frames += 1;
        let elapsed = self.fps_window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            self.shared
                .counters
                .set_fps(f64::from(self.fps_window_frames) / elapsed.as_secs_f64());
            self.fps_window_frames = 0;
            self.fps_window_start = Instant::now();
        }
    }

    fn fire_trigger(&self, mut track: Track) {
        let Some(shot) = track.get_best_shot() else {
            warn!(
                "camera {}: track {} ready without history, skipped",
                self.camera_id(),
                track.track_id
            );
            return;
        };
        self.shared.counters.triggers.fetch_add(1, Ordering::Relaxed);
        info!(
            "camera {}: track {} triggered (best shot score {:.3})",
            self.camera_id(),
            track.track_id,
            shot.score
        );

        let Some(callback) = &self.trigger else {
            return;
        };
        let track_id = track.track_id;
        let trigger = Trigger {
            camera_id: self.shared.config.camera_id.clone(),
            track,
            frame: shot.frame,
            bbox: shot.bbox,
            score: shot.score,
            captured_at: Utc::now(),
        };
        match catch_unwind(AssertUnwindSafe(|| callback(&trigger))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(
                "camera {}: recognition trigger for track {} failed: {:#}",
                self.camera_id(),
                track_id,
                e
            ),
            Err(_) => error!(
                "camera {}: recognition trigger for track {} panicked",
                self.camera_id(),
                track_id
            ),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
