//! Registry of running camera streams.
//!
//! A `Pool` is constructed once by the process entry point and passed to whoever
//! needs it. Starting a camera loads its record from the `CameraStore`, builds a
//! `StreamManager` whose recognition trigger goes through the pool's
//! `CaptureHandoff`, and registers it under the camera id.

use log::{error, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use crate::detect::BackendFactory;
use crate::ingest::{default_source_factory, SourceFactory};
use crate::overlay::OverlayRenderer;
use crate::recognition::CaptureHandoff;
use crate::storage::{CameraStore, StatusSink};
use crate::stream::{
    ProcessedFrame, StreamConfig, StreamManager, StreamSettings, StreamStats, SubscriberCallback,
    SubscriptionId,
};
use crate::zone::ZoneError;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("camera {0} not found")]
    NotFound(String),
    #[error("camera {0} is disabled")]
    Disabled(String),
    #[error("camera {0} has no stream url")]
    MissingStreamUrl(String),
    #[error("camera store: {0:#}")]
    Store(anyhow::Error),
    #[error("stream: {0:#}")]
    Stream(anyhow::Error),
    #[error(transparent)]
    Zone(#[from] ZoneError),
}

pub struct Pool {
    cameras: Arc<dyn CameraStore>,
    status: Arc<dyn StatusSink>,
    handoff: CaptureHandoff,
    detector: BackendFactory,
    settings: StreamSettings,
    source_factory: SourceFactory,
    overlay: OverlayRenderer,
    registry: Mutex<Registry>,
}

/// Running streams plus the ids whose start is in flight. The lock is never held
/// across store access or stream start-up.
#[derive(Default)]
struct Registry {
    streams: BTreeMap<String, Arc<StreamManager>>,
    starting: BTreeSet<String>,
}

impl Pool {
    pub fn new(
        cameras: Arc<dyn CameraStore>,
        status: Arc<dyn StatusSink>,
        handoff: CaptureHandoff,
        detector: BackendFactory,
    ) -> Self {
        Self {
            cameras,
            status,
            handoff,
            detector,
            settings: StreamSettings::default(),
            source_factory: default_source_factory(),
            overlay: OverlayRenderer::new(),
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn with_settings(mut self, settings: StreamSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_source_factory(mut self, factory: SourceFactory) -> Self {
        self.source_factory = factory;
        self
    }

    pub fn with_overlay(mut self, overlay: OverlayRenderer) -> Self {
        self.overlay = overlay;
        self
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a camera. Already running, or already being started by another
    /// caller, is success.
    pub fn try_start(&self, camera_id: &str) -> Result<(), PoolError> {
        {
            let mut registry = self.registry();
            if registry.streams.contains_key(camera_id) {
                warn!("camera {} already running", camera_id);
                return Ok(());
            }
            if !registry.starting.insert(camera_id.to_string()) {
                warn!("camera {} is already starting", camera_id);
                return Ok(());
            }
        }

        let launched = self.launch(camera_id);
        let mut registry = self.registry();
        registry.starting.remove(camera_id);
        let manager = launched?;
        registry.streams.insert(camera_id.to_string(), manager);
        info!("camera {} started successfully", camera_id);
        Ok(())
    }

    /// Load the record, build the stream and start its workers.
    fn launch(&self, camera_id: &str) -> Result<Arc<StreamManager>, PoolError> {
        let record = self
            .cameras
            .get_camera(camera_id)
            .map_err(PoolError::Store)?
            .ok_or_else(|| PoolError::NotFound(camera_id.to_string()))?;
        if !record.enabled {
            return Err(PoolError::Disabled(camera_id.to_string()));
        }
        let config = StreamConfig::from_record(&record)
            .map_err(|_| PoolError::MissingStreamUrl(camera_id.to_string()))?;

        let manager = StreamManager::new(
            config,
            self.settings.clone(),
            self.status.clone(),
            self.detector.clone(),
        )
        .with_source_factory(self.source_factory.clone())
        .with_overlay(self.overlay.clone())
        .with_trigger(self.handoff.clone().into_callback());
        manager.start().map_err(PoolError::Stream)?;
        Ok(Arc::new(manager))
    }

    /// `try_start`, logging the failure.
    pub fn start(&self, camera_id: &str) -> bool {
        match self.try_start(camera_id) {
            Ok(()) => true,
            Err(e) => {
                error!("failed to start camera {}: {}", camera_id, e);
                false
            }
        }
    }

    /// Stop and deregister. Returns false when the camera was not running.
    pub fn stop(&self, camera_id: &str) -> bool {
        let removed = self.registry().streams.remove(camera_id);
        match removed {
            Some(manager) => {
                manager.stop();
                info!("camera {} stopped", camera_id);
                true
            }
            None => {
                warn!("camera {} not running", camera_id);
                false
            }
        }
    }

    /// Stop then start, picking up any configuration change.
    pub fn restart(&self, camera_id: &str) -> bool {
        self.stop(camera_id);
        self.start(camera_id)
    }

    /// Hot-reload the stored trigger zone into a running stream.
    /// Returns `Ok(false)` when the camera is not running.
    pub fn reload_trigger_zone(&self, camera_id: &str) -> Result<bool, PoolError> {
        let Some(manager) = self.get(camera_id) else {
            return Ok(false);
        };
        let record = self
            .cameras
            .get_camera(camera_id)
            .map_err(PoolError::Store)?
            .ok_or_else(|| PoolError::NotFound(camera_id.to_string()))?;
        manager.reload_trigger_zone(record.trigger_zone.as_ref())?;
        info!("reloaded trigger zone for {}", camera_id);
        Ok(true)
    }

    /// Ids of running cameras, sorted.
    pub fn list(&self) -> Vec<String> {
        self.registry().streams.keys().cloned().collect()
    }

    pub fn get(&self, camera_id: &str) -> Option<Arc<StreamManager>> {
        self.registry().streams.get(camera_id).cloned()
    }

    pub fn is_running(&self, camera_id: &str) -> bool {
        self.registry().streams.contains_key(camera_id)
    }

    pub fn get_latest_frame(&self, camera_id: &str) -> Option<Arc<ProcessedFrame>> {
        self.get(camera_id)?.latest_frame()
    }

    pub fn subscribe(&self, camera_id: &str, callback: SubscriberCallback) -> Option<SubscriptionId> {
        Some(self.get(camera_id)?.subscribe(callback))
    }

    pub fn unsubscribe(&self, camera_id: &str, id: SubscriptionId) -> bool {
        self.get(camera_id).map_or(false, |m| m.unsubscribe(id))
    }

    pub fn get_stats(&self, camera_id: &str) -> Option<StreamStats> {
        self.get(camera_id).map(|m| m.stats())
    }

    pub fn get_all_stats(&self) -> BTreeMap<String, StreamStats> {
        let managers: Vec<(String, Arc<StreamManager>)> = self
            .registry()
            .streams
            .iter()
            .map(|(id, m)| (id.clone(), m.clone()))
            .collect();
        managers
            .into_iter()
            .map(|(id, m)| (id, m.stats()))
            .collect()
    }

    /// Start every enabled camera in the store. Returns how many are running afterwards.
    pub fn start_all_enabled(&self) -> Result<usize, PoolError> {
        let cameras = self.cameras.list_cameras().map_err(PoolError::Store)?;
        for camera in cameras.iter().filter(|c| c.enabled) {
            self.start(&camera.id);
        }
        Ok(self.registry().streams.len())
    }

    pub fn stop_all(&self) {
        let drained: Vec<(String, Arc<StreamManager>)> =
            std::mem::take(&mut self.registry().streams).into_iter().collect();
        for (camera_id, manager) in drained {
            manager.stop();
            info!("camera {} stopped", camera_id);
        }
        info!("all cameras stopped");
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.stop_all();
    }
}
