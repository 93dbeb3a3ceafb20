//! Per-vehicle track record.
//!
//! A `Track` keeps a bounded window of recent observations (box, frame, confidence)
//! plus the zone dwell counters and timestamps the tracker's state machine runs on.
//! Tracks are owned by a `Tracker`; everything handed outside is a clone or a
//! `TrackSummary` snapshot.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crate::frame::Frame;
use crate::zone::{BBox, Point};

/// Default number of observations retained per track.
pub const DEFAULT_HISTORY_LEN: usize = 30;

const AREA_WEIGHT: f64 = 0.5;
const CONFIDENCE_WEIGHT: f64 = 0.3;
const CENTERING_WEIGHT: f64 = 0.2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackState {
    /// Seen, but not in the trigger zone.
    #[default]
    Idle,
    /// In the zone for fewer than the required consecutive frames.
    EnteringZone,
    /// Dwelling in the zone.
    InZone,
    /// Best shot handed off; waiting for a recognition result.
    Processing,
    /// Recognition result attached.
    Processed,
    /// Kept so stored and serialized states stay readable as `EXITING_ZONE`. No
    /// tracker transition produces it.
    ExitingZone,
    /// Done; removed after the grace period.
    Exited,
}

impl TrackState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackState::Idle => "IDLE",
            TrackState::EnteringZone => "ENTERING_ZONE",
            TrackState::InZone => "IN_ZONE",
            TrackState::Processing => "PROCESSING",
            TrackState::Processed => "PROCESSED",
            TrackState::ExitingZone => "EXITING_ZONE",
            TrackState::Exited => "EXITED",
        }
    }

    /// Entering or dwelling; drives the "in zone" counters and zone colouring.
    pub fn is_zone_occupant(&self) -> bool {
        matches!(self, TrackState::EnteringZone | TrackState::InZone)
    }
}

impl fmt::Display for TrackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame selected for recognition, with the box it was scored on.
#[derive(Clone, Debug)]
pub struct BestShot {
    pub frame: Frame,
    pub bbox: BBox,
    pub score: f64,
}

#[derive(Clone, Debug)]
pub struct Track {
    pub track_id: u64,
    pub state: TrackState,
    pub frames_in_zone: u32,
    pub frames_out_of_zone: u32,
    pub born_in_zone: bool,
    /// Bottom-center of the previous observation; used for the line-crossing fallback.
    pub prev_bottom_center: Option<Point>,
    /// One-way gate: set when the track is handed off, never cleared.
    pub processing_started: bool,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub zone_entry_time: Option<Instant>,
    pub zone_exit_time: Option<Instant>,
    /// Recognition result attached after hand-off (informational).
    pub result: Option<serde_json::Value>,
    history_len: usize,
    bbox_history: VecDeque<BBox>,
    frame_history: VecDeque<Frame>,
    confidence_history: VecDeque<f32>,
    best_shot: Option<BestShot>,
}

impl Track {
    pub fn new(track_id: u64, history_len: usize, now: Instant) -> Self {
        let history_len = history_len.max(1);
        Self {
            track_id,
            state: TrackState::Idle,
            frames_in_zone: 0,
            frames_out_of_zone: 0,
            born_in_zone: false,
            prev_bottom_center: None,
            processing_started: false,
            first_seen: now,
            last_seen: now,
            zone_entry_time: None,
            zone_exit_time: None,
            result: None,
            history_len,
            bbox_history: VecDeque::with_capacity(history_len),
            frame_history: VecDeque::with_capacity(history_len),
            confidence_history: VecDeque::with_capacity(history_len),
            best_shot: None,
        }
    }

    /// Record a matched observation.
    pub fn update(&mut self, bbox: BBox, frame: Frame, confidence: f32, now: Instant) {
        if let Some(prev) = self.bbox_history.back() {
            self.prev_bottom_center = Some(prev.bottom_center());
        }
        if self.bbox_history.len() == self.history_len {
            self.bbox_history.pop_front();
            self.frame_history.pop_front();
            self.confidence_history.pop_front();
        }
        self.bbox_history.push_back(bbox);
        self.frame_history.push_back(frame);
        self.confidence_history.push_back(confidence);
        self.last_seen = now;
    }

    pub fn current_bbox(&self) -> Option<&BBox> {
        self.bbox_history.back()
    }

    pub fn current_confidence(&self) -> Option<f32> {
        self.confidence_history.back().copied()
    }

    pub fn history_len(&self) -> usize {
        self.bbox_history.len()
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.first_seen)
    }

    pub fn time_since_last_seen(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }

    /// Time spent between zone entry and exit, when both are known.
    pub fn dwell_time(&self) -> Option<Duration> {
        match (self.zone_entry_time, self.zone_exit_time) {
            (Some(entry), Some(exit)) => Some(exit.saturating_duration_since(entry)),
            _ => None,
        }
    }

    /// Pick the retained observation with the highest composite score
    /// (normalized area, detector confidence, closeness to frame center).
    ///
    /// Returns `None` for an empty history. The winner is cached on the track.
    pub fn get_best_shot(&mut self) -> Option<BestShot> {
        let first = self.frame_history.front()?;
        let (w, h) = (f64::from(first.width()), f64::from(first.height()));
        let frame_area = (w * h).max(1.0);
        let frame_center = Point::new(w / 2.0, h / 2.0);
        let max_dist = (w * w + h * h).sqrt().max(1.0);

        let score_at = |bbox: &BBox, conf: f32| {
            let area_score = bbox.area() / frame_area;
            let center_score = 1.0 - bbox.center().distance(&frame_center) / max_dist;
            AREA_WEIGHT * area_score
                + CONFIDENCE_WEIGHT * f64::from(conf)
                + CENTERING_WEIGHT * center_score
        };

        let mut best: Option<(usize, f64)> = None;
        for (idx, (bbox, conf)) in self
            .bbox_history
            .iter()
            .zip(self.confidence_history.iter())
            .enumerate()
        {
            let score = score_at(bbox, *conf);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((idx, score));
            }
        }

        let (idx, score) = best?;
        let shot = BestShot {
            frame: self.frame_history.get(idx)?.clone(),
            bbox: *self.bbox_history.get(idx)?,
            score,
        };
        self.best_shot = Some(shot.clone());
        Some(shot)
    }

    /// Last result of `get_best_shot`, if it has been computed.
    pub fn cached_best_shot(&self) -> Option<&BestShot> {
        self.best_shot.as_ref()
    }

    pub fn summary(&self) -> TrackSummary {
        TrackSummary {
            track_id: self.track_id,
            state: self.state,
            bbox: self.current_bbox().copied(),
            confidence: self.current_confidence(),
            frames_in_zone: self.frames_in_zone,
            frames_out_of_zone: self.frames_out_of_zone,
            born_in_zone: self.born_in_zone,
            processing_started: self.processing_started,
        }
    }
}

/// Lightweight, frame-free view of a track for overlays and subscribers.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrackSummary {
    pub track_id: u64,
    pub state: TrackState,
    pub bbox: Option<BBox>,
    pub confidence: Option<f32>,
    pub frames_in_zone: u32,
    pub frames_out_of_zone: u32,
    pub born_in_zone: bool,
    pub processing_started: bool,
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
