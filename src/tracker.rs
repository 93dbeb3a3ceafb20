//! Centroid tracker with a zone dwell-time state machine.
//!
//! Per update:
//! 1. Greedy global-minimum centroid matching of detections to live tracks.
//! 2. Unmatched tracks take the disappearance path (out-of-zone counter, forced hand-off).
//! 3. Matched tracks run the zone state machine (with the line-crossing fallback).
//! 4. Unmatched detections become new tracks; a track born inside the zone starts IN_ZONE.
//! 5. Cleanup removes long-gone tracks (capturing IN_ZONE ones first) and finished ones
//!    after a grace period.
//!
//! Every hand-off passes through the track's one-way `processing_started` gate, so a track
//! is handed off at most once. Handed-off tracks are collected into a ready set that is
//! reset at the start of every update.

use log::{debug, info};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::detect::Detection;
use crate::frame::Frame;
use crate::track::{Track, TrackState, TrackSummary, DEFAULT_HISTORY_LEN};
use crate::zone::ZoneGeometry;

/// Lower bound applied to the configured frame rate before dividing by it.
const MIN_FPS: f64 = 0.1;

static NEXT_TRACK_ID: AtomicU64 = AtomicU64::new(1);

fn next_track_id() -> u64 {
    NEXT_TRACK_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrackerConfig {
    /// Frames a track may go unseen before removal (converted to seconds with `fps`).
    pub max_disappeared_frames: u32,
    /// Maximum centroid distance (pixels) for a detection to match a track.
    pub max_distance: f64,
    /// Consecutive in-zone frames required to confirm entry.
    pub min_frames_in_zone: u32,
    /// Consecutive out-of-zone (or missing) frames that end a dwell.
    pub min_frames_out_of_zone: u32,
    /// Processing rate the frame counts above are measured at.
    pub fps: f64,
    /// How long finished tracks linger after leaving the zone.
    pub processed_grace: Duration,
    pub history_len: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_disappeared_frames: 30,
            max_distance: 100.0,
            min_frames_in_zone: 3,
            min_frames_out_of_zone: 5,
            fps: 2.0,
            processed_grace: Duration::from_secs(5),
            history_len: DEFAULT_HISTORY_LEN,
        }
    }
}

impl TrackerConfig {
    /// Wall-clock disappearance timeout: `max_disappeared_frames / fps`.
    pub fn disappearance_timeout(&self) -> Duration {
        Duration::from_secs_f64(f64::from(self.max_disappeared_frames) / self.fps.max(MIN_FPS))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub total_vehicles: u64,
    pub born_in_zone: u64,
    pub entered_zone: u64,
    pub captured: u64,
    pub active_tracks: usize,
    pub in_zone: usize,
    pub processing: usize,
}

#[derive(Clone, Copy, Debug, Default)]
struct Totals {
    total_vehicles: u64,
    born_in_zone: u64,
    entered_zone: u64,
    captured: u64,
}

pub struct Tracker {
    config: TrackerConfig,
    tracks: BTreeMap<u64, Track>,
    ready: Vec<Track>,
    totals: Totals,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: BTreeMap::new(),
            ready: Vec::new(),
            totals: Totals::default(),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn update(&mut self, detections: &[Detection], frame: &Frame, zone: Option<&ZoneGeometry>) {
        self.update_at(detections, frame, zone, Instant::now());
    }

    /// `update` with an explicit clock, so dwell and cleanup timing can be driven directly.
    pub fn update_at(
        &mut self,
        detections: &[Detection],
        frame: &Frame,
        zone: Option<&ZoneGeometry>,
        now: Instant,
    ) {
        self.ready.clear();

        let (matches, unmatched_tracks, unmatched_detections) = self.match_detections(detections);

        for (track_id, det_idx) in &matches {
            if let Some(track) = self.tracks.get_mut(track_id) {
                let det = &detections[*det_idx];
                track.update(det.bbox, frame.clone(), det.confidence, now);
            }
        }

        for track_id in &unmatched_tracks {
            if let Some(track) = self.tracks.get_mut(track_id) {
                track.frames_out_of_zone += 1;
                if track.state == TrackState::InZone
                    && track.frames_out_of_zone >= self.config.min_frames_out_of_zone
                {
                    hand_off(track, now, &mut self.ready, &mut self.totals, "no detection");
                }
            }
        }

        if let Some(zone) = zone {
            for (track_id, _) in &matches {
                if let Some(track) = self.tracks.get_mut(track_id) {
                    step_zone_state(track, zone, &self.config, now, &mut self.ready, &mut self.totals);
                }
            }
        }

        for track in self.tracks.values_mut() {
            match track.state {
                TrackState::Processing if track.result.is_some() => {
                    track.state = TrackState::Processed;
                }
                TrackState::Processed => track.state = TrackState::Exited,
                _ => {}
            }
        }

        for det_idx in unmatched_detections {
            self.register(&detections[det_idx], frame, zone, now);
        }

        self.cleanup(now);

        if !self.ready.is_empty() {
            info!(
                "{} track(s) ready for recognition (captured total {})",
                self.ready.len(),
                self.totals.captured
            );
        }
    }

    /// Tracks handed off during the most recent update. Drains the ready set.
    pub fn take_ready(&mut self) -> Vec<Track> {
        std::mem::take(&mut self.ready)
    }

    /// Attach an external recognition result. Returns false for unknown tracks.
    pub fn attach_result(&mut self, track_id: u64, result: serde_json::Value) -> bool {
        match self.tracks.get_mut(&track_id) {
            Some(track) => {
                track.result = Some(result);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, track_id: u64) -> Option<&Track> {
        self.tracks.get(&track_id)
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn snapshot(&self) -> Vec<TrackSummary> {
        self.tracks.values().map(Track::summary).collect()
    }

    /// Tracks entering or dwelling in the zone.
    pub fn in_zone_count(&self) -> usize {
        self.tracks
            .values()
            .filter(|t| t.state.is_zone_occupant())
            .count()
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            total_vehicles: self.totals.total_vehicles,
            born_in_zone: self.totals.born_in_zone,
            entered_zone: self.totals.entered_zone,
            captured: self.totals.captured,
            active_tracks: self.tracks.len(),
            in_zone: self.in_zone_count(),
            processing: self
                .tracks
                .values()
                .filter(|t| t.state == TrackState::Processing)
                .count(),
        }
    }

    /// Drop every live track. Totals survive; track ids keep increasing.
    pub fn reset(&mut self) {
        if !self.tracks.is_empty() {
            debug!("tracker reset, dropping {} track(s)", self.tracks.len());
        }
        self.tracks.clear();
        self.ready.clear();
    }

    /// Greedy assignment: repeatedly accept the globally closest remaining
    /// (track, detection) pair while its distance is within `max_distance`.
    fn match_detections(&self, detections: &[Detection]) -> (Vec<(u64, usize)>, Vec<u64>, Vec<usize>) {
        let mut pairs: Vec<(f64, u64, usize)> = Vec::new();
        for (track_id, track) in &self.tracks {
            let Some(current) = track.current_bbox() else {
                continue;
            };
            let center = current.center();
            for (idx, det) in detections.iter().enumerate() {
                let dist = center.distance(&det.bbox.center());
                if dist <= self.config.max_distance {
                    pairs.push((dist, *track_id, idx));
                }
            }
        }
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut matched_tracks = Vec::new();
        let mut matched_dets = vec![false; detections.len()];
        let mut matches = Vec::new();
        for (_, track_id, idx) in pairs {
            if matched_dets[idx] || matched_tracks.contains(&track_id) {
                continue;
            }
            matched_dets[idx] = true;
            matched_tracks.push(track_id);
            matches.push((track_id, idx));
        }

        let unmatched_tracks = self
            .tracks
            .keys()
            .filter(|id| !matched_tracks.contains(id))
            .copied()
            .collect();
        let unmatched_dets = matched_dets
            .iter()
            .enumerate()
            .filter(|(_, matched)| !**matched)
            .map(|(idx, _)| idx)
            .collect();
        (matches, unmatched_tracks, unmatched_dets)
    }

    fn register(&mut self, det: &Detection, frame: &Frame, zone: Option<&ZoneGeometry>, now: Instant) {
        let track_id = next_track_id();
        let mut track = Track::new(track_id, self.config.history_len, now);
        track.update(det.bbox, frame.clone(), det.confidence, now);

        if zone.is_some_and(|z| z.contains_bbox(&det.bbox)) {
            track.born_in_zone = true;
            track.state = TrackState::InZone;
            track.frames_in_zone = 1;
            track.zone_entry_time = Some(now);
            self.totals.born_in_zone += 1;
            info!(
                "track {} born in zone (bbox {:.0},{:.0},{:.0},{:.0})",
                track_id, det.bbox.x1, det.bbox.y1, det.bbox.x2, det.bbox.y2
            );
        }

        self.tracks.insert(track_id, track);
        self.totals.total_vehicles += 1;
    }

    fn cleanup(&mut self, now: Instant) {
        let timeout = self.config.disappearance_timeout();
        let grace = self.config.processed_grace;
        let mut remove = Vec::new();

        for (track_id, track) in self.tracks.iter_mut() {
            if track.time_since_last_seen(now) > timeout {
                if track.state == TrackState::InZone {
                    hand_off(track, now, &mut self.ready, &mut self.totals, "cleanup");
                }
                remove.push(*track_id);
            } else if matches!(track.state, TrackState::Processed | TrackState::Exited) {
                let since = track.zone_exit_time.unwrap_or(track.last_seen);
                if now.saturating_duration_since(since) > grace {
                    remove.push(*track_id);
                }
            }
        }

        for track_id in remove {
            self.tracks.remove(&track_id);
        }
    }
}

fn step_zone_state(
    track: &mut Track,
    zone: &ZoneGeometry,
    config: &TrackerConfig,
    now: Instant,
    ready: &mut Vec<Track>,
    totals: &mut Totals,
) {
    let Some(bbox) = track.current_bbox().copied() else {
        return;
    };

    // Crossing fallback only for jumps that start outside the zone.
    let mut in_zone = zone.contains_bbox(&bbox);
    if !in_zone {
        if let Some(prev) = track.prev_bottom_center.filter(|p| !zone.contains_point(*p)) {
            if zone.line_crosses_zone(prev, bbox.bottom_center()) {
                debug!("track {} caught by line-crossing check", track.track_id);
                in_zone = true;
            }
        }
    }

    match track.state {
        TrackState::Idle => {
            if in_zone {
                track.state = TrackState::EnteringZone;
                track.frames_in_zone = 1;
                track.zone_entry_time = Some(now);
                info!("track {} entering zone", track.track_id);
            }
        }
        TrackState::EnteringZone => {
            if in_zone {
                track.frames_in_zone += 1;
                if track.frames_in_zone >= config.min_frames_in_zone {
                    track.state = TrackState::InZone;
                    totals.entered_zone += 1;
                    info!(
                        "track {} in zone (frames {})",
                        track.track_id, track.frames_in_zone
                    );
                }
            } else {
                track.state = TrackState::Idle;
                track.frames_in_zone = 0;
                track.zone_entry_time = None;
                info!("track {} false entry, back outside", track.track_id);
            }
        }
        TrackState::InZone => {
            if in_zone {
                track.frames_in_zone += 1;
                track.frames_out_of_zone = 0;
            } else {
                track.frames_out_of_zone += 1;
                if track.frames_out_of_zone >= config.min_frames_out_of_zone {
                    hand_off(track, now, ready, totals, "left zone");
                }
            }
        }
        _ => {}
    }
}

/// IN_ZONE -> PROCESSING through the one-way gate. No-op once the gate is set.
fn hand_off(track: &mut Track, now: Instant, ready: &mut Vec<Track>, totals: &mut Totals, reason: &str) {
    if track.processing_started {
        return;
    }
    track.processing_started = true;
    track.state = TrackState::Processing;
    track.zone_exit_time = Some(now);
    totals.captured += 1;
    let dwell = track.dwell_time().unwrap_or_default();
    info!(
        "track {} processing ({}, dwell {:.1}s, frames_out {})",
        track.track_id,
        reason,
        dwell.as_secs_f64(),
        track.frames_out_of_zone
    );
    ready.push(track.clone());
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
