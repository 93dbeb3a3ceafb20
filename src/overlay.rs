//! Debug overlay rendered onto a copy of each processed frame.
//!
//! Draws the trigger zone (tinted red while occupied, green otherwise), every live
//! track's box and ground point coloured by state, and a counters panel. Text needs a
//! TrueType font; without one the shapes are still drawn.

use ab_glyph::{FontArc, PxScale};
use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut,
    draw_polygon_mut, draw_text_mut,
};
use imageproc::point::Point as PixelPoint;
use imageproc::rect::Rect;
use std::path::Path;

use crate::frame::Frame;
use crate::track::{TrackState, TrackSummary};
use crate::zone::ZoneGeometry;

const ZONE_IDLE: Rgb<u8> = Rgb([0, 200, 0]);
const ZONE_OCCUPIED: Rgb<u8> = Rgb([230, 0, 0]);
const ZONE_FILL_ALPHA: f32 = 0.2;
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const PANEL_COLOR: Rgb<u8> = Rgb([0, 0, 0]);
const LABEL_SCALE: f32 = 16.0;
const PANEL_SCALE: f32 = 18.0;
const PANEL_LINE_HEIGHT: i32 = 22;

/// Running counters shown in the overlay panel.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct OverlayCounters {
    pub fps: f64,
    pub vehicles: usize,
    pub in_zone: usize,
    pub triggers: u64,
}

#[derive(Clone, Default)]
pub struct OverlayRenderer {
    font: Option<FontArc>,
}

impl OverlayRenderer {
    /// Renderer without text.
    pub fn new() -> Self {
        Self { font: None }
    }

    pub fn with_font(font: FontArc) -> Self {
        Self { font: Some(font) }
    }

    /// Load a TTF/OTF font from disk.
    pub fn from_font_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("read font {}", path.display()))?;
        let font = FontArc::try_from_vec(bytes)
            .map_err(|_| anyhow!("{} is not a usable font", path.display()))?;
        Ok(Self::with_font(font))
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    pub fn render(
        &self,
        frame: &Frame,
        zone: Option<&ZoneGeometry>,
        tracks: &[TrackSummary],
        counters: &OverlayCounters,
    ) -> RgbImage {
        let mut canvas = frame.to_image();

        if let Some(zone) = zone {
            let color = if counters.in_zone > 0 {
                ZONE_OCCUPIED
            } else {
                ZONE_IDLE
            };
            draw_zone(&mut canvas, zone, color);
        }

        for track in tracks {
            self.draw_track(&mut canvas, track);
        }

        self.draw_panel(&mut canvas, counters);
        canvas
    }

    fn draw_track(&self, canvas: &mut RgbImage, track: &TrackSummary) {
        let Some(bbox) = track.bbox else {
            return;
        };
        let color = state_color(track.state);

        let x = bbox.x1.round() as i32;
        let y = bbox.y1.round() as i32;
        let w = bbox.width().round().max(1.0) as u32;
        let h = bbox.height().round().max(1.0) as u32;
        draw_hollow_rect_mut(canvas, Rect::at(x, y).of_size(w, h), color);
        if w > 2 && h > 2 {
            draw_hollow_rect_mut(canvas, Rect::at(x + 1, y + 1).of_size(w - 2, h - 2), color);
        }

        let ground = bbox.bottom_center();
        draw_filled_circle_mut(
            canvas,
            (ground.x.round() as i32, ground.y.round() as i32),
            4,
            color,
        );

        if let Some(font) = &self.font {
            let label = format!("#{} {}", track.track_id, track.state);
            draw_text_mut(
                canvas,
                color,
                x,
                (y - LABEL_SCALE as i32 - 2).max(0),
                PxScale::from(LABEL_SCALE),
                font,
                &label,
            );
        }
    }

    fn draw_panel(&self, canvas: &mut RgbImage, counters: &OverlayCounters) {
        let Some(font) = &self.font else {
            return;
        };
        let lines = [
            format!("FPS: {:.1}", counters.fps),
            format!("Vehicles: {}", counters.vehicles),
            format!("In Zone: {}", counters.in_zone),
            format!("Triggers: {}", counters.triggers),
        ];
        let panel_h = (PANEL_LINE_HEIGHT * lines.len() as i32 + 8) as u32;
        let panel_w = 170u32.min(canvas.width().max(1));
        draw_filled_rect_mut(
            canvas,
            Rect::at(0, 0).of_size(panel_w, panel_h.min(canvas.height().max(1))),
            PANEL_COLOR,
        );
        for (i, line) in lines.iter().enumerate() {
            draw_text_mut(
                canvas,
                TEXT_COLOR,
                6,
                4 + PANEL_LINE_HEIGHT * i as i32,
                PxScale::from(PANEL_SCALE),
                font,
                line,
            );
        }
    }
}

fn state_color(state: TrackState) -> Rgb<u8> {
    match state {
        TrackState::Idle => Rgb([160, 160, 160]),
        TrackState::EnteringZone => Rgb([255, 220, 0]),
        TrackState::InZone => Rgb([0, 255, 0]),
        TrackState::Processing => Rgb([255, 140, 0]),
        TrackState::Processed | TrackState::Exited => Rgb([0, 128, 255]),
        TrackState::ExitingZone => Rgb([255, 0, 255]),
    }
}

/// Tinted fill (alpha blended) plus a solid outline.
fn draw_zone(canvas: &mut RgbImage, zone: &ZoneGeometry, color: Rgb<u8>) {
    let mut poly: Vec<PixelPoint<i32>> = zone
        .points()
        .iter()
        .map(|p| PixelPoint::new(p.x.round() as i32, p.y.round() as i32))
        .collect();
    poly.dedup();
    if poly.len() > 1 && poly.first() == poly.last() {
        poly.pop();
    }

    if poly.len() >= 3 {
        let mut layer = canvas.clone();
        draw_polygon_mut(&mut layer, &poly, color);
        for (dst, src) in canvas.pixels_mut().zip(layer.pixels()) {
            if dst != src {
                for c in 0..3 {
                    let blended = f32::from(dst.0[c]) * (1.0 - ZONE_FILL_ALPHA)
                        + f32::from(src.0[c]) * ZONE_FILL_ALPHA;
                    dst.0[c] = blended.round().clamp(0.0, 255.0) as u8;
                }
            }
        }
    }

    let n = zone.points().len();
    for i in 0..n {
        let a = zone.points()[i];
        let b = zone.points()[(i + 1) % n];
        for offset in [0.0f32, 1.0] {
            draw_line_segment_mut(
                canvas,
                (a.x as f32 + offset, a.y as f32),
                (b.x as f32 + offset, b.y as f32),
                color,
            );
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
