//! Trigger zone geometry.
//!
//! A trigger zone is a closed polygon in frame coordinates. Zones may be authored in
//! normalized `[0, 1]` coordinates (resolution independent) or directly in pixels.
//! Normalized zones are resolved against the first frame's dimensions with
//! `ZoneGeometry::rescale_to_pixels`.
//!
//! Membership is decided on a vehicle's ground-contact point (bottom-center of its
//! bounding box), not on box overlap. A segment test (`line_crosses_zone`) catches
//! fast objects whose ground point jumps over the zone between two sampled frames.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tolerance used for boundary and collinearity tests (pixels or normalized units).
const GEOMETRY_EPS: f64 = 1e-9;

/// A point in frame coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Axis-aligned bounding box in `xyxy` form.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BBox {
    pub const fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn center(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Ground-contact point: horizontal center of the bottom edge.
    pub fn bottom_center(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, self.y2)
    }

    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f64 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f64 {
        (self.width() * self.height()).max(0.0)
    }
}

/// Zone shape tag as persisted in camera configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneKind {
    #[default]
    Polygon,
    Rectangle,
}

/// Persisted zone shape: `{"points": [[x, y], ...], "zone_type": "polygon"}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZoneSpec {
    pub points: Vec<[f64; 2]>,
    #[serde(default, alias = "type")]
    pub zone_type: ZoneKind,
}

impl ZoneSpec {
    pub fn polygon(points: &[[f64; 2]]) -> Self {
        Self {
            points: points.to_vec(),
            zone_type: ZoneKind::Polygon,
        }
    }

    pub fn rectangle(top_left: [f64; 2], bottom_right: [f64; 2]) -> Self {
        Self {
            points: vec![top_left, bottom_right],
            zone_type: ZoneKind::Rectangle,
        }
    }

    /// True when every coordinate lies in `[0, 1]`.
    pub fn is_normalized(&self) -> bool {
        !self.points.is_empty()
            && self
                .points
                .iter()
                .all(|[x, y]| (0.0..=1.0).contains(x) && (0.0..=1.0).contains(y))
    }
}

/// Zone construction failures.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ZoneError {
    #[error("invalid zone: rectangle requires exactly 2 points (top-left, bottom-right), got {0}")]
    RectanglePointCount(usize),
    #[error("invalid zone: polygon requires at least 3 points, got {0}")]
    TooFewPoints(usize),
    #[error("invalid zone: point {index} has a non-finite coordinate")]
    NonFinite { index: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CoordSpace {
    Normalized,
    Pixel,
}

/// Immutable trigger zone polygon.
#[derive(Clone, Debug, PartialEq)]
pub struct ZoneGeometry {
    points: Vec<Point>,
    kind: ZoneKind,
    space: CoordSpace,
}

impl ZoneGeometry {
    /// Build a zone. Rectangles take exactly two corners and are expanded to four.
    pub fn new(points: &[Point], kind: ZoneKind) -> Result<Self, ZoneError> {
        if let Some(index) = points.iter().position(|p| !p.is_finite()) {
            return Err(ZoneError::NonFinite { index });
        }

        let points = match kind {
            ZoneKind::Rectangle => {
                if points.len() != 2 {
                    return Err(ZoneError::RectanglePointCount(points.len()));
                }
                let (a, b) = (points[0], points[1]);
                vec![
                    Point::new(a.x, a.y),
                    Point::new(b.x, a.y),
                    Point::new(b.x, b.y),
                    Point::new(a.x, b.y),
                ]
            }
            ZoneKind::Polygon => {
                if points.len() < 3 {
                    return Err(ZoneError::TooFewPoints(points.len()));
                }
                points.to_vec()
            }
        };

        let normalized = points
            .iter()
            .all(|p| (0.0..=1.0).contains(&p.x) && (0.0..=1.0).contains(&p.y));

        Ok(Self {
            points,
            kind,
            space: if normalized {
                CoordSpace::Normalized
            } else {
                CoordSpace::Pixel
            },
        })
    }

    pub fn from_spec(spec: &ZoneSpec) -> Result<Self, ZoneError> {
        let points: Vec<Point> = spec.points.iter().map(|[x, y]| Point::new(*x, *y)).collect();
        Self::new(&points, spec.zone_type)
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn kind(&self) -> ZoneKind {
        self.kind
    }

    /// True until the zone has been resolved against frame dimensions.
    pub fn is_normalized(&self) -> bool {
        self.space == CoordSpace::Normalized
    }

    /// Boundary-inclusive point-in-polygon test.
    pub fn contains_point(&self, p: Point) -> bool {
        if self.edges().any(|(a, b)| point_on_segment(p, a, b)) {
            return true;
        }

        // Even-odd ray cast towards +x.
        let mut inside = false;
        for (a, b) in self.edges() {
            if (a.y > p.y) != (b.y > p.y) {
                let x_cross = a.x + (p.y - a.y) * (b.x - a.x) / (b.y - a.y);
                if p.x < x_cross {
                    inside = !inside;
                }
            }
        }
        inside
    }

    /// Zone membership of a detection, judged on its bottom-center point.
    pub fn contains_bbox(&self, bbox: &BBox) -> bool {
        self.contains_point(bbox.bottom_center())
    }

    /// True when the segment `p1 -> p2` touches or crosses any zone edge.
    pub fn line_crosses_zone(&self, p1: Point, p2: Point) -> bool {
        self.edges().any(|(a, b)| segments_intersect(p1, p2, a, b))
    }

    /// Resolve a normalized zone into pixel space. Pixel-space zones are returned as is.
    pub fn rescale_to_pixels(&self, width: u32, height: u32) -> ZoneGeometry {
        if self.space == CoordSpace::Pixel {
            return self.clone();
        }
        let (w, h) = (f64::from(width), f64::from(height));
        ZoneGeometry {
            points: self
                .points
                .iter()
                .map(|p| Point::new(p.x * w, p.y * h))
                .collect(),
            kind: self.kind,
            space: CoordSpace::Pixel,
        }
    }

    /// Top-left corner of the zone's bounding rectangle.
    pub fn top_left(&self) -> Point {
        let x = self.points.iter().map(|p| p.x).fold(f64::INFINITY, f64::min);
        let y = self.points.iter().map(|p| p.y).fold(f64::INFINITY, f64::min);
        Point::new(x, y)
    }

    fn edges(&self) -> impl Iterator<Item = (Point, Point)> + '_ {
        let n = self.points.len();
        (0..n).map(move |i| (self.points[i], self.points[(i + 1) % n]))
    }
}

fn cross(o: Point, a: Point, b: Point) -> f64 {
    (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
}

fn orientation(o: Point, a: Point, b: Point) -> i8 {
    let c = cross(o, a, b);
    if c.abs() <= GEOMETRY_EPS {
        0
    } else if c > 0.0 {
        1
    } else {
        -1
    }
}

/// `p` lies within the axis-aligned extent of segment `a-b` (assumes collinearity).
fn within_extent(p: Point, a: Point, b: Point) -> bool {
    p.x >= a.x.min(b.x) - GEOMETRY_EPS
        && p.x <= a.x.max(b.x) + GEOMETRY_EPS
        && p.y >= a.y.min(b.y) - GEOMETRY_EPS
        && p.y <= a.y.max(b.y) + GEOMETRY_EPS
}

fn point_on_segment(p: Point, a: Point, b: Point) -> bool {
    let len = a.distance(&b);
    let c = cross(a, b, p);
    c.abs() <= GEOMETRY_EPS * len.max(1.0) && within_extent(p, a, b)
}

fn segments_intersect(p1: Point, p2: Point, q1: Point, q2: Point) -> bool {
    let o1 = orientation(p1, p2, q1);
    let o2 = orientation(p1, p2, q2);
    let o3 = orientation(q1, q2, p1);
    let o4 = orientation(q1, q2, p2);

    if o1 != o2 && o3 != o4 {
        return true;
    }

    (o1 == 0 && within_extent(q1, p1, p2))
        || (o2 == 0 && within_extent(q2, p1, p2))
        || (o3 == 0 && within_extent(p1, q1, q2))
        || (o4 == 0 && within_extent(p2, q1, q2))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
