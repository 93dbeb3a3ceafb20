use serde::Serialize;

use crate::zone::BBox;

/// One detected object in pixel coordinates of the frame it was found in.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub bbox: BBox,
    pub confidence: f32,
    pub class: ObjectClass,
}

impl Detection {
    pub fn new(bbox: BBox, confidence: f32, class: ObjectClass) -> Self {
        Self {
            bbox,
            confidence,
            class,
        }
    }
}

#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectClass {
    Car,
    Motorcycle,
    Bus,
    Truck,
    /// Vehicle of unknown type (class-agnostic detectors).
    Vehicle,
    Person,
    Unknown,
}

impl ObjectClass {
    /// Map a COCO class id to the classes this crate cares about.
    pub fn from_coco_id(id: u32) -> Self {
        match id {
            0 => ObjectClass::Person,
            2 => ObjectClass::Car,
            3 => ObjectClass::Motorcycle,
            5 => ObjectClass::Bus,
            7 => ObjectClass::Truck,
            _ => ObjectClass::Unknown,
        }
    }

    pub fn is_vehicle(&self) -> bool {
        matches!(
            self,
            ObjectClass::Car
                | ObjectClass::Motorcycle
                | ObjectClass::Bus
                | ObjectClass::Truck
                | ObjectClass::Vehicle
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            ObjectClass::Car => "car",
            ObjectClass::Motorcycle => "motorcycle",
            ObjectClass::Bus => "bus",
            ObjectClass::Truck => "truck",
            ObjectClass::Vehicle => "vehicle",
            ObjectClass::Person => "person",
            ObjectClass::Unknown => "unknown",
        }
    }
}

/// Post-detection filter applied by the process worker.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectionFilter {
    pub min_confidence: f32,
    pub vehicle_only: bool,
}

impl Default for DetectionFilter {
    fn default() -> Self {
        Self {
            min_confidence: 0.35,
            vehicle_only: true,
        }
    }
}

impl DetectionFilter {
    pub fn accepts(&self, det: &Detection) -> bool {
        det.confidence >= self.min_confidence && (!self.vehicle_only || det.class.is_vehicle())
    }

    pub fn apply(&self, detections: Vec<Detection>) -> Vec<Detection> {
        detections.into_iter().filter(|d| self.accepts(d)).collect()
    }
}
