use anyhow::Result;
use image::RgbImage;

use crate::detect::result::Detection;

/// Object detector backend.
///
/// Each camera's process worker owns its own instance, so `detect` may keep
/// per-stream state (previous frame, warm caches) behind `&mut self`.
/// Errors are treated by the caller as "no detections this frame".
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a decoded frame. Boxes are in the frame's pixel coordinates.
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
