use std::collections::VecDeque;

use anyhow::Result;
use image::RgbImage;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{Detection, ObjectClass};
use crate::zone::BBox;

/// Frame-differencing detector.
///
/// Splits the frame into square cells, marks cells whose mean luma changed by more
/// than `threshold` since the previous frame, and reports each 4-connected group of
/// at least `min_cells` active cells as a class-agnostic vehicle. Good enough for
/// fixed cameras watching a driveway; not a substitute for a trained model.
pub struct MotionBackend {
    cell_size: u32,
    threshold: f32,
    min_cells: usize,
    previous: Option<Vec<f32>>,
    grid: (u32, u32),
}

impl Default for MotionBackend {
    fn default() -> Self {
        Self::new(16, 12.0, 6)
    }
}

impl MotionBackend {
    pub fn new(cell_size: u32, threshold: f32, min_cells: usize) -> Self {
        Self {
            cell_size: cell_size.max(1),
            threshold,
            min_cells: min_cells.max(1),
            previous: None,
            grid: (0, 0),
        }
    }

    fn cell_means(&self, frame: &RgbImage) -> (Vec<f32>, (u32, u32)) {
        let cols = frame.width().div_ceil(self.cell_size);
        let rows = frame.height().div_ceil(self.cell_size);
        let mut sums = vec![0f32; (cols * rows) as usize];
        let mut counts = vec![0u32; (cols * rows) as usize];

        for (x, y, px) in frame.enumerate_pixels() {
            let idx = ((y / self.cell_size) * cols + x / self.cell_size) as usize;
            let [r, g, b] = px.0;
            sums[idx] += 0.299 * f32::from(r) + 0.587 * f32::from(g) + 0.114 * f32::from(b);
            counts[idx] += 1;
        }
        for (sum, count) in sums.iter_mut().zip(counts) {
            if count > 0 {
                *sum /= count as f32;
            }
        }
        (sums, (cols, rows))
    }

    fn blobs(&self, active: &[bool], cols: u32, rows: u32) -> Vec<Vec<(u32, u32)>> {
        let mut seen = vec![false; active.len()];
        let mut blobs = Vec::new();

        for start in 0..active.len() {
            if !active[start] || seen[start] {
                continue;
            }
            let mut blob = Vec::new();
            let mut queue = VecDeque::from([start]);
            seen[start] = true;
            while let Some(idx) = queue.pop_front() {
                let (cx, cy) = (idx as u32 % cols, idx as u32 / cols);
                blob.push((cx, cy));
                let neighbours = [
                    (cx > 0).then(|| idx - 1),
                    (cx + 1 < cols).then(|| idx + 1),
                    (cy > 0).then(|| idx - cols as usize),
                    (cy + 1 < rows).then(|| idx + cols as usize),
                ];
                for n in neighbours.into_iter().flatten() {
                    if active[n] && !seen[n] {
                        seen[n] = true;
                        queue.push_back(n);
                    }
                }
            }
            blobs.push(blob);
        }
        blobs
    }
}

impl DetectorBackend for MotionBackend {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<Detection>> {
        let (means, grid) = self.cell_means(frame);
        let previous = match self.previous.take() {
            Some(prev) if self.grid == grid => prev,
            _ => {
                self.previous = Some(means);
                self.grid = grid;
                return Ok(Vec::new());
            }
        };

        let active: Vec<bool> = means
            .iter()
            .zip(&previous)
            .map(|(now, before)| (now - before).abs() > self.threshold)
            .collect();
        self.previous = Some(means);

        let (cols, rows) = grid;
        let (w, h) = (f64::from(frame.width()), f64::from(frame.height()));
        let cell = f64::from(self.cell_size);

        let detections = self
            .blobs(&active, cols, rows)
            .into_iter()
            .filter(|blob| blob.len() >= self.min_cells)
            .map(|blob| {
                let min_x = blob.iter().map(|c| c.0).min().unwrap_or(0);
                let max_x = blob.iter().map(|c| c.0).max().unwrap_or(0);
                let min_y = blob.iter().map(|c| c.1).min().unwrap_or(0);
                let max_y = blob.iter().map(|c| c.1).max().unwrap_or(0);
                let span = ((max_x - min_x + 1) * (max_y - min_y + 1)) as f32;
                let fill = blob.len() as f32 / span;
                let bbox = BBox::new(
                    f64::from(min_x) * cell,
                    f64::from(min_y) * cell,
                    (f64::from(max_x + 1) * cell).min(w),
                    (f64::from(max_y + 1) * cell).min(h),
                );
                Detection::new(bbox, (0.5 + 0.5 * fill).min(1.0), ObjectClass::Vehicle)
            })
            .collect();
        Ok(detections)
    }
}
