use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;

/// Backend that never detects anything. Useful for plain camera viewing.
#[derive(Default)]
pub struct StubBackend {
    frames_seen: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _frame: &RgbImage) -> Result<Vec<Detection>> {
        self.frames_seen += 1;
        Ok(Vec::new())
    }
}

/// One scripted detector response.
#[derive(Clone, Debug)]
pub enum ScriptStep {
    Detections(Vec<Detection>),
    Fail(String),
}

/// Backend that replays a fixed sequence of responses, one per frame.
///
/// Once the script is exhausted it keeps returning empty detection lists.
/// The script is shared, so a clone kept by a test observes consumption.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    script: Arc<Mutex<VecDeque<ScriptStep>>>,
}

impl ScriptedBackend {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            script: Arc::new(Mutex::new(steps.into_iter().collect())),
        }
    }

    /// Script made only of detection lists.
    pub fn from_detections(frames: impl IntoIterator<Item = Vec<Detection>>) -> Self {
        Self::new(frames.into_iter().map(ScriptStep::Detections))
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, _frame: &RgbImage) -> Result<Vec<Detection>> {
        let step = self
            .script
            .lock()
            .map_err(|_| anyhow!("detector script lock poisoned"))?
            .pop_front();
        match step {
            Some(ScriptStep::Detections(dets)) => Ok(dets),
            Some(ScriptStep::Fail(msg)) => Err(anyhow!(msg)),
            None => Ok(Vec::new()),
        }
    }
}
