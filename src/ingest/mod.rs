//! Frame ingestion sources.
//!
//! A `FrameSource` yields decoded RGB frames from one camera connection:
//! - `stub://name` synthetic scene (tests, demos)
//! - `rtsp://...` IP cameras via GStreamer (feature: rtsp-gstreamer)
//! - `file:///path` or a bare local path: a still image replayed as a stream
//!
//! Sources are opened, read and released by the capture worker only. Release is
//! idempotent and reports failures as `ReleaseError` for the caller to log.

pub mod file;
pub mod rtsp;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use image::RgbImage;
use thiserror::Error;

pub use file::FileSource;
pub use rtsp::{RtspConfig, RtspSource};

/// Failure while releasing a stream handle.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ReleaseError {
    #[error("failed to stop pipeline for {url}: {reason}")]
    Pipeline { url: String, reason: String },
}

/// A connection to one video stream.
pub trait FrameSource: Send {
    /// Connect (or reconnect after `release`).
    fn open(&mut self) -> Result<()>;

    /// Next decoded frame. `Ok(None)` means no frame was available this time
    /// (a transient failure); `Err` means the connection is broken.
    fn read(&mut self) -> Result<Option<RgbImage>>;

    /// Release the underlying handle. Calling it on a released source is a no-op.
    fn release(&mut self) -> Result<(), ReleaseError>;

    fn is_open(&self) -> bool;
}

/// Builds a source for a stream URL. Called on every (re)connect attempt.
pub type SourceFactory = Arc<dyn Fn(&str) -> Result<Box<dyn FrameSource>> + Send + Sync>;

/// Build (but do not open) a source for `url`, dispatching on its scheme.
pub fn open_source(url: &str) -> Result<Box<dyn FrameSource>> {
    let url = url.trim();
    if url.is_empty() {
        return Err(anyhow!("empty stream url"));
    }
    if url.starts_with("stub://") || url.starts_with("rtsp://") || url.starts_with("rtsps://") {
        return Ok(Box::new(RtspSource::new(RtspConfig::from_url(url))?));
    }
    if let Some(path) = url.strip_prefix("file://") {
        return Ok(Box::new(FileSource::new(path)?));
    }
    if url.contains("://") {
        return Err(anyhow!(
            "unsupported stream scheme in {}",
            crate::mask_stream_url(url)
        ));
    }
    Ok(Box::new(FileSource::new(url)?))
}

/// Factory backed by `open_source`.
pub fn default_source_factory() -> SourceFactory {
    Arc::new(open_source)
}
