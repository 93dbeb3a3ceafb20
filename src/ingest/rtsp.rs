//! RTSP frame source.
//!
//! `RtspSource` pulls decoded RGB frames from an IP camera through GStreamer
//! (`rtspsrc ! decodebin ! videoconvert ! appsink`), with a synthetic backend for
//! `stub://` URLs that renders a slowly moving block over a flat background.
//!
//! Synthetic URLs accept `width` and `height` query parameters, e.g.
//! `stub://driveway?width=320&height=240`.

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::Context;
use anyhow::Result;
use image::{Rgb, RgbImage};
#[cfg(feature = "rtsp-gstreamer")]
use std::time::Duration;

use super::{FrameSource, ReleaseError};
use crate::mask_stream_url;

/// Configuration for an RTSP source.
#[derive(Clone, Debug)]
pub struct RtspConfig {
    /// RTSP URL (e.g., "rtsp://192.168.1.100:554/stream")
    pub url: String,
    /// Expected frame rate; bounds how long a single read may wait.
    pub target_fps: u32,
    /// Frame width (synthetic frames only).
    pub width: u32,
    /// Frame height (synthetic frames only).
    pub height: u32,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            url: "rtsp://localhost:554/stream".to_string(),
            target_fps: 10,
            width: 640,
            height: 480,
        }
    }
}

impl RtspConfig {
    /// Config for `url`, reading `width`/`height` query parameters on `stub://` URLs.
    pub fn from_url(url: &str) -> Self {
        let mut config = Self {
            url: url.to_string(),
            ..Self::default()
        };
        if !url.starts_with("stub://") {
            return config;
        }
        let query = url.split_once('?').map(|(_, q)| q).unwrap_or("");
        for pair in query.split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let Ok(value) = value.parse::<u32>() else {
                continue;
            };
            match key {
                "width" if value > 0 => config.width = value,
                "height" if value > 0 => config.height = value,
                _ => {}
            }
        }
        config
    }
}

/// RTSP frame source.
///
/// Uses GStreamer for real RTSP decode, with a synthetic fallback for `stub://` URLs.
pub struct RtspSource {
    backend: RtspBackend,
}

enum RtspBackend {
    Synthetic(SyntheticRtspSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerRtspSource),
}

impl RtspSource {
    pub fn new(config: RtspConfig) -> Result<Self> {
        if config.url.starts_with("stub://") {
            Ok(Self {
                backend: RtspBackend::Synthetic(SyntheticRtspSource::new(config)),
            })
        } else {
            #[cfg(feature = "rtsp-gstreamer")]
            {
                Ok(Self {
                    backend: RtspBackend::Gstreamer(GstreamerRtspSource::new(config)?),
                })
            }
            #[cfg(not(feature = "rtsp-gstreamer"))]
            {
                anyhow::bail!(
                    "RTSP requires the rtsp-gstreamer feature ({})",
                    mask_stream_url(&config.url)
                )
            }
        }
    }

    pub fn frames_captured(&self) -> u64 {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.frame_count,
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.frame_count,
        }
    }
}

impl FrameSource for RtspSource {
    fn open(&mut self) -> Result<()> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.open(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.open(),
        }
    }

    fn read(&mut self) -> Result<Option<RgbImage>> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.read(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.read(),
        }
    }

    fn release(&mut self) -> Result<(), ReleaseError> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => {
                source.open = false;
                Ok(())
            }
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.release(),
        }
    }

    fn is_open(&self) -> bool {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.open,
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.playing,
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests
// ----------------------------------------------------------------------------

const BACKGROUND: Rgb<u8> = Rgb([64, 64, 64]);
const BLOCK: Rgb<u8> = Rgb([230, 230, 230]);

struct SyntheticRtspSource {
    config: RtspConfig,
    frame_count: u64,
    open: bool,
}

impl SyntheticRtspSource {
    fn new(config: RtspConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            open: false,
        }
    }

    /// Synthetic sources are always reachable.
    fn open(&mut self) -> Result<()> {
        self.open = true;
        log::info!("RtspSource: connected to {} (synthetic)", self.config.url);
        Ok(())
    }

    fn read(&mut self) -> Result<Option<RgbImage>> {
        if !self.open {
            anyhow::bail!("synthetic stream {} is not open", self.config.url);
        }
        self.frame_count += 1;
        Ok(Some(self.render()))
    }

    /// Flat background with a block driving left to right across the lower third.
    fn render(&self) -> RgbImage {
        let (w, h) = (self.config.width, self.config.height);
        let block_w = (w / 6).max(1);
        let block_h = (h / 8).max(1);
        let step = u64::from((w / 40).max(1));
        let travel = u64::from(w + block_w);
        let x0 = ((self.frame_count * step) % travel) as i64 - i64::from(block_w);
        let y0 = i64::from(h) * 2 / 3 - i64::from(block_h) / 2;

        RgbImage::from_fn(w, h, |x, y| {
            let (x, y) = (i64::from(x), i64::from(y));
            let in_block = x >= x0
                && x < x0 + i64::from(block_w)
                && y >= y0
                && y < y0 + i64::from(block_h);
            if in_block {
                BLOCK
            } else {
                BACKGROUND
            }
        })
    }
}

// ----------------------------------------------------------------------------
// Production RTSP source using GStreamer
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerRtspSource {
    config: RtspConfig,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    frame_count: u64,
    playing: bool,
    last_error: Option<String>,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerRtspSource {
    fn new(config: RtspConfig) -> Result<Self> {
        use gstreamer::prelude::*;

        gstreamer::init().context("initialize gstreamer")?;

        let pipeline_description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            config.url
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow::anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow::anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self {
            config,
            pipeline,
            appsink,
            frame_count: 0,
            playing: false,
            last_error: None,
        })
    }

    fn open(&mut self) -> Result<()> {
        use gstreamer::prelude::*;

        self.last_error = None;
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;
        self.playing = true;
        log::info!("RtspSource: connecting to {}", mask_stream_url(&self.config.url));
        Ok(())
    }

    fn read(&mut self) -> Result<Option<RgbImage>> {
        self.poll_bus();
        if let Some(err) = &self.last_error {
            anyhow::bail!("{}", err);
        }

        let Some(sample) = self.appsink.try_pull_sample(self.frame_timeout()) else {
            return Ok(None);
        };
        let image = sample_to_image(&sample)?;
        self.frame_count += 1;
        Ok(Some(image))
    }

    fn release(&mut self) -> Result<(), ReleaseError> {
        use gstreamer::prelude::*;

        if !self.playing {
            return Ok(());
        }
        self.playing = false;
        self.pipeline
            .set_state(gstreamer::State::Null)
            .map(|_| ())
            .map_err(|err| ReleaseError::Pipeline {
                url: mask_stream_url(&self.config.url),
                reason: err.to_string(),
            })
    }

    fn frame_timeout(&self) -> gstreamer::ClockTime {
        let base_ms = if self.config.target_fps == 0 {
            500
        } else {
            (1000 / self.config.target_fps).saturating_mul(4)
        };
        let timeout = Duration::from_millis(u64::from(base_ms.max(500)));
        gstreamer::ClockTime::from_mseconds(timeout.as_millis() as u64)
    }

    fn poll_bus(&mut self) {
        use gstreamer::prelude::*;

        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_image(sample: &gstreamer::Sample) -> Result<RgbImage> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    let pixels = if stride == row_bytes {
        data.get(..row_bytes * height as usize)
            .context("RTSP buffer is shorter than the frame")?
            .to_vec()
    } else {
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            pixels.extend_from_slice(
                data.get(start..start + row_bytes)
                    .context("RTSP buffer row is out of bounds")?,
            );
        }
        pixels
    };

    RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| anyhow::anyhow!("RTSP frame size does not match {}x{}", width, height))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
