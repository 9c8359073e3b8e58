//! Network camera source.
//!
//! `NetworkSource` pulls frames from an IP camera stream (RTSP, HTTP MJPEG,
//! anything GStreamer's `uridecodebin` understands). The pipeline ends in a
//! one-slot appsink that drops stale buffers, so a capture always returns the
//! most recent frame rather than a queued one.
//!
//! Setup is retried a fixed number of times. After that the stream is treated
//! as unavailable and captures fail until the caller reconnects.

use anyhow::{anyhow, Context, Result};
#[cfg(feature = "ingest-gstreamer")]
use gstreamer::prelude::*;
use std::time::Duration;

use super::motion::MotionDetector;
use super::{synthetic_luma, Capture, CaptureMode, FrameSource};
use crate::frame::Frame;

/// Configuration for a network camera source.
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    /// Stream address (e.g., "rtsp://192.168.1.100:554/stream") or `stub://` name.
    pub address: String,
    /// Connection attempts before giving up.
    pub setup_retries: u32,
    /// Delay between connection attempts.
    pub retry_delay: Duration,
    /// Expected stream frame rate, used for pull timeouts.
    pub target_fps: u32,
    /// Frame width (synthetic streams only).
    pub width: u32,
    /// Frame height (synthetic streams only).
    pub height: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            address: "rtsp://localhost:554/stream".to_string(),
            setup_retries: 5,
            retry_delay: Duration::from_secs(1),
            target_fps: 10,
            width: 640,
            height: 480,
        }
    }
}

/// Network frame source.
///
/// Uses GStreamer for real streams, with a synthetic fallback for `stub://` addresses.
pub struct NetworkSource {
    config: NetworkConfig,
    backend: NetworkBackend,
    motion: MotionDetector,
    connect_attempts: u64,
}

enum NetworkBackend {
    Synthetic(SyntheticNetworkSource),
    #[cfg(feature = "ingest-gstreamer")]
    Gstreamer(GstreamerNetworkSource),
}

impl NetworkSource {
    pub fn new(config: NetworkConfig) -> Result<Self> {
        let backend = if config.address.starts_with("stub://") {
            NetworkBackend::Synthetic(SyntheticNetworkSource::new(config.clone())?)
        } else {
            #[cfg(feature = "ingest-gstreamer")]
            {
                NetworkBackend::Gstreamer(GstreamerNetworkSource::new(config.clone())?)
            }
            #[cfg(not(feature = "ingest-gstreamer"))]
            {
                anyhow::bail!(
                    "network capture from {} requires the ingest-gstreamer feature",
                    config.address
                )
            }
        };
        Ok(Self {
            config,
            backend,
            motion: MotionDetector::new(),
            connect_attempts: 0,
        })
    }

    fn try_connect(&mut self) -> Result<()> {
        match &mut self.backend {
            NetworkBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "ingest-gstreamer")]
            NetworkBackend::Gstreamer(source) => source.connect(),
        }
    }

    /// Get frame statistics.
    pub fn stats(&self) -> NetworkStats {
        let mut stats = match &self.backend {
            NetworkBackend::Synthetic(source) => source.stats(),
            #[cfg(feature = "ingest-gstreamer")]
            NetworkBackend::Gstreamer(source) => source.stats(),
        };
        stats.connect_attempts = self.connect_attempts;
        stats
    }
}

impl FrameSource for NetworkSource {
    fn name(&self) -> &str {
        &self.config.address
    }

    fn mode(&self) -> CaptureMode {
        CaptureMode::Network
    }

    fn connect(&mut self) -> Result<()> {
        let attempts = self.config.setup_retries.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            self.connect_attempts += 1;
            match self.try_connect() {
                Ok(()) => {
                    self.motion.reset();
                    return Ok(());
                }
                Err(err) => {
                    log::warn!(
                        "NetworkSource: connection attempt {}/{} to {} failed: {:#}",
                        attempt,
                        attempts,
                        self.config.address,
                        err
                    );
                    last_err = Some(err);
                    if attempt < attempts {
                        std::thread::sleep(self.config.retry_delay);
                    }
                }
            }
        }
        let err = last_err.unwrap_or_else(|| anyhow!("no connection attempt made"));
        Err(err.context(format!(
            "connect to camera {} after {} attempts",
            self.config.address, attempts
        )))
    }

    /// Returns the latest buffered frame plus motion hints.
    fn capture(&mut self) -> Result<Capture> {
        let frame = match &mut self.backend {
            NetworkBackend::Synthetic(source) => source.latest_frame()?,
            #[cfg(feature = "ingest-gstreamer")]
            NetworkBackend::Gstreamer(source) => source.latest_frame()?,
        };
        let motion_regions = self.motion.update(&frame);
        Ok(Capture {
            frame,
            motion_regions,
        })
    }

    fn is_healthy(&self) -> bool {
        match &self.backend {
            NetworkBackend::Synthetic(source) => source.connected,
            #[cfg(feature = "ingest-gstreamer")]
            NetworkBackend::Gstreamer(source) => source.is_healthy(),
        }
    }

    fn disconnect(&mut self) {
        match &mut self.backend {
            NetworkBackend::Synthetic(source) => source.disconnect(),
            #[cfg(feature = "ingest-gstreamer")]
            NetworkBackend::Gstreamer(source) => source.disconnect(),
        }
    }
}

impl Drop for NetworkSource {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Statistics for a network source.
#[derive(Clone, Debug)]
pub struct NetworkStats {
    pub frames_captured: u64,
    /// Setup attempts made so far, failed ones included.
    pub connect_attempts: u64,
    pub address: String,
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://)
// ----------------------------------------------------------------------------

/// `stub://name?fail_connects=N` refuses the first N connection attempts,
/// standing in for a camera that is still booting.
struct SyntheticNetworkSource {
    config: NetworkConfig,
    connected: bool,
    frame_count: u64,
    scene_state: u8,
    fail_connects: u32,
    attempts: u32,
}

impl SyntheticNetworkSource {
    fn new(config: NetworkConfig) -> Result<Self> {
        let fail_connects = match config.address.split_once('?') {
            Some((_, query)) => parse_fail_connects(query)
                .with_context(|| format!("parse stub address {}", config.address))?,
            None => 0,
        };
        Ok(Self {
            config,
            connected: false,
            frame_count: 0,
            scene_state: 0,
            fail_connects,
            attempts: 0,
        })
    }

    fn connect(&mut self) -> Result<()> {
        self.attempts += 1;
        if self.attempts <= self.fail_connects {
            return Err(anyhow!(
                "synthetic camera refused connection ({} of {})",
                self.attempts,
                self.fail_connects
            ));
        }
        self.connected = true;
        log::info!(
            "NetworkSource: connected to {} (synthetic)",
            self.config.address
        );
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            log::info!("NetworkSource: disconnected from {}", self.config.address);
        }
    }

    fn latest_frame(&mut self) -> Result<Frame> {
        if !self.connected {
            return Err(anyhow!("no frame available: stream not connected"));
        }
        self.frame_count += 1;
        // Every capture is a new scene so motion hints show up in logs.
        self.scene_state = self.scene_state.wrapping_add(1);

        let luma = synthetic_luma(
            self.config.width,
            self.config.height,
            self.frame_count,
            self.scene_state,
        );
        let pixels = luma.iter().flat_map(|&y| [y, y, y]).collect();
        Frame::rgb(pixels, self.config.width, self.config.height)
    }

    fn stats(&self) -> NetworkStats {
        NetworkStats {
            frames_captured: self.frame_count,
            connect_attempts: 0,
            address: self.config.address.clone(),
        }
    }
}

fn parse_fail_connects(query: &str) -> Result<u32> {
    let mut fail_connects = 0;
    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        match pair.split_once('=') {
            Some(("fail_connects", value)) => {
                fail_connects = value
                    .parse()
                    .with_context(|| format!("invalid fail_connects value '{}'", value))?;
            }
            _ => return Err(anyhow!("unknown stub option '{}'", pair)),
        }
    }
    Ok(fail_connects)
}

// ----------------------------------------------------------------------------
// GStreamer stream source
// ----------------------------------------------------------------------------

#[cfg(feature = "ingest-gstreamer")]
struct GstreamerNetworkSource {
    config: NetworkConfig,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    frame_count: u64,
    last_frame_at: Option<std::time::Instant>,
    connected: bool,
    last_error: Option<String>,
}

#[cfg(feature = "ingest-gstreamer")]
impl GstreamerNetworkSource {
    /// Build the pipeline: uridecodebin ! videoconvert ! RGB appsink.
    fn new(config: NetworkConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let pipeline_description = format!(
            "uridecodebin uri={} ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            config.address
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build camera pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("camera pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

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
            last_frame_at: None,
            connected: false,
            last_error: None,
        })
    }

    fn connect(&mut self) -> Result<()> {
        self.last_error = None;
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .context("set camera pipeline to Playing")?;
        // Wait for preroll so an unreachable camera fails here, not on first capture.
        let (result, _current, _pending) = self
            .pipeline
            .state(gstreamer::ClockTime::from_seconds(5));
        if let Err(err) = result {
            let _ = self.pipeline.set_state(gstreamer::State::Null);
            self.poll_bus();
            return Err(anyhow!(
                "camera pipeline did not start: {} ({})",
                err,
                self.last_error.as_deref().unwrap_or("no bus error")
            ));
        }
        self.connected = true;
        log::info!("NetworkSource: connected to {}", self.config.address);
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.connected {
            let _ = self.pipeline.set_state(gstreamer::State::Null);
            self.connected = false;
            log::info!("NetworkSource: disconnected from {}", self.config.address);
        }
    }

    fn latest_frame(&mut self) -> Result<Frame> {
        self.poll_bus();
        if let Some(err) = &self.last_error {
            return Err(anyhow!("no frame available: {}", err));
        }

        let sample = self
            .appsink
            .try_pull_sample(self.frame_timeout())
            .ok_or_else(|| anyhow!("no frame available from {}", self.config.address))?;

        let (pixels, width, height) = sample_to_pixels(&sample)?;

        self.frame_count += 1;
        self.last_frame_at = Some(std::time::Instant::now());

        Frame::rgb(pixels, width, height)
    }

    fn is_healthy(&self) -> bool {
        if !self.connected || self.last_error.is_some() {
            return false;
        }
        let Some(last_frame_at) = self.last_frame_at else {
            return true;
        };
        last_frame_at.elapsed() <= Duration::from_secs(5)
    }

    fn stats(&self) -> NetworkStats {
        NetworkStats {
            frames_captured: self.frame_count,
            connect_attempts: 0,
            address: self.config.address.clone(),
        }
    }

    fn frame_timeout(&self) -> gstreamer::ClockTime {
        let base_ms = if self.config.target_fps == 0 {
            500
        } else {
            (1000 / self.config.target_fps).saturating_mul(4)
        };
        gstreamer::ClockTime::from_mseconds(base_ms.max(500) as u64)
    }

    fn poll_bus(&mut self) {
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
                    self.last_error = Some("camera stream ended".to_string());
                }
                _ => {}
            }
        }
    }
}

#[cfg(feature = "ingest-gstreamer")]
fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("camera sample missing buffer")?;
    let caps = sample.caps().context("camera sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse camera caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map camera buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok((data[..row_bytes * height as usize].to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("camera buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
