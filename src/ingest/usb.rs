//! USB camera source.
//!
//! `UsbSource` reads frames from a local V4L2 device (e.g. /dev/video0).
//! Every capture is a synchronous device read. The driver keeps filling its
//! mmap buffers between captures, so a capture drains the ones filled before
//! the trigger and returns the first frame exposed after it. Frames are
//! normalized to packed RGB24 before they leave the source.

#[cfg(feature = "ingest-v4l2")]
use anyhow::Context;
use anyhow::Result;
#[cfg(feature = "ingest-v4l2")]
use ouroboros::self_referencing;
#[cfg(feature = "ingest-v4l2")]
use std::time::{Duration, Instant};

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::{synthetic_luma, Capture, CaptureMode, FrameSource};
use crate::frame::Frame;

/// Number of mmap buffers the device streams into.
#[cfg_attr(not(feature = "ingest-v4l2"), allow(dead_code))]
const STREAM_BUFFERS: u32 = 2;

/// A driver queue of filled capture buffers, oldest first.
#[cfg_attr(not(feature = "ingest-v4l2"), allow(dead_code))]
trait FrameQueue {
    /// Hand the previous buffer back to the driver and take the next filled one.
    fn dequeue(&mut self) -> std::io::Result<&[u8]>;
}

#[cfg(feature = "ingest-v4l2")]
impl FrameQueue for v4l::prelude::MmapStream<'_> {
    fn dequeue(&mut self) -> std::io::Result<&[u8]> {
        v4l::io::traits::CaptureStream::next(self).map(|(buf, _meta)| buf)
    }
}

/// Skip the `buffers - 1` frames that were already queued when the capture
/// started and copy out the one after them.
#[cfg_attr(not(feature = "ingest-v4l2"), allow(dead_code))]
fn dequeue_latest(queue: &mut impl FrameQueue, buffers: u32) -> std::io::Result<Vec<u8>> {
    for _ in 1..buffers {
        queue.dequeue()?;
    }
    queue.dequeue().map(<[u8]>::to_vec)
}

/// Configuration for a USB source.
#[derive(Clone, Debug)]
pub struct UsbConfig {
    /// Device path (e.g., "/dev/video0") or a `stub://` name.
    pub device: String,
    /// Requested frame rate.
    pub target_fps: u32,
    /// Preferred frame width.
    pub width: u32,
    /// Preferred frame height.
    pub height: u32,
}

impl UsbConfig {
    /// Device node for a camera index.
    pub fn device_path(index: u32) -> String {
        format!("/dev/video{}", index)
    }
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            device: Self::device_path(0),
            target_fps: 10,
            width: 640,
            height: 480,
        }
    }
}

/// USB frame source.
pub struct UsbSource {
    backend: UsbBackend,
}

enum UsbBackend {
    Synthetic(SyntheticUsbSource),
    #[cfg(feature = "ingest-v4l2")]
    Device(DeviceUsbSource),
}

impl UsbSource {
    pub fn new(config: UsbConfig) -> Result<Self> {
        if config.device.starts_with("stub://") {
            // Synthetic frames go through YUYV, which packs pixel pairs.
            if config.width % 2 != 0 {
                anyhow::bail!("USB frame width must be even (got {})", config.width);
            }
            Ok(Self {
                backend: UsbBackend::Synthetic(SyntheticUsbSource::new(config)),
            })
        } else {
            #[cfg(feature = "ingest-v4l2")]
            {
                Ok(Self {
                    backend: UsbBackend::Device(DeviceUsbSource::new(config)),
                })
            }
            #[cfg(not(feature = "ingest-v4l2"))]
            {
                anyhow::bail!(
                    "USB capture from {} requires the ingest-v4l2 feature",
                    config.device
                )
            }
        }
    }

    /// Get frame statistics.
    pub fn stats(&self) -> UsbStats {
        match &self.backend {
            UsbBackend::Synthetic(source) => source.stats(),
            #[cfg(feature = "ingest-v4l2")]
            UsbBackend::Device(source) => source.stats(),
        }
    }
}

impl FrameSource for UsbSource {
    fn name(&self) -> &str {
        match &self.backend {
            UsbBackend::Synthetic(source) => &source.config.device,
            #[cfg(feature = "ingest-v4l2")]
            UsbBackend::Device(source) => &source.config.device,
        }
    }

    fn mode(&self) -> CaptureMode {
        CaptureMode::Usb
    }

    fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            UsbBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "ingest-v4l2")]
            UsbBackend::Device(source) => source.connect(),
        }
    }

    fn capture(&mut self) -> Result<Capture> {
        let frame = match &mut self.backend {
            UsbBackend::Synthetic(source) => source.next_frame()?,
            #[cfg(feature = "ingest-v4l2")]
            UsbBackend::Device(source) => source.next_frame()?,
        };
        Ok(Capture::new(frame))
    }

    fn is_healthy(&self) -> bool {
        match &self.backend {
            UsbBackend::Synthetic(_) => true,
            #[cfg(feature = "ingest-v4l2")]
            UsbBackend::Device(source) => source.is_healthy(),
        }
    }

    fn disconnect(&mut self) {
        match &mut self.backend {
            UsbBackend::Synthetic(_) => {}
            #[cfg(feature = "ingest-v4l2")]
            UsbBackend::Device(source) => source.disconnect(),
        }
    }
}

/// Statistics for a USB source.
#[derive(Clone, Debug)]
pub struct UsbStats {
    pub frames_captured: u64,
    pub device: String,
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://)
// ----------------------------------------------------------------------------

struct SyntheticUsbSource {
    config: UsbConfig,
    frame_count: u64,
    scene_state: u8,
}

impl SyntheticUsbSource {
    fn new(config: UsbConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            scene_state: 0,
        }
    }

    fn connect(&mut self) -> Result<()> {
        log::info!("UsbSource: connected to {} (synthetic)", self.config.device);
        Ok(())
    }

    /// Produces YUYV like a typical webcam, then normalizes it.
    fn next_frame(&mut self) -> Result<Frame> {
        self.frame_count += 1;
        if self.frame_count % 25 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }

        let luma = synthetic_luma(
            self.config.width,
            self.config.height,
            self.frame_count,
            self.scene_state,
        );
        let yuyv: Vec<u8> = luma
            .chunks(2)
            .flat_map(|pair| [pair[0], 128, pair.get(1).copied().unwrap_or(pair[0]), 128])
            .collect();
        let (pixels, width, height) = normalize_to_rgb(
            &yuyv,
            self.config.width,
            self.config.height,
            PixelFormat::Yuyv,
        )?;
        Frame::rgb(pixels, width, height)
    }

    fn stats(&self) -> UsbStats {
        UsbStats {
            frames_captured: self.frame_count,
            device: self.config.device.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// V4L2 device source
// ----------------------------------------------------------------------------

#[cfg(feature = "ingest-v4l2")]
struct DeviceUsbSource {
    config: UsbConfig,
    state: Option<DeviceUsbState>,
    format: PixelFormat,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
    active_width: u32,
    active_height: u32,
}

#[cfg(feature = "ingest-v4l2")]
#[self_referencing]
struct DeviceUsbState {
    device: v4l::Device,
    #[borrows(device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this>,
}

#[cfg(feature = "ingest-v4l2")]
impl DeviceUsbSource {
    fn new(config: UsbConfig) -> Self {
        Self {
            active_width: config.width,
            active_height: config.height,
            config,
            state: None,
            format: PixelFormat::Yuyv,
            frame_count: 0,
            last_frame_at: None,
            last_error: None,
        }
    }

    fn connect(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let device = v4l::Device::with_path(&self.config.device)
            .with_context(|| format!("open v4l2 device {}", self.config.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(b"YUYV");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "UsbSource: failed to set format on {}: {}",
                    self.config.device,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        self.format = PixelFormat::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
            anyhow::anyhow!(
                "v4l2 device {} negotiated unsupported pixel format {}",
                self.config.device,
                format.fourcc
            )
        })?;

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "UsbSource: failed to set fps on {}: {}",
                    self.config.device,
                    err
                );
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;
        self.last_error = None;

        // Buffers filled while idle hold frames from before the next
        // trigger; `next_frame` drains them.
        let state = DeviceUsbStateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, STREAM_BUFFERS)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()
        .map_err(|err| {
            self.last_error = Some(err.to_string());
            err
        })?;
        self.state = Some(state);

        log::info!(
            "UsbSource: connected to {} ({}x{} {:?})",
            self.config.device,
            self.active_width,
            self.active_height,
            self.format
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        let state = self.state.as_mut().context("v4l2 device not connected")?;
        let raw = state
            .with_stream_mut(|stream| dequeue_latest(stream, STREAM_BUFFERS))
            .map_err(|err| {
                self.last_error = Some(err.to_string());
                anyhow::Error::new(err).context("capture v4l2 frame")
            })?;

        let (pixels, width, height) =
            normalize_to_rgb(&raw, self.active_width, self.active_height, self.format)?;

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        self.last_error = None;

        Frame::rgb(pixels, width, height)
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() || self.state.is_none() {
            return false;
        }
        let Some(last_frame_at) = self.last_frame_at else {
            return true;
        };
        last_frame_at.elapsed() <= self.health_grace()
    }

    fn disconnect(&mut self) {
        if self.state.take().is_some() {
            log::info!("UsbSource: released {}", self.config.device);
        }
    }

    fn stats(&self) -> UsbStats {
        UsbStats {
            frames_captured: self.frame_count,
            device: self.config.device.clone(),
        }
    }

    fn health_grace(&self) -> Duration {
        let base_ms = if self.config.target_fps == 0 {
            2_000
        } else {
            (1000 / self.config.target_fps).saturating_mul(6)
        };
        Duration::from_millis(base_ms.max(2_000) as u64)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
