//! Frame capture sources.
//!
//! Two capture modes exist, selected once at startup:
//! - USB: synchronous reads from a local V4L2 device (feature: ingest-v4l2)
//! - Network: latest-frame capture from an IP camera stream (feature: ingest-gstreamer)
//!
//! Both accept `stub://` addresses that produce synthetic frames, which is how
//! the daemon is exercised without hardware.
//!
//! A failed capture is never fatal: the relay skips the cycle and keeps going.

pub mod motion;
pub mod network;
pub(crate) mod normalize;
pub mod usb;

use anyhow::Result;

use crate::config::CameraSettings;
use crate::frame::{Frame, RegionOfInterest};

pub use motion::MotionDetector;
pub use network::{NetworkConfig, NetworkSource};
pub use usb::{UsbConfig, UsbSource};

/// How frames are acquired for the lifetime of the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureMode {
    Usb,
    Network,
}

impl CaptureMode {
    /// A non-empty camera address selects network capture.
    pub fn from_address(address: &str) -> Self {
        if address.trim().is_empty() {
            Self::Usb
        } else {
            Self::Network
        }
    }
}

/// One successful capture.
#[derive(Debug)]
pub struct Capture {
    pub frame: Frame,
    /// Regions that changed since the previous capture. Always empty for USB.
    pub motion_regions: Vec<RegionOfInterest>,
}

impl Capture {
    pub fn new(frame: Frame) -> Self {
        Self {
            frame,
            motion_regions: Vec::new(),
        }
    }
}

/// A camera the relay can pull single frames from.
pub trait FrameSource: Send {
    /// Source identifier for logs.
    fn name(&self) -> &str;

    fn mode(&self) -> CaptureMode;

    /// Establish the device or stream connection.
    fn connect(&mut self) -> Result<()>;

    /// Capture one frame. Errors are per-cycle failures, not fatal.
    fn capture(&mut self) -> Result<Capture>;

    fn is_healthy(&self) -> bool {
        true
    }

    /// Release the underlying device or stream.
    fn disconnect(&mut self) {}
}

/// Build (but do not connect) the source for the configured capture mode.
pub fn open_source(settings: &CameraSettings) -> Result<Box<dyn FrameSource>> {
    match settings.mode() {
        CaptureMode::Network => {
            let config = NetworkConfig {
                address: settings.address.clone(),
                setup_retries: settings.setup_retries,
                target_fps: settings.target_fps,
                width: settings.width,
                height: settings.height,
                ..NetworkConfig::default()
            };
            Ok(Box::new(NetworkSource::new(config)?))
        }
        CaptureMode::Usb => {
            let device = settings
                .usb_device
                .clone()
                .unwrap_or_else(|| UsbConfig::device_path(settings.device_index));
            let config = UsbConfig {
                device,
                target_fps: settings.target_fps,
                width: settings.width,
                height: settings.height,
            };
            Ok(Box::new(UsbSource::new(config)?))
        }
    }
}

/// Moving test-card pattern used by `stub://` sources.
///
/// `scene_state` shifts a bright band so consecutive scenes differ visibly.
pub(crate) fn synthetic_luma(width: u32, height: u32, frame_count: u64, scene_state: u8) -> Vec<u8> {
    let band_start = (scene_state as u32 * 16) % width.max(1);
    let mut luma = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            let value = if x >= band_start && x < band_start + 16 {
                235
            } else {
                ((x as u64 + y as u64 + frame_count) % 64) as u8 + 16
            };
            luma.push(value);
        }
    }
    luma
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_mode_follows_address() {
        assert_eq!(CaptureMode::from_address(""), CaptureMode::Usb);
        assert_eq!(CaptureMode::from_address("   "), CaptureMode::Usb);
        assert_eq!(
            CaptureMode::from_address("rtsp://10.0.0.5/stream"),
            CaptureMode::Network
        );
    }

    #[test]
    fn open_source_selects_by_mode() -> Result<()> {
        let mut settings = CameraSettings {
            usb_device: Some("stub://bench".to_string()),
            ..CameraSettings::default()
        };
        let usb = open_source(&settings)?;
        assert_eq!(usb.mode(), CaptureMode::Usb);
        assert_eq!(usb.name(), "stub://bench");

        settings.address = "stub://gate".to_string();
        let network = open_source(&settings)?;
        assert_eq!(network.mode(), CaptureMode::Network);
        assert_eq!(network.name(), "stub://gate");
        Ok(())
    }

    #[test]
    fn synthetic_band_moves_with_scene() {
        let a = synthetic_luma(64, 4, 0, 0);
        let b = synthetic_luma(64, 4, 0, 1);
        assert_eq!(a[0], 235);
        assert_ne!(a, b);
    }
}
