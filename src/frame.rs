//! Captured frames and regions of interest.
//!
//! - `Frame`: one decoded image, owned by the relay for a single cycle.
//! - `RegionOfInterest`: pixel rectangle handed to the recognizer.
//!
//! Nothing here retains frames across cycles. The only on-disk artifact is
//! the debug snapshot written by `Frame::save_snapshot`, overwritten every cycle.

use anyhow::{anyhow, Context, Result};
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage, RgbaImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::Path;
use std::time::{Duration, Instant};

/// Rectangle within a frame, in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionOfInterest {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl RegionOfInterest {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Clip the rectangle to a `width` x `height` frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let x = self.x.min(width);
        let y = self.y.min(height);
        Self {
            x,
            y,
            width: self.width.min(width - x),
            height: self.height.min(height - y),
        }
    }
}

/// A single decoded image.
///
/// Pixels are tightly packed rows of `elem_size` bytes per pixel:
/// 1 = grayscale, 3 = RGB, 4 = RGBA.
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub elem_size: u32,
    captured_at: Instant,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, elem_size: u32) -> Result<Self> {
        if !matches!(elem_size, 1 | 3 | 4) {
            return Err(anyhow!("unsupported pixel element size {}", elem_size));
        }
        let expected = width
            .checked_mul(height)
            .and_then(|v| v.checked_mul(elem_size))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))? as usize;
        if data.len() != expected {
            return Err(anyhow!(
                "frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            elem_size,
            captured_at: Instant::now(),
        })
    }

    pub fn rgb(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        Self::new(data, width, height, 3)
    }

    /// The region covering the whole frame.
    pub fn full_region(&self) -> RegionOfInterest {
        RegionOfInterest::new(0, 0, self.width, self.height)
    }

    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    /// Approximate luminance of the pixel at (`x`, `y`).
    pub fn luma(&self, x: u32, y: u32) -> u8 {
        let offset = ((y * self.width + x) * self.elem_size) as usize;
        match self.elem_size {
            1 => self.data[offset],
            _ => {
                let r = self.data[offset] as u32;
                let g = self.data[offset + 1] as u32;
                let b = self.data[offset + 2] as u32;
                ((r * 299 + g * 587 + b * 114) / 1000) as u8
            }
        }
    }

    fn to_image(&self) -> Result<DynamicImage> {
        let data = self.data.clone();
        let image = match self.elem_size {
            1 => GrayImage::from_raw(self.width, self.height, data).map(DynamicImage::ImageLuma8),
            3 => RgbImage::from_raw(self.width, self.height, data).map(DynamicImage::ImageRgb8),
            // JPEG has no alpha channel.
            _ => RgbaImage::from_raw(self.width, self.height, data)
                .map(|rgba| DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(rgba).to_rgb8())),
        };
        image.ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))
    }

    /// Encode the frame as JPEG.
    pub fn encode_jpeg(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.to_image()?
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Jpeg)
            .context("encode frame as jpeg")?;
        Ok(out)
    }

    /// Write the frame to `path` as JPEG, replacing any previous snapshot.
    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        let jpeg = self.encode_jpeg()?;
        std::fs::write(path, jpeg)
            .with_context(|| format!("write snapshot {}", path.display()))
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("elem_size", &self.elem_size)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> Frame {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[(x * 8) as u8, (y * 8) as u8, 128]);
            }
        }
        Frame::rgb(data, width, height).unwrap()
    }

    #[test]
    fn frame_rejects_length_mismatch() {
        assert!(Frame::rgb(vec![0u8; 10], 2, 2).is_err());
        assert!(Frame::new(vec![0u8; 8], 2, 2, 2).is_err());
    }

    #[test]
    fn full_region_covers_frame() {
        let frame = gradient(16, 8);
        assert_eq!(frame.full_region(), RegionOfInterest::new(0, 0, 16, 8));
    }

    #[test]
    fn luma_handles_gray_and_rgb() {
        let gray = Frame::new(vec![10, 20, 30, 40], 2, 2, 1).unwrap();
        assert_eq!(gray.luma(1, 1), 40);

        let white = Frame::rgb(vec![255u8; 12], 2, 2).unwrap();
        assert_eq!(white.luma(0, 1), 255);
    }

    #[test]
    fn region_clamps_to_frame() {
        let roi = RegionOfInterest::new(10, 4, 50, 50).clamp_to(32, 16);
        assert_eq!(roi, RegionOfInterest::new(10, 4, 22, 12));
        assert!(RegionOfInterest::new(40, 0, 5, 5).clamp_to(32, 16).is_empty());
    }

    #[test]
    fn snapshot_is_overwritten_as_jpeg() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("last-image.jpg");

        gradient(16, 16).save_snapshot(&path)?;
        gradient(32, 8).save_snapshot(&path)?;

        let decoded = image::open(&path)?;
        assert_eq!(decoded.width(), 32);
        assert_eq!(decoded.height(), 8);
        Ok(())
    }
}
