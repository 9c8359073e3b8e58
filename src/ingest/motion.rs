//! Frame-difference motion hints for network cameras.
//!
//! The detector keeps a coarse luminance grid of the previous frame and
//! reports one bounding region around the blocks that changed. It is a hint
//! for operators and logs; the relay still submits the whole frame.

use crate::frame::{Frame, RegionOfInterest};

const DEFAULT_BLOCK_SIZE: u32 = 16;
const DEFAULT_THRESHOLD: u8 = 24;

struct LumaGrid {
    width: u32,
    height: u32,
    cols: u32,
    rows: u32,
    cells: Vec<u8>,
}

pub struct MotionDetector {
    block_size: u32,
    threshold: u8,
    previous: Option<LumaGrid>,
}

impl MotionDetector {
    pub fn new() -> Self {
        Self::with_params(DEFAULT_BLOCK_SIZE, DEFAULT_THRESHOLD)
    }

    /// `block_size` is the side of the square cells in pixels; a cell counts as
    /// changed when its mean luminance moved by more than `threshold`.
    pub fn with_params(block_size: u32, threshold: u8) -> Self {
        Self {
            block_size: block_size.max(1),
            threshold,
            previous: None,
        }
    }

    /// Compare `frame` against the previous one and remember it.
    ///
    /// Returns no regions for the first frame or after a resolution change.
    pub fn update(&mut self, frame: &Frame) -> Vec<RegionOfInterest> {
        let grid = self.grid(frame);
        let regions = match &self.previous {
            Some(prev) if prev.width == grid.width && prev.height == grid.height => {
                self.changed_region(prev, &grid).into_iter().collect()
            }
            _ => Vec::new(),
        };
        self.previous = Some(grid);
        regions
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }

    fn grid(&self, frame: &Frame) -> LumaGrid {
        let cols = frame.width.div_ceil(self.block_size);
        let rows = frame.height.div_ceil(self.block_size);
        let mut cells = Vec::with_capacity((cols * rows) as usize);
        for row in 0..rows {
            for col in 0..cols {
                let x0 = col * self.block_size;
                let y0 = row * self.block_size;
                let x1 = (x0 + self.block_size).min(frame.width);
                let y1 = (y0 + self.block_size).min(frame.height);
                let mut sum = 0u64;
                for y in y0..y1 {
                    for x in x0..x1 {
                        sum += frame.luma(x, y) as u64;
                    }
                }
                let count = ((x1 - x0) * (y1 - y0)).max(1) as u64;
                cells.push((sum / count) as u8);
            }
        }
        LumaGrid {
            width: frame.width,
            height: frame.height,
            cols,
            rows,
            cells,
        }
    }

    fn changed_region(&self, prev: &LumaGrid, current: &LumaGrid) -> Option<RegionOfInterest> {
        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        for row in 0..current.rows {
            for col in 0..current.cols {
                let idx = (row * current.cols + col) as usize;
                if prev.cells[idx].abs_diff(current.cells[idx]) <= self.threshold {
                    continue;
                }
                bounds = Some(match bounds {
                    None => (col, row, col, row),
                    Some((c0, r0, c1, r1)) => (c0.min(col), r0.min(row), c1.max(col), r1.max(row)),
                });
            }
        }
        let (c0, r0, c1, r1) = bounds?;
        let roi = RegionOfInterest::new(
            c0 * self.block_size,
            r0 * self.block_size,
            (c1 - c0 + 1) * self.block_size,
            (r1 - r0 + 1) * self.block_size,
        );
        Some(roi.clamp_to(current.width, current.height))
    }
}

impl Default for MotionDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(width: u32, height: u32, value: u8) -> Vec<u8> {
        vec![value; (width * height) as usize]
    }

    fn gray(data: Vec<u8>, width: u32, height: u32) -> Frame {
        Frame::new(data, width, height, 1).unwrap()
    }

    #[test]
    fn first_frame_has_no_motion() {
        let mut detector = MotionDetector::with_params(4, 10);
        assert!(detector.update(&gray(flat(16, 16, 0), 16, 16)).is_empty());
    }

    #[test]
    fn static_scene_has_no_motion() {
        let mut detector = MotionDetector::with_params(4, 10);
        detector.update(&gray(flat(16, 16, 40), 16, 16));
        assert!(detector.update(&gray(flat(16, 16, 42), 16, 16)).is_empty());
    }

    #[test]
    fn changed_blocks_are_bounded() {
        let mut detector = MotionDetector::with_params(4, 10);
        detector.update(&gray(flat(16, 16, 0), 16, 16));

        // Brighten the block at column 2, row 1 and the one at column 3, row 2.
        let mut data = flat(16, 16, 0);
        for y in 4..8 {
            for x in 8..12 {
                data[y * 16 + x] = 200;
            }
        }
        for y in 8..12 {
            for x in 12..16 {
                data[y * 16 + x] = 200;
            }
        }
        let regions = detector.update(&gray(data, 16, 16));
        assert_eq!(regions, vec![RegionOfInterest::new(8, 4, 8, 8)]);
    }

    #[test]
    fn partial_edge_blocks_are_clamped() {
        let mut detector = MotionDetector::with_params(8, 10);
        detector.update(&gray(flat(10, 10, 0), 10, 10));
        let regions = detector.update(&gray(flat(10, 10, 255), 10, 10));
        assert_eq!(regions, vec![RegionOfInterest::new(0, 0, 10, 10)]);
    }

    #[test]
    fn resolution_change_resets_comparison() {
        let mut detector = MotionDetector::with_params(4, 10);
        detector.update(&gray(flat(16, 16, 0), 16, 16));
        assert!(detector.update(&gray(flat(8, 8, 255), 8, 8)).is_empty());
    }
}
