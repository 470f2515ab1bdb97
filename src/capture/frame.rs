//! Canonical frame data structure
//!
//! The single normalized representation every consumer sees: tightly
//! packed RGBA, top-left origin.

use std::fmt;

/// Bytes per canonical pixel
pub const BYTES_PER_PIXEL: usize = 4;

/// A width x height RGBA raster, row-major, no padding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalFrame {
    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,

    /// Pixel data, `width * height * 4` bytes
    pub data: Vec<u8>,
}

impl CanonicalFrame {
    /// Allocate a zeroed frame
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * BYTES_PER_PIXEL],
        }
    }

    /// Bytes in one row
    pub fn stride(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }

    /// Bytes of one row
    pub fn row(&self, y: u32) -> &[u8] {
        let stride = self.stride();
        let start = y as usize * stride;
        &self.data[start..start + stride]
    }

    /// RGBA value of one pixel
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL;
        [self.data[i], self.data[i + 1], self.data[i + 2], self.data[i + 3]]
    }
}

impl fmt::Display for CanonicalFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({}x{}, {} bytes)", self.width, self.height, self.data.len())
    }
}

/// Frame statistics for monitoring
#[derive(Debug, Default, Clone)]
pub struct FrameStats {
    /// Total frames captured
    pub total_frames: u64,

    /// Frames that produced a non-empty dirty rectangle
    pub changed_frames: u64,

    /// Frames whose capture or conversion failed
    pub failed_frames: u64,

    /// Total bytes converted
    pub total_bytes: u64,

    /// Total capture time in microseconds
    pub total_capture_time_us: u64,

    /// Last capture time in microseconds
    pub last_capture_time_us: u64,
}

impl FrameStats {
    /// Record a frame capture
    pub fn record_capture(&mut self, bytes: usize, time_us: u64, changed: bool) {
        self.total_frames += 1;
        if changed {
            self.changed_frames += 1;
        }
        self.total_bytes += bytes as u64;
        self.last_capture_time_us = time_us;
        self.total_capture_time_us += time_us;
    }

    pub fn record_failure(&mut self) {
        self.failed_frames += 1;
    }

    /// Mean capture time, 0 before the first frame
    pub fn average_capture_time_us(&self) -> u64 {
        if self.total_frames == 0 {
            0
        } else {
            self.total_capture_time_us / self.total_frames
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let mut frame = CanonicalFrame::new(3, 2);
        assert_eq!(frame.data.len(), 24);
        assert_eq!(frame.stride(), 12);
        frame.data[12..16].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(frame.pixel(0, 1), [1, 2, 3, 4]);
        assert_eq!(&frame.row(1)[..4], &[1, 2, 3, 4]);
        assert_eq!(frame.to_string(), "Frame(3x2, 24 bytes)");
    }

    #[test]
    fn test_stats_average() {
        let mut stats = FrameStats::default();
        assert_eq!(stats.average_capture_time_us(), 0);
        stats.record_capture(100, 10, true);
        stats.record_capture(100, 30, false);
        assert_eq!(stats.total_frames, 2);
        assert_eq!(stats.changed_frames, 1);
        assert_eq!(stats.average_capture_time_us(), 20);
    }
}
