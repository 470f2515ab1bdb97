//! Screen capture abstraction
//!
//! The pull interface a remote-display loop drives, independent of how the
//! frames are obtained.

use super::cursor::CursorBitmap;
use super::diff::DirtyRect;
use super::frame::{CanonicalFrame, FrameStats};
use super::{CaptureSession, Result};
use crate::config::CaptureConfig;

/// Trait for screen capture implementations
pub trait Capturer {
    /// Produce the next frame and report what changed
    fn next_frame(&mut self) -> Result<Option<DirtyRect>>;

    /// The last good frame
    fn frame(&self) -> &CanonicalFrame;

    /// Produce the cursor bitmap if it is due and has changed
    fn next_cursor(&mut self) -> Option<CursorBitmap>;

    /// Get capture statistics
    fn stats(&self) -> FrameStats;

    /// Frame width and height in pixels
    fn dimensions(&self) -> (u32, u32);
}

impl Capturer for CaptureSession {
    fn next_frame(&mut self) -> Result<Option<DirtyRect>> {
        CaptureSession::next_frame(self)
    }

    fn frame(&self) -> &CanonicalFrame {
        CaptureSession::frame(self)
    }

    fn next_cursor(&mut self) -> Option<CursorBitmap> {
        CaptureSession::next_cursor(self)
    }

    fn stats(&self) -> FrameStats {
        CaptureSession::stats(self).clone()
    }

    fn dimensions(&self) -> (u32, u32) {
        CaptureSession::dimensions(self)
    }
}

/// Create a capturer
pub fn create_capturer(config: &CaptureConfig) -> Result<Box<dyn Capturer>> {
    Ok(Box::new(CaptureSession::open(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureError;
    use crate::drm::DrmError;

    #[test]
    fn test_create_capturer_reports_open_failure() {
        let config = CaptureConfig { device: "/nonexistent/dri/card5".into(), ..Default::default() };
        match create_capturer(&config) {
            Err(CaptureError::Drm(DrmError::Open(path, _))) => {
                assert_eq!(path, std::path::PathBuf::from("/nonexistent/dri/card5"))
            }
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("capturer opened a missing device"),
        }
    }
}
