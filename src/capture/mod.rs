//! KMS frame capture
//!
//! Locates the scan-out plane, picks a buffer-access strategy for the GPU
//! driver, and turns whatever the hardware holds into canonical RGBA frames
//! with dirty rectangles and an optional hardware cursor bitmap.

pub mod capturer;
pub mod convert;
pub mod cursor;
pub mod diff;
pub mod frame;
pub mod locator;
mod session;
pub mod strategy;

pub use capturer::{create_capturer, Capturer};
pub use cursor::CursorBitmap;
pub use diff::DirtyRect;
pub use frame::{CanonicalFrame, FrameStats};
pub use session::{CaptureSession, DumpMode, FramePipeline};

use crate::drm::{DrmError, DrmFourcc};
use crate::vaapi::VaError;
use convert::ConvertError;
use std::fmt;
use std::io;

/// Capture errors
#[derive(Debug)]
pub enum CaptureError {
    /// Device or buffer access failed
    Drm(DrmError),
    /// Hardware surface import or readback failed
    Va(VaError),
    /// A frame could not be converted
    Convert(ConvertError),
    /// No plane with a framebuffer on the requested CRTC
    NoPlane,
    /// The requested plane has no framebuffer attached
    NoFramebuffer(u32),
    /// Pixel format not handled by the selected driver path
    UnsupportedFormat { driver: String, format: DrmFourcc },
    /// Frame width cannot be de-tiled with the driver's tile geometry
    UnsupportedGeometry { width: u32, tile_width: u32 },
    /// The framebuffer has no pixels
    EmptyFramebuffer { width: u32, height: u32 },
    /// Writing a dump failed
    Io(io::Error),
    /// Encoding a PNG dump failed
    Image(image::ImageError),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::Drm(e) => write!(f, "{}", e),
            CaptureError::Va(e) => write!(f, "{}", e),
            CaptureError::Convert(e) => write!(f, "Conversion failed: {}", e),
            CaptureError::NoPlane => write!(f, "No usable planes found"),
            CaptureError::NoFramebuffer(plane) => {
                write!(f, "No framebuffer attached to plane {}", plane)
            }
            CaptureError::UnsupportedFormat { driver, format } => write!(
                f,
                "Unsupported pixel format {} for driver {}",
                format, driver
            ),
            CaptureError::UnsupportedGeometry { width, tile_width } => write!(
                f,
                "Frame width {} is not a multiple of tile width {}, unsupported",
                width, tile_width
            ),
            CaptureError::EmptyFramebuffer { width, height } => {
                write!(f, "Framebuffer is {}x{}, nothing to capture", width, height)
            }
            CaptureError::Io(e) => write!(f, "I/O error: {}", e),
            CaptureError::Image(e) => write!(f, "Image encoding failed: {}", e),
        }
    }
}

impl std::error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CaptureError::Drm(e) => Some(e),
            CaptureError::Va(e) => Some(e),
            CaptureError::Convert(e) => Some(e),
            CaptureError::Io(e) => Some(e),
            CaptureError::Image(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DrmError> for CaptureError {
    fn from(e: DrmError) -> Self {
        CaptureError::Drm(e)
    }
}

impl From<VaError> for CaptureError {
    fn from(e: VaError) -> Self {
        CaptureError::Va(e)
    }
}

impl From<ConvertError> for CaptureError {
    fn from(e: ConvertError) -> Self {
        CaptureError::Convert(e)
    }
}

impl From<io::Error> for CaptureError {
    fn from(e: io::Error) -> Self {
        CaptureError::Io(e)
    }
}

impl From<image::ImageError> for CaptureError {
    fn from(e: image::ImageError) -> Self {
        CaptureError::Image(e)
    }
}

pub type Result<T> = std::result::Result<T, CaptureError>;
