//! DRM/KMS device access
//!
//! Owned wrappers around the mode-setting calls needed to find the scan-out
//! buffer of a plane and get CPU access to its pixels. Plane, property and
//! framebuffer queries go through the `drm` crate; the few buffer ioctls it
//! does not cover live in `ioctl`.

mod device;
pub mod format;
pub(crate) mod ioctl;
mod mapping;

pub use device::{DrmDevice, PlaneEnumerator};
pub use drm_fourcc::{DrmFourcc, DrmModifier};
pub use format::ModifierExt;
pub use mapping::{GemHandle, MappedRegion, PrimeBuffer};

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Hardware plane type, read from the plane's `type` property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneType {
    Overlay,
    Primary,
    Cursor,
    Unknown,
}

impl PlaneType {
    pub fn from_property(value: u64) -> Self {
        match value {
            0 => PlaneType::Overlay,
            1 => PlaneType::Primary,
            2 => PlaneType::Cursor,
            _ => PlaneType::Unknown,
        }
    }
}

impl fmt::Display for PlaneType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaneType::Overlay => write!(f, "overlay"),
            PlaneType::Primary => write!(f, "primary"),
            PlaneType::Cursor => write!(f, "cursor"),
            PlaneType::Unknown => write!(f, "unknown"),
        }
    }
}

/// Snapshot of one scan-out plane. Only valid until the next refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayPlane {
    pub plane_id: u32,
    pub crtc_id: u32,
    pub fb_id: u32,
    pub plane_type: PlaneType,
}

/// Framebuffer metadata returned by `GETFB2`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferDescriptor {
    pub fb_id: u32,
    pub width: u32,
    pub height: u32,
    pub pixel_format: DrmFourcc,
    pub modifier: DrmModifier,
    pub handles: [u32; 4],
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
}

impl FramebufferDescriptor {
    /// Number of leading non-zero buffer handles.
    pub fn plane_count(&self) -> usize {
        self.handles.iter().take_while(|h| **h != 0).count()
    }

    /// Bytes spanned by the largest plane, `max(offset + height * pitch)`.
    pub fn span(&self) -> usize {
        (0..4)
            .map(|i| self.offsets[i] as usize + self.height as usize * self.pitches[i] as usize)
            .max()
            .unwrap_or(0)
    }

    /// Size of a tightly packed 32bpp copy of this framebuffer.
    pub fn packed_size(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

/// DRM errors
#[derive(Debug)]
pub enum DrmError {
    /// The device node could not be opened
    Open(PathBuf, io::Error),
    /// An ioctl failed
    Ioctl(&'static str, io::Error),
    /// mmap of a buffer failed
    Map(io::Error),
    /// Plane lookup failed
    Plane(u32, io::Error),
    /// A null framebuffer id was passed
    NoFramebuffer,
    /// The framebuffer uses a fourcc `drm_fourcc` does not know
    UnknownFormat(u32, u32),
    /// The framebuffer exposes no buffer handle (missing CAP_SYS_ADMIN?)
    NoHandle(u32),
    /// Mapped size does not match the framebuffer geometry
    SizeMismatch { expected: usize, actual: usize },
}

impl fmt::Display for DrmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrmError::Open(path, e) => write!(f, "card {} open failed: {}", path.display(), e),
            DrmError::Ioctl(name, e) => write!(f, "DRM ioctl {} failed: {}", name, e),
            DrmError::Map(e) => write!(f, "Failed to mmap: {}", e),
            DrmError::Plane(id, e) => write!(f, "Failed to get plane {}: {}", id, e),
            DrmError::NoFramebuffer => write!(f, "No framebuffer attached"),
            DrmError::UnknownFormat(fb, code) => {
                write!(f, "Framebuffer {} has unknown fourcc {:#010x}", fb, code)
            }
            DrmError::NoHandle(fb) => write!(
                f,
                "No handle set on framebuffer {}: maybe you need some additional capabilities?",
                fb
            ),
            DrmError::SizeMismatch { expected, actual } => {
                write!(f, "Mapped size {} does not match expected {}", actual, expected)
            }
        }
    }
}

impl std::error::Error for DrmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DrmError::Open(_, e) | DrmError::Ioctl(_, e) | DrmError::Map(e) | DrmError::Plane(_, e) => {
                Some(e)
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DrmError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> FramebufferDescriptor {
        FramebufferDescriptor {
            fb_id: 42,
            width: 1920,
            height: 1080,
            pixel_format: DrmFourcc::Xrgb8888,
            modifier: DrmModifier::Linear,
            handles: [7, 0, 0, 0],
            pitches: [7680, 0, 0, 0],
            offsets: [0, 0, 0, 0],
        }
    }

    #[test]
    fn test_descriptor_sizes() {
        let fb = descriptor();
        assert_eq!(fb.plane_count(), 1);
        assert_eq!(fb.span(), 7680 * 1080);
        assert_eq!(fb.packed_size(), 1920 * 1080 * 4);
    }

    #[test]
    fn test_plane_type_property() {
        assert_eq!(PlaneType::from_property(2), PlaneType::Cursor);
        assert_eq!(PlaneType::from_property(1).to_string(), "primary");
        assert_eq!(PlaneType::from_property(114514), PlaneType::Unknown);
    }
}
