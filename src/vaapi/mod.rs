//! VA-API hardware surface import
//!
//! Scan-out buffers on Intel and AMD are tiled or compressed in ways the CPU
//! cannot read directly. They are imported into VA-API as a surface and read
//! back through an image in a linear RGB layout negotiated with the driver.
//!
//! The driver is reached through [`SurfaceProvider`]; the libva binding is
//! only compiled with the `vaapi` feature.

mod importer;
#[cfg(feature = "vaapi")]
mod ffi;
#[cfg(feature = "vaapi")]
mod libva;

pub use importer::{open_provider, FetchMode, HardwareSurface, SurfaceOptions};
#[cfg(feature = "vaapi")]
pub use libva::LibvaProvider;

use crate::capture::convert::PixelLayout;
use crate::drm::{DrmFourcc, DrmModifier, FramebufferDescriptor};
use std::fmt;
use std::os::fd::RawFd;

/// `VA_RT_FORMAT_RGB32`
pub const RT_FORMAT_RGB32: u32 = 0x0002_0000;
/// `VA_RT_FORMAT_RGB32_10`
pub const RT_FORMAT_RGB32_10: u32 = 0x0020_0000;

/// libva fourcc code. VA names its packed RGB layouts by byte order
/// (`BGRX`, `RGBA`, ...), a different namespace from DRM fourccs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VaFourcc(pub u32);

impl VaFourcc {
    pub const fn from_chars(c: [u8; 4]) -> Self {
        VaFourcc(u32::from_le_bytes(c))
    }
}

impl fmt::Display for VaFourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.to_le_bytes() {
            let c = if c.is_ascii_graphic() || c == b' ' { c as char } else { '?' };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

/// Surface parameters derived from the framebuffer's DRM format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceFormat {
    pub surface_fourcc: VaFourcc,
    pub rt_format: u32,
    pub has_alpha: bool,
}

impl SourceFormat {
    pub fn for_drm(format: DrmFourcc) -> Result<Self> {
        let (surface_fourcc, rt_format, has_alpha) = match format {
            DrmFourcc::Xrgb8888 => (VaFourcc::from_chars(*b"BGRX"), RT_FORMAT_RGB32, false),
            DrmFourcc::Argb8888 => (VaFourcc::from_chars(*b"BGRA"), RT_FORMAT_RGB32, true),
            DrmFourcc::Xrgb2101010 => (VaFourcc::from_chars(*b"XR30"), RT_FORMAT_RGB32_10, false),
            DrmFourcc::Argb2101010 => (VaFourcc::from_chars(*b"AR30"), RT_FORMAT_RGB32_10, true),
            other => return Err(VaError::UnsupportedFormat(other)),
        };
        Ok(Self { surface_fourcc, rt_format, has_alpha })
    }
}

/// An image layout the importer knows how to convert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub fourcc: VaFourcc,
    pub rt_format: u32,
    pub has_alpha: bool,
    pub layout: PixelLayout,
}

const fn candidate(c: [u8; 4], rt_format: u32, has_alpha: bool, layout: PixelLayout) -> Candidate {
    Candidate { fourcc: VaFourcc::from_chars(c), rt_format, has_alpha, layout }
}

/// Image layouts in order of preference. RGB-ordered 8-bit layouts come
/// first since RGBA needs no reordering at all.
pub const CANDIDATE_FORMATS: [Candidate; 12] = [
    candidate(*b"RGBX", RT_FORMAT_RGB32, false, PixelLayout::RGBX),
    candidate(*b"RGBA", RT_FORMAT_RGB32, true, PixelLayout::RGBA),
    candidate(*b"XRGB", RT_FORMAT_RGB32, false, PixelLayout::XRGB),
    candidate(*b"ARGB", RT_FORMAT_RGB32, true, PixelLayout::ARGB),
    candidate(*b"BGRX", RT_FORMAT_RGB32, false, PixelLayout::BGRX),
    candidate(*b"BGRA", RT_FORMAT_RGB32, true, PixelLayout::BGRA),
    candidate(*b"XBGR", RT_FORMAT_RGB32, false, PixelLayout::XBGR),
    candidate(*b"ABGR", RT_FORMAT_RGB32, true, PixelLayout::ABGR),
    candidate(*b"XR30", RT_FORMAT_RGB32_10, false, PixelLayout::X2R10G10B10),
    candidate(*b"AR30", RT_FORMAT_RGB32_10, true, PixelLayout::A2R10G10B10),
    candidate(*b"XB30", RT_FORMAT_RGB32_10, false, PixelLayout::X2B10G10R10),
    candidate(*b"AB30", RT_FORMAT_RGB32_10, true, PixelLayout::A2B10G10R10),
];

/// Look up a candidate by image fourcc.
pub fn find_candidate(fourcc: VaFourcc) -> Option<&'static Candidate> {
    CANDIDATE_FORMATS.iter().find(|c| c.fourcc == fourcc)
}

/// An image format reported by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageFormat {
    pub fourcc: VaFourcc,
    /// 1 = LSB first, 2 = MSB first
    pub byte_order: u32,
    pub bits_per_pixel: u32,
    pub depth: u32,
    pub red_mask: u32,
    pub green_mask: u32,
    pub blue_mask: u32,
    pub alpha_mask: u32,
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} bpp {} depth {} masks r {:#x} g {:#x} b {:#x} a {:#x}",
            self.fourcc,
            if self.byte_order == 1 { "LSB" } else { "MSB" },
            self.bits_per_pixel,
            self.depth,
            self.red_mask,
            self.green_mask,
            self.blue_mask,
            self.alpha_mask
        )
    }
}

/// A created or derived image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    /// Row pitch of the first plane in bytes
    pub pitch: u32,
    /// Offset of the first plane in the image buffer
    pub offset: u32,
    pub data_size: u32,
}

/// Which external-memory path is used to create the surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Multi-plane `VADRMPRIMESurfaceDescriptor`
    Prime2,
    /// Legacy single-buffer `VASurfaceAttribExternalBuffers`
    Prime,
}

impl fmt::Display for ImportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportMode::Prime2 => write!(f, "DRM_PRIME_2"),
            ImportMode::Prime => write!(f, "DRM_PRIME"),
        }
    }
}

/// Description of a dma-buf to wrap as a surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimeImport {
    pub fd: RawFd,
    pub width: u32,
    pub height: u32,
    pub drm_format: DrmFourcc,
    pub surface_fourcc: VaFourcc,
    pub rt_format: u32,
    pub modifier: DrmModifier,
    /// `max(offset + height * pitch)` over all planes
    pub object_size: u32,
    pub num_planes: u32,
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
}

impl PrimeImport {
    pub fn new(fd: RawFd, fb: &FramebufferDescriptor, source: &SourceFormat) -> Self {
        Self {
            fd,
            width: fb.width,
            height: fb.height,
            drm_format: fb.pixel_format,
            surface_fourcc: source.surface_fourcc,
            rt_format: source.rt_format,
            modifier: fb.modifier,
            object_size: fb.span() as u32,
            num_planes: fb.plane_count() as u32,
            pitches: fb.pitches,
            offsets: fb.offsets,
        }
    }
}

/// Driver-side operations the importer needs.
///
/// A provider owns at most one surface and one image at a time and releases
/// whatever it still holds, in reverse order, when dropped.
pub trait SurfaceProvider {
    /// Driver vendor string
    fn vendor(&self) -> String;

    /// Wrap the dma-buf described by `desc` as the provider's surface.
    fn import(&mut self, desc: &PrimeImport, mode: ImportMode) -> Result<()>;

    /// Image formats the driver supports
    fn image_formats(&mut self) -> Result<Vec<ImageFormat>>;

    /// Derive an image sharing the surface's memory.
    fn derive_image(&mut self) -> Result<ImageInfo>;

    /// Create a standalone image the surface can be copied into.
    fn create_image(&mut self, format: &ImageFormat, width: u32, height: u32) -> Result<ImageInfo>;

    /// Map the current image for CPU reads.
    fn map_image(&mut self) -> Result<()>;

    /// Copy the surface contents into the current image.
    fn copy_to_image(&mut self) -> Result<()>;

    /// Wait for pending work on the surface before reading derived memory.
    fn sync_surface(&mut self) -> Result<()>;

    /// Bytes of the mapped image
    fn mapped(&self) -> Option<&[u8]>;

    /// Unmap and destroy the current image, if any.
    fn release_image(&mut self);
}

/// VA-API errors
#[derive(Debug)]
pub enum VaError {
    /// Built without the `vaapi` feature
    FeatureDisabled,
    /// Display could not be created or initialized
    Display(String),
    /// A libva call returned a failure status
    Call { call: &'static str, status: i32, message: String },
    /// DRM format has no surface equivalent
    UnsupportedFormat(DrmFourcc),
    /// No candidate image layout could be created, mapped and filled
    NoUsableFormat,
    /// Fetch without a mapped image
    NotMapped,
    /// Mapped image smaller than its geometry claims
    ShortImage { needed: usize, actual: usize },
}

impl fmt::Display for VaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VaError::FeatureDisabled => {
                write!(f, "VA-API support not compiled in (enable the `vaapi` feature)")
            }
            VaError::Display(msg) => write!(f, "VA display error: {}", msg),
            VaError::Call { call, status, message } => {
                write!(f, "{} failed: {:#x} {}", call, status, message)
            }
            VaError::UnsupportedFormat(format) => write!(
                f,
                "Unsupported pixel format {} for VA-API, please report your pixel format",
                format
            ),
            VaError::NoUsableFormat => write!(f, "Failed to get a VA-API image"),
            VaError::NotMapped => write!(f, "VA-API image is not mapped"),
            VaError::ShortImage { needed, actual } => {
                write!(f, "VA-API image has {} bytes, {} needed", actual, needed)
            }
        }
    }
}

impl std::error::Error for VaError {}

pub type Result<T> = std::result::Result<T, VaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_format_mapping() {
        let xr24 = SourceFormat::for_drm(DrmFourcc::Xrgb8888).unwrap();
        assert_eq!(xr24.surface_fourcc.to_string(), "BGRX");
        assert_eq!((xr24.rt_format, xr24.has_alpha), (RT_FORMAT_RGB32, false));

        let ar30 = SourceFormat::for_drm(DrmFourcc::Argb2101010).unwrap();
        assert_eq!(ar30.surface_fourcc, VaFourcc::from_chars(*b"AR30"));
        assert_eq!(ar30.surface_fourcc.0, DrmFourcc::Argb2101010 as u32);
        assert_eq!((ar30.rt_format, ar30.has_alpha), (RT_FORMAT_RGB32_10, true));

        assert!(matches!(
            SourceFormat::for_drm(DrmFourcc::Xbgr8888),
            Err(VaError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_candidate_order() {
        let names: Vec<String> = CANDIDATE_FORMATS.iter().map(|c| c.fourcc.to_string()).collect();
        assert_eq!(
            names,
            ["RGBX", "RGBA", "XRGB", "ARGB", "BGRX", "BGRA", "XBGR", "ABGR", "XR30", "AR30", "XB30", "AB30"]
        );
        for c in CANDIDATE_FORMATS.iter() {
            assert_eq!(c.has_alpha, c.layout.has_alpha, "{}", c.fourcc);
        }
        assert_eq!(find_candidate(VaFourcc::from_chars(*b"BGRA")).map(|c| c.layout), Some(PixelLayout::BGRA));
        assert!(find_candidate(VaFourcc::from_chars(*b"NV12")).is_none());
    }

    #[test]
    fn test_prime_import_descriptor() {
        let fb = FramebufferDescriptor {
            fb_id: 3,
            width: 100,
            height: 10,
            pixel_format: DrmFourcc::Xrgb8888,
            modifier: DrmModifier::from(0x0100_0000_0000_0004u64),
            handles: [4, 4, 0, 0],
            pitches: [512, 128, 0, 0],
            offsets: [0, 8192, 0, 0],
        };
        let source = SourceFormat::for_drm(fb.pixel_format).unwrap();
        let desc = PrimeImport::new(9, &fb, &source);
        assert_eq!(desc.num_planes, 2);
        assert_eq!(desc.object_size, 8192 + 1280);
        assert_eq!(desc.surface_fourcc.to_string(), "BGRX");
    }
}
