//! Buffer-access strategy selection
//!
//! Decides, from the kernel driver name and the framebuffer's format and
//! modifier alone, how pixels get from the GPU into CPU memory and which
//! conversion they need once there.

use super::convert::{ConversionKind, PixelLayout, TileGeometry};
use super::{CaptureError, Result};
use crate::drm::{DrmFourcc, DrmModifier, FramebufferDescriptor, ModifierExt};
use std::fmt;

/// How the framebuffer is made CPU-visible
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferAccess {
    /// `MODE_MAP_DUMB` on a flink-reopened handle
    DumbMap,
    /// mmap of an exported dma-buf
    PrimeMap,
    /// i915 GTT aperture mapping
    I915Gtt,
    /// Imported into VA-API and read back through an image
    HardwareSurface,
}

impl fmt::Display for BufferAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferAccess::DumbMap => write!(f, "dumb map"),
            BufferAccess::PrimeMap => write!(f, "PRIME map"),
            BufferAccess::I915Gtt => write!(f, "i915 GTT map"),
            BufferAccess::HardwareSurface => write!(f, "hardware surface"),
        }
    }
}

/// Explicit synchronization around each CPU read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    None,
    DmaBuf,
}

/// Non-fatal diagnostics attached to a plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advisory {
    /// Intel render compression; the image is likely garbage without a
    /// compositor-side modifier change
    IntelCompression(DrmModifier),
    /// The proprietary driver path is slow
    NvidiaPerformance,
    /// A tiled buffer is read as if linear
    NonLinearModifier(DrmModifier),
    /// Driver never exercised, dumb-map fallback
    UntestedDriver(String),
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Advisory::IntelCompression(m) => write!(
                f,
                "Framebuffer uses Intel render compression ({}). Set INTEL_DEBUG=norbc in the compositor environment",
                m.describe()
            ),
            Advisory::NvidiaPerformance => write!(
                f,
                "nvidia-drm: buffers are read through a dumb mapping, expect high CPU usage"
            ),
            Advisory::NonLinearModifier(m) => write!(
                f,
                "Non-linear modifier {} is not supported for this driver, image may be garbled",
                m.describe()
            ),
            Advisory::UntestedDriver(name) => {
                write!(f, "Untested driver {}, falling back to dumb buffer mapping", name)
            }
        }
    }
}

/// Everything the session needs to know to capture one framebuffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionPlan {
    pub access: BufferAccess,
    pub conversion: ConversionKind,
    pub sync: SyncMode,
    /// Memory layout of the framebuffer pixels
    pub layout: PixelLayout,
    pub advisories: Vec<Advisory>,
}

impl ConversionPlan {
    /// Reject frame geometries the chosen conversion cannot handle.
    pub fn check_geometry(&self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(CaptureError::EmptyFramebuffer { width, height });
        }
        if let ConversionKind::XTiled(tile) = self.conversion {
            if tile.width == 0 || width % tile.width != 0 {
                return Err(CaptureError::UnsupportedGeometry { width, tile_width: tile.width });
            }
        }
        Ok(())
    }
}

/// 8-bit formats every CPU-mapped path understands
const MAPPED_FORMATS: &[DrmFourcc] = &[DrmFourcc::Xrgb8888, DrmFourcc::Argb8888];

/// Formats the hardware surface importer can import
const SURFACE_FORMATS: &[DrmFourcc] = &[
    DrmFourcc::Xrgb8888,
    DrmFourcc::Argb8888,
    DrmFourcc::Xrgb2101010,
    DrmFourcc::Argb2101010,
];

/// Choose the access strategy for `driver`. Pure: the same inputs always
/// give the same plan.
pub fn select(driver: &str, fb: &FramebufferDescriptor) -> Result<ConversionPlan> {
    let modifier = fb.modifier;
    let mut advisories = Vec::new();

    let (access, conversion, sync, whitelist) = match driver {
        "i915" | "amdgpu" => {
            if modifier.is_intel_ccs() {
                advisories.push(Advisory::IntelCompression(modifier));
            }
            (BufferAccess::HardwareSurface, ConversionKind::Surface, SyncMode::None, SURFACE_FORMATS)
        }
        "nvidia-drm" => {
            advisories.push(Advisory::NvidiaPerformance);
            let conversion = if modifier.is_linear() {
                ConversionKind::Linear
            } else {
                ConversionKind::XTiled(TileGeometry::NVIDIA)
            };
            (BufferAccess::DumbMap, conversion, SyncMode::None, MAPPED_FORMATS)
        }
        "vmwgfx" | "vboxvideo" | "virtio_gpu" => {
            if !modifier.is_linear() {
                advisories.push(Advisory::NonLinearModifier(modifier));
            }
            (BufferAccess::DumbMap, ConversionKind::Linear, SyncMode::None, MAPPED_FORMATS)
        }
        "test-prime" => (BufferAccess::PrimeMap, ConversionKind::Linear, SyncMode::DmaBuf, MAPPED_FORMATS),
        "test-map-dumb" => (BufferAccess::DumbMap, ConversionKind::Linear, SyncMode::None, MAPPED_FORMATS),
        "test-i915-gem" => (BufferAccess::I915Gtt, ConversionKind::Linear, SyncMode::None, MAPPED_FORMATS),
        "test-i915-prime-xtiled" => (
            BufferAccess::PrimeMap,
            ConversionKind::XTiled(TileGeometry::INTEL_X),
            SyncMode::DmaBuf,
            MAPPED_FORMATS,
        ),
        other => {
            advisories.push(Advisory::UntestedDriver(other.to_string()));
            if !modifier.is_linear() {
                advisories.push(Advisory::NonLinearModifier(modifier));
            }
            (BufferAccess::DumbMap, ConversionKind::Linear, SyncMode::None, MAPPED_FORMATS)
        }
    };

    let layout = match PixelLayout::from_drm(fb.pixel_format) {
        Some(layout) if whitelist.contains(&fb.pixel_format) => layout,
        _ => {
            return Err(CaptureError::UnsupportedFormat {
                driver: driver.to_string(),
                format: fb.pixel_format,
            })
        }
    };

    Ok(ConversionPlan { access, conversion, sync, layout, advisories })
}
