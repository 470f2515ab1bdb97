//! Format modifier helpers on top of `drm_fourcc`

use drm_fourcc::{DrmModifier, DrmVendor};

/// Low 56 bits of a modifier, the vendor-specific code
const MODIFIER_CODE_MASK: u64 = 0x00ff_ffff_ffff_ffff;

/// Intel modifier codes that carry a compression control surface
/// (Y/Yf CCS, gen12 RC/MC, DG2, MTL, LNL and BMG variants).
const INTEL_CCS_CODES: &[u64] = &[4, 5, 6, 7, 8, 10, 11, 12, 13, 14, 15, 16, 17];

/// Queries the capture path needs on a framebuffer modifier
pub trait ModifierExt {
    /// `DRM_FORMAT_MOD_NONE` and `DRM_FORMAT_MOD_LINEAR` share the value 0.
    fn is_linear(&self) -> bool;

    /// Intel render/media compression cannot be read back through an
    /// uncompressed import.
    fn is_intel_ccs(&self) -> bool;

    /// `VENDOR:name` for logs, falling back to the raw value.
    fn describe(&self) -> String;
}

impl ModifierExt for DrmModifier {
    fn is_linear(&self) -> bool {
        u64::from(*self) == 0
    }

    fn is_intel_ccs(&self) -> bool {
        matches!(self.vendor(), Ok(Some(DrmVendor::Intel)))
            && INTEL_CCS_CODES.contains(&(u64::from(*self) & MODIFIER_CODE_MASK))
    }

    fn describe(&self) -> String {
        let vendor = match self.vendor() {
            Ok(Some(vendor)) => format!("{:?}", vendor).to_uppercase(),
            Ok(None) => "NONE".to_string(),
            Err(_) => "UNKNOWN".to_string(),
        };
        match self {
            DrmModifier::Unrecognized(raw) => format!("{}:{:#x}", vendor, raw & MODIFIER_CODE_MASK),
            known => format!("{}:{:?}", vendor, known),
        }
    }
}
