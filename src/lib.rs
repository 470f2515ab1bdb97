//! kmscap - DRM/KMS framebuffer capture
//!
//! Reads the scan-out buffer of a display plane on Linux, normalizes it to
//! RGBA whatever the GPU vendor's layout, and tracks changed regions and the
//! hardware cursor.

pub mod capture;
pub mod config;
pub mod drm;
pub mod vaapi;

// Re-exports
pub use capture::{CanonicalFrame, CaptureError, CaptureSession, CursorBitmap, DirtyRect, DumpMode};
pub use config::{CaptureConfig, Config};
