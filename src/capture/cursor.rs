//! Hardware cursor plane extraction
//!
//! The cursor plane is read like a tiny linear framebuffer, converted with
//! cursor alpha rules and cropped to its visibly opaque area.

use super::convert::{convert_linear, AlphaMode, PixelLayout};
use super::frame::BYTES_PER_PIXEL;
use crate::drm::{DisplayPlane, DrmDevice, DrmError, DrmFourcc, MappedRegion, ModifierExt};
use log::debug;
use std::os::fd::AsRawFd;
use xxhash_rust::xxh64::xxh64;

/// Pixels with alpha above this (about 63%) belong to the cursor shape
pub const CURSOR_ALPHA_THRESHOLD: u8 = 160;

/// Cursor formats that carry alpha
const CURSOR_FORMATS: &[DrmFourcc] = &[DrmFourcc::Argb8888, DrmFourcc::Argb2101010];

/// Cropped cursor image with a matching opacity mask
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorBitmap {
    pub width: u32,
    pub height: u32,
    /// Top-left of the crop inside the cursor buffer
    pub origin_x: u32,
    pub origin_y: u32,
    /// `width * height` RGBA pixels
    pub pixels: Vec<u8>,
    /// `width * height` entries, true where alpha exceeds the threshold
    pub mask: Vec<bool>,
}

impl CursorBitmap {
    /// Mask packed MSB-first, each row padded to a whole byte
    pub fn packed_mask(&self) -> Vec<u8> {
        if self.width == 0 {
            return Vec::new();
        }
        let row_bytes = (self.width as usize).div_ceil(8);
        let mut out = vec![0u8; row_bytes * self.height as usize];
        for (y, row) in self.mask.chunks_exact(self.width as usize).enumerate() {
            for (x, set) in row.iter().enumerate() {
                if *set {
                    out[y * row_bytes + x / 8] |= 0x80 >> (x % 8);
                }
            }
        }
        out
    }
}

/// Crop canonical RGBA cursor pixels to the bounding box of opaque pixels.
/// `None` means nothing is visible.
pub fn extract_bitmap(rgba: &[u8], width: u32, height: u32) -> Option<CursorBitmap> {
    let (w, h) = (width as usize, height as usize);
    if rgba.len() < w * h * BYTES_PER_PIXEL {
        return None;
    }
    let opaque = |x: usize, y: usize| rgba[(y * w + x) * BYTES_PER_PIXEL + 3] > CURSOR_ALPHA_THRESHOLD;

    let mut bounds: Option<(usize, usize, usize, usize)> = None;
    for y in 0..h {
        for x in 0..w {
            if opaque(x, y) {
                bounds = Some(match bounds {
                    None => (x, y, x, y),
                    Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
                });
            }
        }
    }
    let (x0, y0, x1, y1) = bounds?;

    let (cw, ch) = (x1 - x0 + 1, y1 - y0 + 1);
    let mut pixels = Vec::with_capacity(cw * ch * BYTES_PER_PIXEL);
    let mut mask = Vec::with_capacity(cw * ch);
    for y in y0..=y1 {
        let start = (y * w + x0) * BYTES_PER_PIXEL;
        pixels.extend_from_slice(&rgba[start..start + cw * BYTES_PER_PIXEL]);
        mask.extend((x0..=x1).map(|x| opaque(x, y)));
    }

    Some(CursorBitmap {
        width: cw as u32,
        height: ch as u32,
        origin_x: x0 as u32,
        origin_y: y0 as u32,
        pixels,
        mask,
    })
}

/// Read the cursor plane's current framebuffer and extract its bitmap.
///
/// Unsupported formats, tiled buffers and mapping failures are soft: they
/// are logged and yield `None`.
pub fn sample(device: &DrmDevice, plane: &DisplayPlane) -> Option<CursorBitmap> {
    if plane.fb_id == 0 {
        return None;
    }
    match read_cursor(device, plane) {
        Ok(bitmap) => bitmap,
        Err(e) => {
            debug!("Cursor plane {} unavailable: {}", plane.plane_id, e);
            None
        }
    }
}

fn read_cursor(device: &DrmDevice, plane: &DisplayPlane) -> Result<Option<CursorBitmap>, DrmError> {
    let fb = device.framebuffer(plane.fb_id)?;
    if !fb.modifier.is_linear() {
        debug!("Cursor framebuffer {} has non-linear modifier {}", fb.fb_id, fb.modifier.describe());
        return Ok(None);
    }
    let layout = match PixelLayout::from_drm(fb.pixel_format) {
        Some(layout) if CURSOR_FORMATS.contains(&fb.pixel_format) => layout,
        _ => {
            debug!("Cursor framebuffer {} has unsupported format {}", fb.fb_id, fb.pixel_format);
            return Ok(None);
        }
    };
    if fb.handles[0] == 0 {
        return Err(DrmError::NoHandle(fb.fb_id));
    }

    let gem = device.open_gem(fb.handles[0])?;
    let offset = device.map_dumb_offset(&gem)?;
    let expected = fb.packed_size();
    if gem.size() as usize != expected {
        return Err(DrmError::SizeMismatch { expected, actual: gem.size() as usize });
    }
    let region = MappedRegion::map(device.as_raw_fd(), expected, offset)?;

    let mut rgba = vec![0u8; expected];
    let pitch = fb.width as usize * BYTES_PER_PIXEL;
    if let Err(e) = convert_linear(
        layout,
        AlphaMode::Cursor,
        region.as_slice(),
        fb.width,
        fb.height,
        pitch,
        &mut rgba,
    ) {
        debug!("Cursor conversion failed: {}", e);
        return Ok(None);
    }
    Ok(extract_bitmap(&rgba, fb.width, fb.height))
}

/// Remembers the last published cursor so unchanged shapes are skipped
#[derive(Debug, Default)]
pub struct CursorTracker {
    last_hash: Option<u64>,
}

const CURSOR_HASH_SEED: u64 = 0x6b6d_7363_6375_7273;

impl CursorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the bitmap only if it differs from the last one seen. A
    /// vanished cursor resets the tracker so its reappearance is reported.
    pub fn update(&mut self, bitmap: Option<CursorBitmap>) -> Option<CursorBitmap> {
        let bitmap = match bitmap {
            Some(b) => b,
            None => {
                self.last_hash = None;
                return None;
            }
        };
        let hash = hash_bitmap(&bitmap);
        if self.last_hash == Some(hash) {
            return None;
        }
        self.last_hash = Some(hash);
        Some(bitmap)
    }
}

fn hash_bitmap(bitmap: &CursorBitmap) -> u64 {
    let mut header = [0u8; 16];
    header[..4].copy_from_slice(&bitmap.width.to_le_bytes());
    header[4..8].copy_from_slice(&bitmap.height.to_le_bytes());
    header[8..12].copy_from_slice(&bitmap.origin_x.to_le_bytes());
    header[12..].copy_from_slice(&bitmap.origin_y.to_le_bytes());
    xxh64(&bitmap.pixels, xxh64(&header, CURSOR_HASH_SEED))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canvas(width: u32, height: u32) -> Vec<u8> {
        vec![0u8; (width * height) as usize * BYTES_PER_PIXEL]
    }

    fn set(rgba: &mut [u8], width: u32, x: u32, y: u32, px: [u8; 4]) {
        let i = ((y * width + x) as usize) * BYTES_PER_PIXEL;
        rgba[i..i + 4].copy_from_slice(&px);
    }

    #[test]
    fn test_transparent_cursor_is_none() {
        let mut rgba = canvas(64, 64);
        set(&mut rgba, 64, 10, 10, [255, 255, 255, CURSOR_ALPHA_THRESHOLD]);
        assert_eq!(extract_bitmap(&rgba, 64, 64), None);
    }

    #[test]
    fn test_single_opaque_pixel() {
        let mut rgba = canvas(64, 64);
        set(&mut rgba, 64, 5, 9, [1, 2, 3, 255]);
        let bitmap = extract_bitmap(&rgba, 64, 64).expect("cursor");
        assert_eq!((bitmap.width, bitmap.height), (1, 1));
        assert_eq!((bitmap.origin_x, bitmap.origin_y), (5, 9));
        assert_eq!(bitmap.pixels, vec![1, 2, 3, 255]);
        assert_eq!(bitmap.mask, vec![true]);
        assert_eq!(bitmap.packed_mask(), vec![0x80]);
    }

    #[test]
    fn test_empty_cursor_canvas() {
        assert_eq!(extract_bitmap(&[], 0, 64), None);
        let empty = CursorBitmap {
            width: 0,
            height: 4,
            origin_x: 0,
            origin_y: 0,
            pixels: Vec::new(),
            mask: Vec::new(),
        };
        assert!(empty.packed_mask().is_empty());
    }

    #[test]
    fn test_crop_keeps_translucent_pixels_inside_box() {
        let mut rgba = canvas(8, 8);
        set(&mut rgba, 8, 1, 1, [9, 9, 9, 200]);
        set(&mut rgba, 8, 3, 2, [9, 9, 9, 255]);
        set(&mut rgba, 8, 2, 1, [7, 7, 7, 100]);
        let bitmap = extract_bitmap(&rgba, 8, 8).expect("cursor");
        assert_eq!((bitmap.width, bitmap.height), (3, 2));
        assert_eq!(bitmap.mask, vec![true, false, false, false, false, true]);
        assert_eq!(&bitmap.pixels[4..8], &[7, 7, 7, 100]);
        assert_eq!(bitmap.packed_mask(), vec![0x80, 0x20]);
    }

    #[test]
    fn test_tracker_reports_changes_only() {
        let mut rgba = canvas(4, 4);
        set(&mut rgba, 4, 0, 0, [1, 1, 1, 255]);
        let first = extract_bitmap(&rgba, 4, 4);
        let mut tracker = CursorTracker::new();
        assert!(tracker.update(first.clone()).is_some());
        assert!(tracker.update(first.clone()).is_none());

        set(&mut rgba, 4, 0, 0, [2, 1, 1, 255]);
        assert!(tracker.update(extract_bitmap(&rgba, 4, 4)).is_some());

        assert!(tracker.update(None).is_none());
        assert!(tracker.update(first).is_some());
    }
}
