//! Dirty-region detection between successive frames
//!
//! Frames are compared in 8-byte words (two pixels), so the reported
//! rectangle is exact in y and may be one pixel wider than the change in x.

use super::frame::{CanonicalFrame, BYTES_PER_PIXEL};

const WORD: usize = 2 * BYTES_PER_PIXEL;

/// Inclusive pixel bounding box of changed content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyRect {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl DirtyRect {
    /// Rectangle covering a whole frame
    pub fn full(width: u32, height: u32) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }
        Some(Self { min_x: 0, min_y: 0, max_x: width - 1, max_y: height - 1 })
    }

    pub fn width(&self) -> u32 {
        self.max_x - self.min_x + 1
    }

    pub fn height(&self) -> u32 {
        self.max_y - self.min_y + 1
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        (self.min_x..=self.max_x).contains(&x) && (self.min_y..=self.max_y).contains(&y)
    }

    /// `(x1, y1, x2, y2)` with exclusive lower-right corner, the form most
    /// remote framebuffer servers take for "mark rect as modified".
    pub fn to_exclusive(&self) -> (u32, u32, u32, u32) {
        (self.min_x, self.min_y, self.max_x + 1, self.max_y + 1)
    }
}

/// Compare `current` against `previous`, update `previous` with the changed
/// rows and return the dirty rectangle, or `None` if nothing changed.
///
/// With `compare` disabled, or an odd frame width, the whole frame is copied
/// and reported dirty.
pub fn diff_frames(
    current: &CanonicalFrame,
    previous: &mut CanonicalFrame,
    compare: bool,
) -> Option<DirtyRect> {
    let (width, height) = (current.width, current.height);
    if previous.width != width || previous.height != height {
        *previous = current.clone();
        return DirtyRect::full(width, height);
    }
    if !compare || width % 2 != 0 {
        previous.data.copy_from_slice(&current.data);
        return DirtyRect::full(width, height);
    }

    let stride = current.stride();
    if stride == 0 || height == 0 {
        return None;
    }
    let mut bounds: Option<DirtyRect> = None;
    for (y, (cur_row, prev_row)) in current
        .data
        .chunks_exact(stride)
        .zip(previous.data.chunks_exact(stride))
        .enumerate()
    {
        if cur_row == prev_row {
            continue;
        }
        let mut words = cur_row.chunks_exact(WORD).zip(prev_row.chunks_exact(WORD));
        let first = match words.position(|(a, b)| a != b) {
            Some(i) => i,
            None => continue,
        };
        let last = cur_row
            .chunks_exact(WORD)
            .zip(prev_row.chunks_exact(WORD))
            .rposition(|(a, b)| a != b)
            .unwrap_or(first);

        let (row_min_x, row_max_x) = ((first * 2) as u32, (last * 2 + 1) as u32);
        let y = y as u32;
        bounds = Some(match bounds {
            None => DirtyRect { min_x: row_min_x, min_y: y, max_x: row_max_x, max_y: y },
            Some(r) => DirtyRect {
                min_x: r.min_x.min(row_min_x),
                min_y: r.min_y,
                max_x: r.max_x.max(row_max_x),
                max_y: y,
            },
        });
    }

    if let Some(rect) = bounds {
        let start = rect.min_y as usize * stride;
        let end = (rect.max_y as usize + 1) * stride;
        previous.data[start..end].copy_from_slice(&current.data[start..end]);
    }
    bounds
}
