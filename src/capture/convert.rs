//! Vendor conversion engine
//!
//! Turns a mapped or fetched buffer of whatever layout the hardware uses into
//! canonical RGBA. Every 8-bit packed group is read as a big-endian 32-bit
//! value so the same code path serves both byte orders; 10-bit formats are
//! little-endian 2:10:10:10 words by definition and are read as such.
//!
//! Nothing is written to the destination unless the whole conversion can
//! succeed.

use super::frame::BYTES_PER_PIXEL;
use crate::drm::DrmFourcc;
use std::fmt;

/// Order of the colour channels inside a pixel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

/// Bits per colour channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelDepth {
    /// 8 bits per channel, 24-bit colour
    Eight,
    /// 10 bits per channel packed in 32 bits, 30-bit colour
    Ten,
}

/// Memory layout of one 32-bit pixel.
///
/// For 8-bit layouts the name is the byte order in memory (`BGRX` stores
/// blue first). 10-bit layouts are always `[2-bit X/A | c0 | c1 | c2]`
/// from the most significant bit down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelLayout {
    pub order: ChannelOrder,
    pub depth: ChannelDepth,
    /// X/A byte precedes the colour channels (`XRGB`, `ABGR`)
    pub alpha_first: bool,
    /// The fourth channel carries real alpha rather than padding
    pub has_alpha: bool,
}

impl PixelLayout {
    pub const RGBX: PixelLayout = PixelLayout::eight(ChannelOrder::Rgb, false, false);
    pub const RGBA: PixelLayout = PixelLayout::eight(ChannelOrder::Rgb, false, true);
    pub const XRGB: PixelLayout = PixelLayout::eight(ChannelOrder::Rgb, true, false);
    pub const ARGB: PixelLayout = PixelLayout::eight(ChannelOrder::Rgb, true, true);
    pub const BGRX: PixelLayout = PixelLayout::eight(ChannelOrder::Bgr, false, false);
    pub const BGRA: PixelLayout = PixelLayout::eight(ChannelOrder::Bgr, false, true);
    pub const XBGR: PixelLayout = PixelLayout::eight(ChannelOrder::Bgr, true, false);
    pub const ABGR: PixelLayout = PixelLayout::eight(ChannelOrder::Bgr, true, true);
    pub const X2R10G10B10: PixelLayout = PixelLayout::ten(ChannelOrder::Rgb, false);
    pub const A2R10G10B10: PixelLayout = PixelLayout::ten(ChannelOrder::Rgb, true);
    pub const X2B10G10R10: PixelLayout = PixelLayout::ten(ChannelOrder::Bgr, false);
    pub const A2B10G10R10: PixelLayout = PixelLayout::ten(ChannelOrder::Bgr, true);

    const fn eight(order: ChannelOrder, alpha_first: bool, has_alpha: bool) -> Self {
        Self { order, depth: ChannelDepth::Eight, alpha_first, has_alpha }
    }

    const fn ten(order: ChannelOrder, has_alpha: bool) -> Self {
        Self { order, depth: ChannelDepth::Ten, alpha_first: true, has_alpha }
    }

    /// Layout of a DRM framebuffer format. DRM fourccs name little-endian
    /// words, so `XRGB8888` is `B, G, R, X` in memory.
    pub fn from_drm(format: DrmFourcc) -> Option<Self> {
        Some(match format {
            DrmFourcc::Xrgb8888 => PixelLayout::BGRX,
            DrmFourcc::Argb8888 => PixelLayout::BGRA,
            DrmFourcc::Xbgr8888 => PixelLayout::RGBX,
            DrmFourcc::Abgr8888 => PixelLayout::RGBA,
            DrmFourcc::Xrgb2101010 => PixelLayout::X2R10G10B10,
            DrmFourcc::Argb2101010 => PixelLayout::A2R10G10B10,
            DrmFourcc::Xbgr2101010 => PixelLayout::X2B10G10R10,
            DrmFourcc::Abgr2101010 => PixelLayout::A2B10G10R10,
            _ => return None,
        })
    }
}

/// What to emit in the canonical alpha byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlphaMode {
    /// Screen content: keep 8-bit alpha, padding and 10-bit alpha become opaque
    Frame,
    /// Cursor content: keep 8-bit alpha, widen 2-bit alpha into the top bits
    Cursor,
}

/// Vendor X-tile geometry in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGeometry {
    pub width: u32,
    pub height: u32,
}

impl TileGeometry {
    /// NVIDIA X-tiled scan-out buffers
    pub const NVIDIA: TileGeometry = TileGeometry { width: 16, height: 128 };
    /// Intel X-tiling (512 bytes x 8 rows at 32bpp)
    pub const INTEL_X: TileGeometry = TileGeometry { width: 128, height: 8 };

    /// Pixel index inside the tiled buffer of linear pixel `(x, y)`.
    pub fn tiled_offset(&self, x: u32, y: u32, frame_width: u32) -> usize {
        let (tw, th) = (self.width as usize, self.height as usize);
        let (x, y) = (x as usize, y as usize);
        let tile_number = x / tw + (y / th) * (frame_width as usize / tw);
        let intra_tile_offset = x % tw + (y % th) * tw;
        tile_number * tw * th + intra_tile_offset
    }

    /// Bytes the tiled source must cover for a frame, including the padding
    /// of a partial last tile row.
    pub fn required_bytes(&self, width: u32, height: u32) -> usize {
        let tiles_per_row = (width / self.width) as usize;
        let tile_rows = height.div_ceil(self.height) as usize;
        tiles_per_row * tile_rows * (self.width * self.height) as usize * BYTES_PER_PIXEL
    }
}

impl fmt::Display for TileGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Which conversion a session runs on every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionKind {
    /// Linear buffer, channel reordering only
    Linear,
    /// Vendor X-tiled buffer, de-tiled then reordered
    XTiled(TileGeometry),
    /// Bytes fetched from an accelerated-video image in its negotiated layout
    Surface,
}

impl fmt::Display for ConversionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversionKind::Linear => write!(f, "linear"),
            ConversionKind::XTiled(tile) => write!(f, "x-tiled {}", tile),
            ConversionKind::Surface => write!(f, "hardware surface"),
        }
    }
}

/// Conversion errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvertError {
    /// Frame width is not a multiple of the tile width
    UnalignedTileWidth { width: u32, tile_width: u32 },
    /// Source buffer is shorter than the frame needs
    SourceTooSmall { needed: usize, actual: usize },
    /// Destination is not exactly `width * height * 4` bytes
    DestinationSize { expected: usize, actual: usize },
    /// Row pitch smaller than a row of pixels
    InvalidPitch { pitch: usize, width: u32 },
}

impl fmt::Display for ConvertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvertError::UnalignedTileWidth { width, tile_width } => write!(
                f,
                "width {} is not a multiple of the tile width {}, de-tiling unsupported",
                width, tile_width
            ),
            ConvertError::SourceTooSmall { needed, actual } => {
                write!(f, "source has {} bytes, {} needed", actual, needed)
            }
            ConvertError::DestinationSize { expected, actual } => {
                write!(f, "destination has {} bytes, expected {}", actual, expected)
            }
            ConvertError::InvalidPitch { pitch, width } => {
                write!(f, "pitch {} too small for width {}", pitch, width)
            }
        }
    }
}

impl std::error::Error for ConvertError {}

/// Convert one 32-bit group to RGBA.
#[inline]
pub fn convert_pixel(layout: PixelLayout, alpha: AlphaMode, src: [u8; 4]) -> [u8; 4] {
    match layout.depth {
        ChannelDepth::Eight => {
            let mut v = u32::from_be_bytes(src);
            if layout.order == ChannelOrder::Bgr {
                v = if layout.alpha_first {
                    swap_bytes(v, 16, 0)
                } else {
                    swap_bytes(v, 24, 8)
                };
            }
            let a = if layout.alpha_first { (v >> 24) as u8 } else { v as u8 };
            if layout.alpha_first {
                v <<= 8;
            }
            let a = if layout.has_alpha { a } else { 0xff };
            [(v >> 24) as u8, (v >> 16) as u8, (v >> 8) as u8, a]
        }
        ChannelDepth::Ten => {
            let v = u32::from_le_bytes(src);
            let hi = ((v & 0x3ff0_0000) >> 20 >> 2) as u8;
            let mid = ((v & 0x000f_fc00) >> 10 >> 2) as u8;
            let lo = ((v & 0x0000_03ff) >> 2) as u8;
            let (r, g, b) = match layout.order {
                ChannelOrder::Rgb => (hi, mid, lo),
                ChannelOrder::Bgr => (lo, mid, hi),
            };
            let a = match alpha {
                AlphaMode::Cursor if layout.has_alpha => (((v & 0xc000_0000) >> 30) << 6) as u8,
                _ => 0xff,
            };
            [r, g, b, a]
        }
    }
}

#[inline]
fn swap_bytes(v: u32, a: u32, b: u32) -> u32 {
    let x = (v >> a) & 0xff;
    let y = (v >> b) & 0xff;
    (v & !((0xff << a) | (0xff << b))) | (x << b) | (y << a)
}

/// Convert a linear buffer with the given row pitch into packed RGBA.
pub fn convert_linear(
    layout: PixelLayout,
    alpha: AlphaMode,
    src: &[u8],
    width: u32,
    height: u32,
    pitch: usize,
    dst: &mut [u8],
) -> Result<(), ConvertError> {
    let row_bytes = width as usize * BYTES_PER_PIXEL;
    check_destination(dst, width, height)?;
    if pitch < row_bytes {
        return Err(ConvertError::InvalidPitch { pitch, width });
    }
    if height == 0 || width == 0 {
        return Ok(());
    }
    let needed = pitch * (height as usize - 1) + row_bytes;
    if src.len() < needed {
        return Err(ConvertError::SourceTooSmall { needed, actual: src.len() });
    }

    if layout == PixelLayout::RGBA {
        copy_rows(src, pitch, dst, row_bytes);
        return Ok(());
    }
    for (src_row, dst_row) in src.chunks(pitch).zip(dst.chunks_exact_mut(row_bytes)) {
        for (s, d) in src_row[..row_bytes]
            .chunks_exact(BYTES_PER_PIXEL)
            .zip(dst_row.chunks_exact_mut(BYTES_PER_PIXEL))
        {
            d.copy_from_slice(&convert_pixel(layout, alpha, [s[0], s[1], s[2], s[3]]));
        }
    }
    Ok(())
}

fn copy_rows(src: &[u8], pitch: usize, dst: &mut [u8], row_bytes: usize) {
    for (src_row, dst_row) in src.chunks(pitch).zip(dst.chunks_exact_mut(row_bytes)) {
        dst_row.copy_from_slice(&src_row[..row_bytes]);
    }
}

fn check_destination(dst: &[u8], width: u32, height: u32) -> Result<(), ConvertError> {
    let expected = width as usize * height as usize * BYTES_PER_PIXEL;
    if dst.len() != expected {
        return Err(ConvertError::DestinationSize { expected, actual: dst.len() });
    }
    Ok(())
}

/// Gather a tiled buffer into linear row-major order in `staging`.
///
/// `padded` is scratch space used when the height is not a whole number of
/// tiles, so the last tile row can be read without running past `src`.
pub fn detile(
    tile: TileGeometry,
    src: &[u8],
    width: u32,
    height: u32,
    staging: &mut Vec<u8>,
    padded: &mut Vec<u8>,
) -> Result<(), ConvertError> {
    if tile.width == 0 || tile.height == 0 || width % tile.width != 0 {
        return Err(ConvertError::UnalignedTileWidth { width, tile_width: tile.width });
    }
    staging.resize(width as usize * height as usize * BYTES_PER_PIXEL, 0);
    if staging.is_empty() {
        return Ok(());
    }
    let needed = tile.required_bytes(width, height);
    let source: &[u8] = if height % tile.height != 0 {
        padded.clear();
        padded.resize(needed, 0);
        let n = src.len().min(needed);
        padded[..n].copy_from_slice(&src[..n]);
        padded
    } else if src.len() < needed {
        return Err(ConvertError::SourceTooSmall { needed, actual: src.len() });
    } else {
        src
    };

    let row_bytes = width as usize * BYTES_PER_PIXEL;
    for (y, row) in staging.chunks_exact_mut(row_bytes).enumerate() {
        for (x, px) in row.chunks_exact_mut(BYTES_PER_PIXEL).enumerate() {
            let offset = tile.tiled_offset(x as u32, y as u32, width) * BYTES_PER_PIXEL;
            px.copy_from_slice(&source[offset..offset + BYTES_PER_PIXEL]);
        }
    }
    Ok(())
}

/// Per-session converter: a fixed conversion kind and source layout plus
/// reusable scratch buffers.
#[derive(Debug)]
pub struct FrameConverter {
    kind: ConversionKind,
    layout: PixelLayout,
    staging: Vec<u8>,
    padded: Vec<u8>,
}

impl FrameConverter {
    pub fn new(kind: ConversionKind, layout: PixelLayout) -> Self {
        Self { kind, layout, staging: Vec::new(), padded: Vec::new() }
    }

    pub fn kind(&self) -> ConversionKind {
        self.kind
    }

    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    /// Convert one frame. `pitch` is the source row pitch for linear
    /// buffers; tiled and surface sources are always tightly packed.
    pub fn convert(
        &mut self,
        raw: &[u8],
        width: u32,
        height: u32,
        pitch: usize,
        dst: &mut [u8],
    ) -> Result<(), ConvertError> {
        let packed = width as usize * BYTES_PER_PIXEL;
        match self.kind {
            ConversionKind::Linear => {
                convert_linear(self.layout, AlphaMode::Frame, raw, width, height, pitch, dst)
            }
            ConversionKind::Surface => {
                convert_linear(self.layout, AlphaMode::Frame, raw, width, height, packed, dst)
            }
            ConversionKind::XTiled(tile) => {
                check_destination(dst, width, height)?;
                detile(tile, raw, width, height, &mut self.staging, &mut self.padded)?;
                convert_linear(
                    self.layout,
                    AlphaMode::Frame,
                    &self.staging,
                    width,
                    height,
                    packed,
                    dst,
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn pack_xr30(r: u16, g: u16, b: u16, a: u8) -> [u8; 4] {
        let v = ((a as u32 & 0x3) << 30) | ((r as u32) << 20) | ((g as u32) << 10) | b as u32;
        v.to_le_bytes()
    }

    #[test]
    fn test_xrgb8888_drm_is_bgrx_in_memory() {
        // DRM XR24 pixel 0x00112233 stored little-endian
        let src = 0x0011_2233u32.to_le_bytes();
        let layout = PixelLayout::from_drm(DrmFourcc::Xrgb8888).expect("layout");
        assert_eq!(convert_pixel(layout, AlphaMode::Frame, src), [0x11, 0x22, 0x33, 0xff]);
    }

    #[test]
    fn test_argb8888_keeps_alpha() {
        let src = 0x8011_2233u32.to_le_bytes();
        let layout = PixelLayout::from_drm(DrmFourcc::Argb8888).expect("layout");
        assert_eq!(convert_pixel(layout, AlphaMode::Frame, src), [0x11, 0x22, 0x33, 0x80]);
    }

    #[test]
    fn test_eight_bit_layouts_in_memory_order() {
        let (r, g, b, a) = (0x10, 0x20, 0x30, 0x40);
        let cases = [
            (PixelLayout::RGBX, [r, g, b, 0x99], [r, g, b, 0xff]),
            (PixelLayout::RGBA, [r, g, b, a], [r, g, b, a]),
            (PixelLayout::XRGB, [0x99, r, g, b], [r, g, b, 0xff]),
            (PixelLayout::ARGB, [a, r, g, b], [r, g, b, a]),
            (PixelLayout::BGRX, [b, g, r, 0x99], [r, g, b, 0xff]),
            (PixelLayout::BGRA, [b, g, r, a], [r, g, b, a]),
            (PixelLayout::XBGR, [0x99, b, g, r], [r, g, b, 0xff]),
            (PixelLayout::ABGR, [a, b, g, r], [r, g, b, a]),
        ];
        for (layout, src, want) in cases {
            assert_eq!(convert_pixel(layout, AlphaMode::Frame, src), want, "{:?}", layout);
        }
    }

    #[test]
    fn test_ten_bit_truncates_low_bits() {
        let src = pack_xr30(0x3ff, 0x200, 0x007, 3);
        assert_eq!(
            convert_pixel(PixelLayout::X2R10G10B10, AlphaMode::Frame, src),
            [0xff, 0x80, 0x01, 0xff]
        );
        assert_eq!(
            convert_pixel(PixelLayout::X2B10G10R10, AlphaMode::Frame, src),
            [0x01, 0x80, 0xff, 0xff]
        );
    }

    #[test]
    fn test_ten_bit_cursor_alpha() {
        let src = pack_xr30(0, 0, 0, 2);
        assert_eq!(convert_pixel(PixelLayout::A2R10G10B10, AlphaMode::Cursor, src)[3], 0x80);
        assert_eq!(convert_pixel(PixelLayout::A2R10G10B10, AlphaMode::Frame, src)[3], 0xff);
    }

    #[test]
    fn test_ten_bit_channel_reproduction_is_monotonic() {
        let mut last = 0u8;
        for c in 0..1024u16 {
            let out = convert_pixel(PixelLayout::X2R10G10B10, AlphaMode::Frame, pack_xr30(c, c, c, 0));
            assert_eq!(out[0], (c >> 2) as u8);
            assert_eq!(out[0], out[1]);
            assert_eq!(out[1], out[2]);
            assert!(out[0] >= last);
            last = out[0];
        }
    }

    #[test]
    fn test_convert_linear_honours_pitch() {
        // 2x2 BGRX with 4 bytes of padding per row
        let src = [
            3, 2, 1, 0, 6, 5, 4, 0, 0xee, 0xee, 0xee, 0xee, //
            9, 8, 7, 0, 12, 11, 10, 0, 0xee, 0xee, 0xee, 0xee,
        ];
        let mut dst = [0u8; 16];
        convert_linear(PixelLayout::BGRX, AlphaMode::Frame, &src, 2, 2, 12, &mut dst)
            .expect("convert");
        assert_eq!(dst, [1, 2, 3, 255, 4, 5, 6, 255, 7, 8, 9, 255, 10, 11, 12, 255]);
    }

    #[test]
    fn test_convert_linear_short_source_leaves_destination() {
        let src = [0u8; 12];
        let mut dst = [7u8; 16];
        let err = convert_linear(PixelLayout::BGRX, AlphaMode::Frame, &src, 2, 2, 8, &mut dst)
            .expect_err("too short");
        assert_eq!(err, ConvertError::SourceTooSmall { needed: 16, actual: 12 });
        assert_eq!(dst, [7u8; 16]);
    }

    #[test]
    fn test_tiled_offset_is_bijective() {
        for tile in [TileGeometry { width: 4, height: 8 }, TileGeometry { width: 16, height: 4 }] {
            let (width, height) = (tile.width * 3, tile.height * 2);
            let mut seen = HashSet::new();
            for y in 0..height {
                for x in 0..width {
                    let off = tile.tiled_offset(x, y, width);
                    assert!(off < (width * height) as usize);
                    assert!(seen.insert(off), "offset {} hit twice", off);
                }
            }
            assert_eq!(seen.len(), (width * height) as usize);
        }
    }

    #[test]
    fn test_detile_reassembles_rows() {
        let tile = TileGeometry { width: 2, height: 2 };
        let (width, height) = (4u32, 2u32);
        // Tiled order: tile 0 = (0,0)(1,0)(0,1)(1,1), tile 1 = (2,0)(3,0)(2,1)(3,1)
        let ids: [u8; 8] = [0, 1, 4, 5, 2, 3, 6, 7];
        let src: Vec<u8> = ids.iter().flat_map(|i| [*i, 0, 0, 0]).collect();
        let (mut staging, mut padded) = (Vec::new(), Vec::new());
        detile(tile, &src, width, height, &mut staging, &mut padded).expect("detile");
        let linear: Vec<u8> = staging.chunks_exact(4).map(|p| p[0]).collect();
        assert_eq!(linear, vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_detile_partial_last_tile_row() {
        let tile = TileGeometry { width: 2, height: 2 };
        // 4x3 frame: two tile rows, the second only half used. The mapping
        // stops one pixel short of the padded size, so (3, 2) reads padding.
        let src: Vec<u8> = (1..=15u8).flat_map(|i| [i, 0, 0, 0]).collect();
        let (mut staging, mut padded) = (Vec::new(), Vec::new());
        detile(tile, &src, 4, 3, &mut staging, &mut padded).expect("detile");
        assert_eq!(padded.len(), tile.required_bytes(4, 3));

        let linear: Vec<u8> = staging.chunks_exact(4).map(|p| p[0]).collect();
        assert_eq!(linear, vec![1, 2, 5, 6, 3, 4, 7, 8, 9, 10, 13, 14]);

        let short: Vec<u8> = (1..=13u8).flat_map(|i| [i, 0, 0, 0]).collect();
        detile(tile, &short, 4, 3, &mut staging, &mut padded).expect("detile");
        let bottom: Vec<u8> = staging[2 * 16..].chunks_exact(4).map(|p| p[0]).collect();
        assert_eq!(bottom, vec![9, 10, 13, 0]);
    }

    #[test]
    fn test_empty_frame_is_a_no_op() {
        let mut conv = FrameConverter::new(ConversionKind::XTiled(TileGeometry::NVIDIA), PixelLayout::BGRX);
        let mut dst: [u8; 0] = [];
        assert!(conv.convert(&[], 0, 128, 0, &mut dst).is_ok());
        let mut linear = FrameConverter::new(ConversionKind::Linear, PixelLayout::BGRX);
        assert!(linear.convert(&[], 0, 4, 0, &mut dst).is_ok());
    }

    #[test]
    fn test_unaligned_tile_width_is_refused() {
        let mut conv = FrameConverter::new(
            ConversionKind::XTiled(TileGeometry::NVIDIA),
            PixelLayout::BGRX,
        );
        let src = vec![0u8; 17 * 128 * 4 * 2];
        let mut dst = vec![0x5au8; 17 * 128 * 4];
        let err = conv.convert(&src, 17, 128, 17 * 4, &mut dst).expect_err("unaligned");
        assert_eq!(err, ConvertError::UnalignedTileWidth { width: 17, tile_width: 16 });
        assert!(dst.iter().all(|b| *b == 0x5a));
    }

    #[test]
    fn test_xtiled_frame_conversion() {
        let tile = TileGeometry { width: 2, height: 1 };
        let mut conv = FrameConverter::new(ConversionKind::XTiled(tile), PixelLayout::BGRX);
        // 4x1 frame, two tiles of two pixels: already linear for a 1-row tile.
        let src = [3, 2, 1, 0, 6, 5, 4, 0, 9, 8, 7, 0, 12, 11, 10, 0];
        let mut dst = [0u8; 16];
        conv.convert(&src, 4, 1, 16, &mut dst).expect("convert");
        assert_eq!(dst, [1, 2, 3, 255, 4, 5, 6, 255, 7, 8, 9, 255, 10, 11, 12, 255]);
    }
}
