//! Capture session
//!
//! Owns every kernel handle, mapping and frame buffer for one captured
//! plane. Fields are declared so that dropping the session releases the
//! buffer source before the device it was opened on.

use super::convert::{ConversionKind, FrameConverter, PixelLayout};
use super::cursor::{self, CursorBitmap, CursorTracker};
use super::diff::{diff_frames, DirtyRect};
use super::frame::{CanonicalFrame, FrameStats};
use super::locator::{LocatedPlanes, PlaneLocator};
use super::strategy::{self, BufferAccess, ConversionPlan, SyncMode};
use super::{CaptureError, Result};
use crate::config::CaptureConfig;
use crate::drm::{
    DrmDevice, DrmError, FramebufferDescriptor, GemHandle, MappedRegion, ModifierExt, PrimeBuffer,
};
use crate::vaapi::{self, HardwareSurface, SurfaceOptions};
use image::ImageEncoder;
use log::{debug, info, warn};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::time::Instant;

/// What [`CaptureSession::dump_frame`] writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpMode {
    /// Canonical RGBA, or a PNG if the path ends in `.png`
    Converted,
    /// Source bytes exactly as mapped or fetched
    Raw,
}

/// Where the frame bytes come from. Variant fields drop in declaration
/// order: mappings before the handles they map.
enum CaptureSource {
    MappedDumb { region: MappedRegion, _gem: GemHandle },
    MappedPrime { region: MappedRegion, prime: PrimeBuffer },
    MappedGtt { region: MappedRegion, _gem: GemHandle },
    Surface { surface: HardwareSurface, _prime: PrimeBuffer },
}

/// Conversion and change detection, independent of where bytes come from
pub struct FramePipeline {
    converter: FrameConverter,
    pitch: usize,
    current: CanonicalFrame,
    previous: CanonicalFrame,
    compare: bool,
    primed: bool,
    dirty: Option<DirtyRect>,
}

impl FramePipeline {
    pub fn new(converter: FrameConverter, width: u32, height: u32, pitch: usize, compare: bool) -> Self {
        Self {
            converter,
            pitch,
            current: CanonicalFrame::new(width, height),
            previous: CanonicalFrame::new(width, height),
            compare,
            primed: false,
            dirty: None,
        }
    }

    /// Convert `raw` and diff it against the published frame. On error the
    /// published frame is left as it was.
    pub fn process(&mut self, raw: &[u8]) -> Result<Option<DirtyRect>> {
        let (width, height) = (self.current.width, self.current.height);
        self.converter.convert(raw, width, height, self.pitch, &mut self.current.data)?;

        let dirty = if self.primed {
            diff_frames(&self.current, &mut self.previous, self.compare)
        } else {
            self.previous.data.copy_from_slice(&self.current.data);
            self.primed = true;
            DirtyRect::full(width, height)
        };
        self.dirty = dirty;
        Ok(dirty)
    }

    /// The last successfully produced frame
    pub fn frame(&self) -> &CanonicalFrame {
        &self.previous
    }

    pub fn dirty_rect(&self) -> Option<DirtyRect> {
        self.dirty
    }

    pub fn converter(&self) -> &FrameConverter {
        &self.converter
    }
}

/// A running capture of one display plane
pub struct CaptureSession {
    source: CaptureSource,
    pipeline: FramePipeline,
    raw: Vec<u8>,
    plan: ConversionPlan,
    framebuffer: FramebufferDescriptor,
    driver: String,
    locator: PlaneLocator,
    planes: LocatedPlanes,
    cursor_tracker: CursorTracker,
    cursor_frameskip: u32,
    cursor_ticks: u64,
    stats: FrameStats,
    device: DrmDevice,
}

impl CaptureSession {
    /// Open the device, locate the plane and set up buffer access.
    pub fn open(config: &CaptureConfig) -> Result<Self> {
        let device = DrmDevice::open(&config.device)?;
        let driver = match config.force_driver {
            Some(ref forced) => {
                info!("Forcing driver {}", forced);
                forced.clone()
            }
            None => device.driver_name()?,
        };
        info!("Using {} with driver {}", device.path().display(), driver);

        if let Err(e) = device.enable_universal_planes() {
            warn!("Failed to enable universal planes: {}", e);
        }

        let locator = PlaneLocator::new(config.plane, config.crtc, config.capture_cursor);
        let planes = locator.locate(&device, true)?;
        info!(
            "Capturing plane {} on CRTC {}, framebuffer {}",
            planes.primary.plane_id, planes.primary.crtc_id, planes.primary.fb_id
        );

        let fb = device.framebuffer(planes.primary.fb_id)?;
        log_framebuffer(&fb);
        if fb.handles[0] == 0 {
            return Err(DrmError::NoHandle(fb.fb_id).into());
        }

        let plan = strategy::select(&driver, &fb)?;
        for advisory in &plan.advisories {
            warn!("{}", advisory);
        }
        plan.check_geometry(fb.width, fb.height)?;
        info!("Buffer access: {}, conversion: {}", plan.access, plan.conversion);

        let options = SurfaceOptions { derive: config.va_derive, list_formats: config.va_list_formats };
        let (source, layout) = open_source(&device, &fb, &plan, options)?;
        let converter = FrameConverter::new(plan.conversion, layout);
        let pipeline = FramePipeline::new(
            converter,
            fb.width,
            fb.height,
            fb.pitches[0] as usize,
            !config.disable_compare,
        );

        Ok(Self {
            source,
            pipeline,
            raw: Vec::new(),
            plan,
            framebuffer: fb,
            driver,
            locator,
            planes,
            cursor_tracker: CursorTracker::new(),
            cursor_frameskip: config.cursor_frameskip.max(1),
            cursor_ticks: 0,
            stats: FrameStats::default(),
            device,
        })
    }

    /// Capture and convert the next frame, returning what changed since the
    /// previous one. A failed frame leaves [`frame`](Self::frame) untouched.
    pub fn next_frame(&mut self) -> Result<Option<DirtyRect>> {
        let start = Instant::now();
        let result = self.capture();
        match result {
            Ok(dirty) => {
                let elapsed = start.elapsed().as_micros() as u64;
                self.stats.record_capture(self.pipeline.frame().data.len(), elapsed, dirty.is_some());
                if let Some(rect) = dirty {
                    debug!("Dirty {:?} in {}us", rect, elapsed);
                }
            }
            Err(_) => self.stats.record_failure(),
        }
        result
    }

    fn capture(&mut self) -> Result<Option<DirtyRect>> {
        match self.source {
            CaptureSource::MappedDumb { ref region, .. } | CaptureSource::MappedGtt { ref region, .. } => {
                self.pipeline.process(region.as_slice())
            }
            CaptureSource::MappedPrime { ref region, ref prime } => {
                if self.plan.sync == SyncMode::None {
                    return self.pipeline.process(region.as_slice());
                }
                process_synced(prime, &mut self.pipeline, region.as_slice())
            }
            CaptureSource::Surface { ref mut surface, .. } => {
                surface.fetch(&mut self.raw)?;
                self.pipeline.process(&self.raw)
            }
        }
    }

    /// The published canonical frame
    pub fn frame(&self) -> &CanonicalFrame {
        self.pipeline.frame()
    }

    /// Dirty rectangle of the last successful frame
    pub fn dirty_rect(&self) -> Option<DirtyRect> {
        self.pipeline.dirty_rect()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.framebuffer.width, self.framebuffer.height)
    }

    pub fn driver(&self) -> &str {
        &self.driver
    }

    pub fn plan(&self) -> &ConversionPlan {
        &self.plan
    }

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    /// Read the cursor plane now, regardless of frameskip or changes.
    pub fn extract_cursor(&mut self) -> Option<CursorBitmap> {
        self.planes.cursor = self.locator.refresh_cursor(&self.device, self.planes.cursor);
        let plane = self.planes.cursor?;
        cursor::sample(&self.device, &plane)
    }

    /// Sample the cursor every `cursor_frameskip` calls and return it only
    /// when it changed.
    pub fn next_cursor(&mut self) -> Option<CursorBitmap> {
        if !self.locator.want_cursor {
            return None;
        }
        let tick = self.cursor_ticks;
        self.cursor_ticks += 1;
        if tick % self.cursor_frameskip as u64 != 0 {
            return None;
        }
        let bitmap = self.extract_cursor();
        let changed = self.cursor_tracker.update(bitmap);
        if let Some(ref b) = changed {
            debug!("Cursor {}x{} at +{}+{}", b.width, b.height, b.origin_x, b.origin_y);
        }
        changed
    }

    /// Write one frame to `path`.
    pub fn dump_frame(&mut self, path: &Path, mode: DumpMode) -> Result<()> {
        match mode {
            DumpMode::Converted => {
                if self.stats.total_frames == 0 {
                    self.next_frame()?;
                }
                let frame = self.pipeline.frame();
                if is_png(path) {
                    write_png(path, frame)?;
                } else {
                    std::fs::write(path, &frame.data)?;
                }
            }
            DumpMode::Raw => {
                let raw = self.raw_bytes()?;
                std::fs::write(path, raw)?;
            }
        }
        info!("Dumped {:?} frame to {}", mode, path.display());
        Ok(())
    }

    fn raw_bytes(&mut self) -> Result<Vec<u8>> {
        match self.source {
            CaptureSource::MappedDumb { ref region, .. } | CaptureSource::MappedGtt { ref region, .. } => {
                Ok(raw_span(region.as_slice(), &self.framebuffer).to_vec())
            }
            CaptureSource::MappedPrime { ref region, ref prime } => {
                begin_read(prime);
                let bytes = raw_span(region.as_slice(), &self.framebuffer).to_vec();
                end_read(prime);
                Ok(bytes)
            }
            CaptureSource::Surface { ref mut surface, .. } => {
                surface.fetch(&mut self.raw)?;
                Ok(self.raw.clone())
            }
        }
    }
}

/// Process a dma-buf backed frame inside a read sync. A failed sync is
/// logged and the frame is used anyway, so a published frame always comes
/// with its dirty rectangle.
fn process_synced(prime: &PrimeBuffer, pipeline: &mut FramePipeline, raw: &[u8]) -> Result<Option<DirtyRect>> {
    begin_read(prime);
    let result = pipeline.process(raw);
    end_read(prime);
    result
}

fn begin_read(prime: &PrimeBuffer) {
    if let Err(e) = prime.sync_start() {
        warn!("dma-buf sync start failed, reading unsynchronized: {}", e);
    }
}

fn end_read(prime: &PrimeBuffer) {
    if let Err(e) = prime.sync_end() {
        warn!("dma-buf sync end failed: {}", e);
    }
}

/// The part of a mapping the framebuffer actually covers. GEM objects are
/// often larger than the scan-out they hold.
fn raw_span<'a>(mapped: &'a [u8], fb: &FramebufferDescriptor) -> &'a [u8] {
    &mapped[..fb.span().min(mapped.len())]
}

fn open_source(
    device: &DrmDevice,
    fb: &FramebufferDescriptor,
    plan: &ConversionPlan,
    options: SurfaceOptions,
) -> Result<(CaptureSource, PixelLayout)> {
    let handle = fb.handles[0];
    let source = match plan.access {
        BufferAccess::DumbMap => {
            let gem = device.open_gem(handle)?;
            let offset = device.map_dumb_offset(&gem)?;
            let region = map_checked(device.as_raw_fd(), gem.size() as usize, offset, fb, plan)?;
            CaptureSource::MappedDumb { region, _gem: gem }
        }
        BufferAccess::I915Gtt => {
            let gem = device.open_gem(handle)?;
            let offset = device.i915_gtt_offset(&gem)?;
            let region = map_checked(device.as_raw_fd(), gem.size() as usize, offset, fb, plan)?;
            CaptureSource::MappedGtt { region, _gem: gem }
        }
        BufferAccess::PrimeMap => {
            let prime = device.prime_export(handle)?;
            let region = map_checked(prime.as_raw_fd(), fb.span(), 0, fb, plan)?;
            CaptureSource::MappedPrime { region, prime }
        }
        BufferAccess::HardwareSurface => {
            let prime = device.prime_export(handle)?;
            let provider = vaapi::open_provider(device)?;
            let surface = HardwareSurface::import(provider, prime.as_raw_fd(), fb, options)?;
            let layout = surface.layout();
            return Ok((CaptureSource::Surface { surface, _prime: prime }, layout));
        }
    };
    Ok((source, plan.layout))
}

/// Map a buffer and make sure it is large enough for the planned conversion.
fn map_checked(
    fd: std::os::fd::RawFd,
    len: usize,
    offset: u64,
    fb: &FramebufferDescriptor,
    plan: &ConversionPlan,
) -> Result<MappedRegion> {
    info!("Mapping {} bytes at offset {:#x}", len, offset);
    let expected = match plan.conversion {
        ConversionKind::XTiled(tile) if fb.height % tile.height == 0 => {
            tile.required_bytes(fb.width, fb.height)
        }
        ConversionKind::XTiled(_) => fb.packed_size(),
        _ if fb.height == 0 => 0,
        _ => fb.pitches[0] as usize * (fb.height as usize - 1) + fb.width as usize * 4,
    };
    if len < expected {
        return Err(DrmError::SizeMismatch { expected, actual: len }.into());
    }
    Ok(MappedRegion::map(fd, len, offset)?)
}

fn log_framebuffer(fb: &FramebufferDescriptor) {
    info!(
        "Template framebuffer is {}: {}x{} fourcc:{} mod:{}",
        fb.fb_id,
        fb.width,
        fb.height,
        fb.pixel_format,
        fb.modifier.describe()
    );
    for i in 0..fb.plane_count() {
        info!(
            "  plane {}: handle {} offset {} pitch {}",
            i, fb.handles[i], fb.offsets[i], fb.pitches[i]
        );
    }
}

fn is_png(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("png"))
        .unwrap_or(false)
}

fn write_png(path: &Path, frame: &CanonicalFrame) -> Result<()> {
    let file = std::fs::File::create(path)?;
    let encoder = image::codecs::png::PngEncoder::new(std::io::BufWriter::new(file));
    encoder.write_image(&frame.data, frame.width, frame.height, image::ColorType::Rgba8)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::convert::TileGeometry;
    use crate::drm::{DrmFourcc, DrmModifier};
    use std::os::fd::OwnedFd;

    fn fb(width: u32, height: u32, pitch: u32) -> FramebufferDescriptor {
        FramebufferDescriptor {
            fb_id: 42,
            width,
            height,
            pixel_format: DrmFourcc::Xrgb8888,
            modifier: DrmModifier::Linear,
            handles: [1, 0, 0, 0],
            pitches: [pitch, 0, 0, 0],
            offsets: [0; 4],
        }
    }

    /// A descriptor that is not a dma-buf, so every sync ioctl fails
    fn unsyncable() -> PrimeBuffer {
        PrimeBuffer::from(OwnedFd::from(std::fs::File::open("/dev/null").expect("open")))
    }

    fn bgrx_frame(width: u32, height: u32, pitch: usize, fill: [u8; 4]) -> Vec<u8> {
        let mut raw = vec![0xEE; pitch * height as usize];
        for row in raw.chunks_mut(pitch) {
            for px in row[..width as usize * 4].chunks_exact_mut(4) {
                px.copy_from_slice(&fill);
            }
        }
        raw
    }

    #[test]
    fn test_first_frame_is_fully_dirty() {
        let converter = FrameConverter::new(ConversionKind::Linear, PixelLayout::BGRX);
        let mut pipeline = FramePipeline::new(converter, 4, 2, 32, true);
        let raw = bgrx_frame(4, 2, 32, [0, 0, 0, 0]);
        assert_eq!(pipeline.process(&raw).unwrap(), DirtyRect::full(4, 2));
        assert_eq!(pipeline.frame().pixel(3, 1), [0, 0, 0, 0xFF]);
        assert_eq!(pipeline.process(&raw).unwrap(), None);
        assert_eq!(pipeline.dirty_rect(), None);
    }

    #[test]
    fn test_change_is_converted_and_reported() {
        let converter = FrameConverter::new(ConversionKind::Linear, PixelLayout::BGRX);
        let mut pipeline = FramePipeline::new(converter, 4, 2, 16, true);
        let mut raw = bgrx_frame(4, 2, 16, [1, 2, 3, 0]);
        pipeline.process(&raw).unwrap();

        raw[16 + 8..16 + 12].copy_from_slice(&[30, 20, 10, 0]);
        let rect = pipeline.process(&raw).unwrap().expect("dirty");
        assert_eq!(rect, DirtyRect { min_x: 2, min_y: 1, max_x: 3, max_y: 1 });
        assert_eq!(pipeline.frame().pixel(2, 1), [10, 20, 30, 0xFF]);
        assert_eq!(pipeline.frame().pixel(0, 0), [3, 2, 1, 0xFF]);
    }

    #[test]
    fn test_failed_frame_keeps_published_frame() {
        let converter = FrameConverter::new(ConversionKind::Linear, PixelLayout::BGRX);
        let mut pipeline = FramePipeline::new(converter, 4, 2, 16, true);
        pipeline.process(&bgrx_frame(4, 2, 16, [9, 9, 9, 0])).unwrap();
        let before = pipeline.frame().clone();

        assert!(pipeline.process(&[0u8; 8]).is_err());
        assert_eq!(pipeline.frame(), &before);
    }

    #[test]
    fn test_unaligned_tiled_frame_is_refused() {
        let converter = FrameConverter::new(ConversionKind::XTiled(TileGeometry::NVIDIA), PixelLayout::BGRX);
        let mut pipeline = FramePipeline::new(converter, 17, 128, 17 * 4, true);
        let err = pipeline.process(&vec![0x55; 17 * 128 * 4]).unwrap_err();
        assert!(matches!(err, CaptureError::Convert(_)));
        assert!(pipeline.frame().data.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_disabled_compare_reports_full_frames() {
        let converter = FrameConverter::new(ConversionKind::Surface, PixelLayout::RGBA);
        let mut pipeline = FramePipeline::new(converter, 2, 2, 0, false);
        let raw = vec![7u8; 16];
        pipeline.process(&raw).unwrap();
        assert_eq!(pipeline.process(&raw).unwrap(), DirtyRect::full(2, 2));
    }

    #[test]
    fn test_failed_sync_still_publishes_dirty_rect() {
        let prime = unsyncable();
        let converter = FrameConverter::new(ConversionKind::Linear, PixelLayout::BGRX);
        let mut pipeline = FramePipeline::new(converter, 4, 2, 16, true);
        let mut raw = bgrx_frame(4, 2, 16, [1, 2, 3, 0]);
        assert_eq!(process_synced(&prime, &mut pipeline, &raw).unwrap(), DirtyRect::full(4, 2));

        raw[4..8].copy_from_slice(&[30, 20, 10, 0]);
        let rect = process_synced(&prime, &mut pipeline, &raw).unwrap();
        assert_eq!(rect, Some(DirtyRect { min_x: 0, min_y: 0, max_x: 1, max_y: 0 }));
        assert_eq!(pipeline.dirty_rect(), rect);
        assert_eq!(pipeline.frame().pixel(1, 0), [10, 20, 30, 0xFF]);
    }

    #[test]
    fn test_failed_sync_keeps_conversion_errors() {
        let prime = unsyncable();
        let converter = FrameConverter::new(ConversionKind::Linear, PixelLayout::BGRX);
        let mut pipeline = FramePipeline::new(converter, 4, 2, 16, true);
        assert!(process_synced(&prime, &mut pipeline, &[0u8; 8]).is_err());
    }

    #[test]
    fn test_raw_span_trims_oversized_objects() {
        let mapped = vec![0xAB; 4096];
        assert_eq!(raw_span(&mapped, &fb(4, 3, 32)).len(), 96);

        // A mapping shorter than the span is returned whole
        assert_eq!(raw_span(&mapped[..64], &fb(4, 3, 32)).len(), 64);

        let mut offset = fb(4, 3, 16);
        offset.offsets[0] = 100;
        assert_eq!(raw_span(&mapped, &offset).len(), 148);
    }

    #[test]
    fn test_png_extension() {
        assert!(is_png(Path::new("/tmp/frame.PNG")));
        assert!(!is_png(Path::new("/tmp/frame.raw")));
        assert!(!is_png(Path::new("/tmp/frame")));
    }

    #[test]
    fn test_write_png() {
        let path = std::env::temp_dir().join(format!("kmscap-dump-{}.png", std::process::id()));
        let mut frame = CanonicalFrame::new(2, 2);
        frame.data.fill(0x80);
        write_png(&path, &frame).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_open_missing_device_is_fatal() {
        let config = CaptureConfig {
            device: "/nonexistent/dri/card7".into(),
            ..Default::default()
        };
        assert!(matches!(CaptureSession::open(&config), Err(CaptureError::Drm(DrmError::Open(..)))));
    }
}
