//! Surface import and image negotiation

use super::{
    find_candidate, Candidate, ImageFormat, ImageInfo, ImportMode, PrimeImport, Result,
    SourceFormat, SurfaceProvider, VaError, CANDIDATE_FORMATS,
};
use crate::capture::convert::PixelLayout;
use crate::capture::frame::BYTES_PER_PIXEL;
use crate::drm::{DrmDevice, FramebufferDescriptor};
use log::{debug, info, warn};
use std::os::fd::RawFd;

/// Importer switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SurfaceOptions {
    /// Try reading the surface memory directly through a derived image
    pub derive: bool,
    /// Log every driver image format and relax the render-target filter
    pub list_formats: bool,
}

/// How frames are read back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Derived image aliases the surface, no copy needed
    Derive,
    /// Surface is copied into a separate image on every fetch
    CreateFetch,
}

/// An imported scan-out buffer with a mapped image ready for reads
pub struct HardwareSurface {
    provider: Box<dyn SurfaceProvider>,
    mode: FetchMode,
    image: ImageInfo,
    layout: PixelLayout,
    width: u32,
    height: u32,
    // Kept so a failing derived image can be swapped for a created one.
    formats: Vec<ImageFormat>,
    source: SourceFormat,
    options: SurfaceOptions,
}

impl HardwareSurface {
    /// Import `prime_fd` holding `fb` and negotiate a readable image layout.
    pub fn import(
        mut provider: Box<dyn SurfaceProvider>,
        prime_fd: RawFd,
        fb: &FramebufferDescriptor,
        options: SurfaceOptions,
    ) -> Result<Self> {
        info!("VA-API vendor {}", provider.vendor());

        let source = SourceFormat::for_drm(fb.pixel_format)?;
        if options.list_formats {
            info!("Selected rt_format {:#x}, alpha {}", source.rt_format, source.has_alpha);
        }

        let desc = PrimeImport::new(prime_fd, fb, &source);
        if let Err(e) = provider.import(&desc, ImportMode::Prime2) {
            warn!("{} import failed: {}, trying {}", ImportMode::Prime2, e, ImportMode::Prime);
            provider.import(&desc, ImportMode::Prime)?;
        }

        let formats = provider.image_formats()?;
        if options.list_formats {
            for format in &formats {
                info!("Image format: {}", format);
            }
        }

        let derived = if options.derive { try_derive(provider.as_mut()) } else { None };
        let (mode, image, layout) = match derived {
            Some((image, layout)) => {
                info!("Got VA-API derived image: {}", image.format);
                (FetchMode::Derive, image, layout)
            }
            None => {
                let (image, layout) =
                    create_image(provider.as_mut(), &formats, &source, options, fb.width, fb.height)?;
                (FetchMode::CreateFetch, image, layout)
            }
        };
        Ok(Self {
            provider,
            mode,
            image,
            layout,
            width: fb.width,
            height: fb.height,
            formats,
            source,
            options,
        })
    }

    pub fn mode(&self) -> FetchMode {
        self.mode
    }

    /// Pixel layout of fetched bytes
    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    pub fn image(&self) -> &ImageInfo {
        &self.image
    }

    /// Copy the current surface contents into `dst` as tightly packed rows
    /// of `width * 4` bytes.
    ///
    /// A derived image that stops being readable is dropped for good and
    /// the fetch is retried through a created image.
    pub fn fetch(&mut self, dst: &mut Vec<u8>) -> Result<()> {
        if self.mode == FetchMode::Derive {
            match self.fetch_derived(dst) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("Derived image read failed: {}, switching to image copies", e);
                    self.abandon_derive()?;
                }
            }
        }
        self.provider.copy_to_image()?;
        let data = self.provider.mapped().ok_or(VaError::NotMapped)?;
        copy_packed(data, &self.image, self.width, self.height, dst)
    }

    fn fetch_derived(&mut self, dst: &mut Vec<u8>) -> Result<()> {
        self.provider.sync_surface()?;
        let data = self.provider.mapped().ok_or(VaError::NotMapped)?;
        copy_packed(data, &self.image, self.width, self.height, dst)
    }

    fn abandon_derive(&mut self) -> Result<()> {
        self.provider.release_image();
        self.mode = FetchMode::CreateFetch;
        let (image, layout) = create_image(
            self.provider.as_mut(),
            &self.formats,
            &self.source,
            self.options,
            self.width,
            self.height,
        )?;
        self.image = image;
        self.layout = layout;
        Ok(())
    }
}

impl Drop for HardwareSurface {
    fn drop(&mut self) {
        self.provider.release_image();
    }
}

/// Candidates the driver supports, in preference order, paired with the
/// driver's own description of the format.
fn supported_candidates(formats: &[ImageFormat]) -> Vec<(Candidate, ImageFormat)> {
    CANDIDATE_FORMATS
        .iter()
        .filter_map(|c| formats.iter().find(|f| f.fourcc == c.fourcc).map(|f| (*c, *f)))
        .collect()
}

fn try_derive(provider: &mut dyn SurfaceProvider) -> Option<(ImageInfo, PixelLayout)> {
    let image = match provider.derive_image() {
        Ok(image) => image,
        Err(e) => {
            warn!("Derive image failed: {}", e);
            return None;
        }
    };
    let layout = match find_candidate(image.format.fourcc) {
        Some(candidate) => candidate.layout,
        None => {
            warn!("Derived image has unknown fourcc {}", image.format.fourcc);
            provider.release_image();
            return None;
        }
    };
    if let Err(e) = provider.map_image() {
        warn!("Mapping derived image failed: {}", e);
        provider.release_image();
        return None;
    }
    Some((image, layout))
}

/// Walk the supported candidates and keep the first image the driver
/// creates, maps and fills.
fn create_image(
    provider: &mut dyn SurfaceProvider,
    formats: &[ImageFormat],
    source: &SourceFormat,
    options: SurfaceOptions,
    width: u32,
    height: u32,
) -> Result<(ImageInfo, PixelLayout)> {
    for (candidate, format) in supported_candidates(formats) {
        if !options.list_formats && candidate.rt_format != source.rt_format {
            continue;
        }
        if candidate.has_alpha != source.has_alpha {
            continue;
        }
        match try_create(provider, &format, width, height) {
            Ok(image) => {
                info!("Got VA-API image: {}", image.format);
                return Ok((image, candidate.layout));
            }
            Err(e) => debug!("Image format {} rejected: {}", candidate.fourcc, e),
        }
    }
    Err(VaError::NoUsableFormat)
}

fn try_create(
    provider: &mut dyn SurfaceProvider,
    format: &ImageFormat,
    width: u32,
    height: u32,
) -> Result<ImageInfo> {
    let image = provider.create_image(format, width, height)?;
    let filled = provider.map_image().and_then(|_| provider.copy_to_image());
    if let Err(e) = filled {
        provider.release_image();
        return Err(e);
    }
    Ok(image)
}

fn copy_packed(data: &[u8], image: &ImageInfo, width: u32, height: u32, dst: &mut Vec<u8>) -> Result<()> {
    let row_bytes = width as usize * BYTES_PER_PIXEL;
    let pitch = (image.pitch as usize).max(row_bytes);
    let offset = image.offset as usize;
    if height == 0 || row_bytes == 0 {
        dst.clear();
        return Ok(());
    }
    let needed = offset + pitch * (height as usize - 1) + row_bytes;
    if data.len() < needed {
        return Err(VaError::ShortImage { needed, actual: data.len() });
    }
    dst.resize(row_bytes * height as usize, 0);
    for (src_row, dst_row) in data[offset..].chunks(pitch).zip(dst.chunks_exact_mut(row_bytes)) {
        dst_row.copy_from_slice(&src_row[..row_bytes]);
    }
    Ok(())
}

/// Open the driver backend for `device`.
#[cfg(feature = "vaapi")]
pub fn open_provider(device: &DrmDevice) -> Result<Box<dyn SurfaceProvider>> {
    Ok(Box::new(super::LibvaProvider::open(device)?))
}

/// Open the driver backend for `device`.
#[cfg(not(feature = "vaapi"))]
pub fn open_provider(_device: &DrmDevice) -> Result<Box<dyn SurfaceProvider>> {
    Err(VaError::FeatureDisabled)
}
