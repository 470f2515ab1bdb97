//! libva-backed surface provider

use super::ffi::*;
use super::{ImageFormat, ImageInfo, ImportMode, PrimeImport, Result, SurfaceProvider, VaError, VaFourcc};
use crate::drm::DrmDevice;
use libc::{c_char, c_void};
use log::{debug, info, warn};
use std::ffi::CStr;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;

unsafe extern "C" fn info_callback(_ctx: *mut c_void, message: *const c_char) {
    if !message.is_null() {
        debug!("va: {}", CStr::from_ptr(message).to_string_lossy().trim_end());
    }
}

unsafe extern "C" fn error_callback(_ctx: *mut c_void, message: *const c_char) {
    if !message.is_null() {
        warn!("va error: {}", CStr::from_ptr(message).to_string_lossy().trim_end());
    }
}

fn check(call: &'static str, status: VAStatus) -> Result<()> {
    if status == VA_STATUS_SUCCESS {
        return Ok(());
    }
    // SAFETY: vaErrorStr returns a static string for any status.
    let message = unsafe { CStr::from_ptr(vaErrorStr(status)) }.to_string_lossy().into_owned();
    Err(VaError::Call { call, status, message })
}

fn log_failure(call: &'static str, status: VAStatus) {
    if let Err(e) = check(call, status) {
        warn!("{}", e);
    }
}

impl From<VAImageFormat> for ImageFormat {
    fn from(f: VAImageFormat) -> Self {
        ImageFormat {
            fourcc: VaFourcc(f.fourcc),
            byte_order: f.byte_order,
            bits_per_pixel: f.bits_per_pixel,
            depth: f.depth,
            red_mask: f.red_mask,
            green_mask: f.green_mask,
            blue_mask: f.blue_mask,
            alpha_mask: f.alpha_mask,
        }
    }
}

/// VA-API display opened on a DRM render node
pub struct LibvaProvider {
    display: VADisplay,
    surface: VASurfaceID,
    image: Option<VAImage>,
    mapped: Option<(*const u8, usize)>,
    formats: Vec<VAImageFormat>,
    width: u32,
    height: u32,
    // Closed after vaTerminate, so declared last.
    _render_node: Option<File>,
}

impl LibvaProvider {
    /// Open the device's render node (or the device itself when it has
    /// none) and initialize a VA display on it.
    pub fn open(device: &DrmDevice) -> Result<Self> {
        let render_node = match device.render_node_path() {
            Some(path) => match OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_CLOEXEC)
                .open(&path)
            {
                Ok(file) => Some(file),
                Err(e) => {
                    info!("Using non-render node because {} fails to open: {}", path.display(), e);
                    None
                }
            },
            None => {
                info!("Using non-render node because the device does not have an associated render node");
                None
            }
        };
        let fd = render_node.as_ref().map(|f| f.as_raw_fd()).unwrap_or(device.as_raw_fd());

        // SAFETY: fd stays open for the lifetime of the display.
        let display = unsafe { vaGetDisplayDRM(fd) };
        if display.is_null() {
            return Err(VaError::Display("vaGetDisplayDRM failed".to_string()));
        }
        let mut provider = Self {
            display,
            surface: VA_INVALID_ID,
            image: None,
            mapped: None,
            formats: Vec::new(),
            width: 0,
            height: 0,
            _render_node: render_node,
        };

        // SAFETY: display is valid; callbacks are plain functions.
        let (mut major, mut minor) = (0, 0);
        unsafe {
            vaSetErrorCallback(display, Some(error_callback), std::ptr::null_mut());
            vaSetInfoCallback(display, Some(info_callback), std::ptr::null_mut());
            if let Err(e) = check("vaInitialize", vaInitialize(display, &mut major, &mut minor)) {
                // Terminate is still required to free the display.
                vaTerminate(display);
                provider.display = std::ptr::null_mut();
                return Err(VaError::Display(e.to_string()));
            }
        }
        info!("VA-API {}.{} initialized", major, minor);
        Ok(provider)
    }

    fn image_id(&self) -> Option<VAImageID> {
        self.image.map(|i| i.image_id)
    }
}

impl SurfaceProvider for LibvaProvider {
    fn vendor(&self) -> String {
        // SAFETY: display is initialized; the string is owned by libva.
        let ptr = unsafe { vaQueryVendorString(self.display) };
        if ptr.is_null() {
            return "unknown".to_string();
        }
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    }

    fn import(&mut self, desc: &PrimeImport, mode: ImportMode) -> Result<()> {
        let mut prime = VADRMPRIMESurfaceDescriptor {
            fourcc: desc.surface_fourcc.0,
            width: desc.width,
            height: desc.height,
            num_objects: 1,
            num_layers: 1,
            ..Default::default()
        };
        for object in prime.objects.iter_mut() {
            *object = VADRMPRIMEObject {
                fd: desc.fd,
                size: desc.object_size,
                drm_format_modifier: u64::from(desc.modifier),
            };
        }
        prime.layers[0] = VADRMPRIMELayer {
            drm_format: desc.drm_format as u32,
            num_planes: desc.num_planes,
            object_index: [0; 4],
            offset: desc.offsets,
            pitch: desc.pitches,
        };

        let mut fd_slot = desc.fd as libc::uintptr_t;
        let mut external = VASurfaceAttribExternalBuffers {
            pixel_format: desc.surface_fourcc.0,
            width: desc.width,
            height: desc.height,
            data_size: desc.object_size,
            num_planes: desc.num_planes,
            pitches: desc.pitches,
            offsets: desc.offsets,
            buffers: &mut fd_slot,
            num_buffers: 1,
            flags: 0,
            private_data: std::ptr::null_mut(),
            va_reserved: [0; 4],
        };

        let mut attribs = match mode {
            ImportMode::Prime2 => [
                VASurfaceAttrib::integer(VASurfaceAttribMemoryType, VA_SURFACE_ATTRIB_MEM_TYPE_DRM_PRIME_2),
                VASurfaceAttrib::pointer(
                    VASurfaceAttribExternalBufferDescriptor,
                    &mut prime as *mut _ as *mut c_void,
                ),
            ],
            ImportMode::Prime => [
                VASurfaceAttrib::integer(VASurfaceAttribMemoryType, VA_SURFACE_ATTRIB_MEM_TYPE_DRM_PRIME),
                VASurfaceAttrib::pointer(
                    VASurfaceAttribExternalBufferDescriptor,
                    &mut external as *mut _ as *mut c_void,
                ),
            ],
        };

        let mut surface = VA_INVALID_ID;
        // SAFETY: the descriptors outlive the call; libva dups the dma-buf fd.
        let status = unsafe {
            vaCreateSurfaces(
                self.display,
                desc.rt_format,
                desc.width,
                desc.height,
                &mut surface,
                1,
                attribs.as_mut_ptr(),
                attribs.len() as u32,
            )
        };
        check("vaCreateSurfaces", status)?;
        self.surface = surface;
        self.width = desc.width;
        self.height = desc.height;
        Ok(())
    }

    fn image_formats(&mut self) -> Result<Vec<ImageFormat>> {
        // SAFETY: display is initialized.
        let max = unsafe { vaMaxNumImageFormats(self.display) }.max(0);
        let mut formats = vec![VAImageFormat::default(); max as usize];
        let mut got = 0;
        let status = unsafe { vaQueryImageFormats(self.display, formats.as_mut_ptr(), &mut got) };
        check("vaQueryImageFormats", status)?;
        if got != max {
            debug!("Got {} image formats instead of {}", got, max);
        }
        formats.truncate(got.clamp(0, max) as usize);
        self.formats = formats;
        Ok(self.formats.iter().map(|f| ImageFormat::from(*f)).collect())
    }

    fn derive_image(&mut self) -> Result<ImageInfo> {
        let mut image = VAImage::default();
        // SAFETY: surface was created by import.
        check("vaDeriveImage", unsafe { vaDeriveImage(self.display, self.surface, &mut image) })?;
        self.image = Some(image);
        Ok(image_info(&image))
    }

    fn create_image(&mut self, format: &ImageFormat, width: u32, height: u32) -> Result<ImageInfo> {
        let mut va_format = self
            .formats
            .iter()
            .copied()
            .find(|f| f.fourcc == format.fourcc.0)
            .ok_or(VaError::NoUsableFormat)?;
        let mut image = VAImage::default();
        // SAFETY: va_format came from vaQueryImageFormats.
        let status = unsafe {
            vaCreateImage(self.display, &mut va_format, width as i32, height as i32, &mut image)
        };
        check("vaCreateImage", status)?;
        self.image = Some(image);
        Ok(image_info(&image))
    }

    fn map_image(&mut self) -> Result<()> {
        let image = self.image.ok_or(VaError::NotMapped)?;
        let mut ptr: *mut c_void = std::ptr::null_mut();
        // SAFETY: image.buf belongs to the current image.
        check("vaMapBuffer", unsafe { vaMapBuffer(self.display, image.buf, &mut ptr) })?;
        if ptr.is_null() {
            return Err(VaError::NotMapped);
        }
        self.mapped = Some((ptr as *const u8, image.data_size as usize));
        Ok(())
    }

    fn copy_to_image(&mut self) -> Result<()> {
        let id = self.image_id().ok_or(VaError::NotMapped)?;
        // SAFETY: surface and image are live.
        let status =
            unsafe { vaGetImage(self.display, self.surface, 0, 0, self.width, self.height, id) };
        check("vaGetImage", status)
    }

    fn sync_surface(&mut self) -> Result<()> {
        // SAFETY: surface was created by import.
        check("vaSyncSurface", unsafe { vaSyncSurface(self.display, self.surface) })
    }

    fn mapped(&self) -> Option<&[u8]> {
        // SAFETY: the mapping stays valid until release_image unmaps it.
        self.mapped.map(|(ptr, len)| unsafe { std::slice::from_raw_parts(ptr, len) })
    }

    fn release_image(&mut self) {
        let Some(image) = self.image.take() else { return };
        unsafe {
            if self.mapped.take().is_some() {
                log_failure("vaUnmapBuffer", vaUnmapBuffer(self.display, image.buf));
            }
            log_failure("vaDestroyImage", vaDestroyImage(self.display, image.image_id));
        }
    }
}

impl Drop for LibvaProvider {
    fn drop(&mut self) {
        self.release_image();
        if self.display.is_null() {
            return;
        }
        unsafe {
            if self.surface != VA_INVALID_ID {
                log_failure("vaDestroySurfaces", vaDestroySurfaces(self.display, &mut self.surface, 1));
            }
            log_failure("vaTerminate", vaTerminate(self.display));
        }
    }
}

fn image_info(image: &VAImage) -> ImageInfo {
    ImageInfo {
        format: ImageFormat::from(image.format),
        width: image.width as u32,
        height: image.height as u32,
        pitch: image.pitches[0],
        offset: image.offsets[0],
        data_size: image.data_size,
    }
}
