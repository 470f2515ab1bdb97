//! DRM device node

use super::ioctl::{self, ioctl};
use super::mapping::{GemHandle, PrimeBuffer};
use super::{DisplayPlane, DrmError, FramebufferDescriptor, PlaneType, Result};
use drm::control::{self, framebuffer, plane, GetPlanarFramebufferError};
use drm::{buffer, ClientCapability};
use drm_fourcc::DrmModifier;
use log::trace;
use std::fs::OpenOptions;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Source of plane information. Implemented by [`DrmDevice`]; the locator
/// only needs this much of the device.
pub trait PlaneEnumerator {
    /// Ids of every plane known to the device
    fn plane_ids(&self) -> Result<Vec<u32>>;

    /// Current state of one plane, including its type
    fn plane(&self, plane_id: u32) -> Result<DisplayPlane>;
}

/// An open DRM card or render node
pub struct DrmDevice {
    fd: Rc<OwnedFd>,
    path: PathBuf,
}

impl AsFd for DrmDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl drm::Device for DrmDevice {}
impl control::Device for DrmDevice {}

impl DrmDevice {
    /// Open a DRM device read-only, e.g. `/dev/dri/card0`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(&path)
            .map_err(|e| DrmError::Open(path.clone(), e))?;
        Ok(Self { fd: Rc::new(OwnedFd::from(file)), path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Kernel driver name (`i915`, `amdgpu`, `nvidia-drm`, ...)
    pub fn driver_name(&self) -> Result<String> {
        let driver = drm::Device::get_driver(self).map_err(|e| DrmError::Ioctl("VERSION", e))?;
        Ok(driver.name().to_string_lossy().into_owned())
    }

    /// Expose primary and cursor planes alongside overlays.
    pub fn enable_universal_planes(&self) -> Result<()> {
        drm::Device::set_client_capability(self, ClientCapability::UniversalPlanes, true)
            .map_err(|e| DrmError::Ioctl("SET_CLIENT_CAP", e))
    }

    /// Read the `type` property of a plane.
    pub fn plane_type(&self, handle: plane::Handle) -> Result<PlaneType> {
        let props = control::Device::get_properties(self, handle)
            .map_err(|e| DrmError::Ioctl("OBJ_GETPROPERTIES", e))?;
        let (ids, values) = props.as_props_and_values();
        for (id, value) in ids.iter().zip(values.iter()) {
            let info = control::Device::get_property(self, *id)
                .map_err(|e| DrmError::Ioctl("GETPROPERTY", e))?;
            let name = info.name().to_string_lossy();
            trace!("plane {} prop {} = {}", u32::from(handle), name, value);
            if name == "type" {
                return Ok(PlaneType::from_property(*value));
            }
        }
        Ok(PlaneType::Unknown)
    }

    /// Fetch framebuffer metadata with `GETFB2`.
    pub fn framebuffer(&self, fb_id: u32) -> Result<FramebufferDescriptor> {
        let handle: framebuffer::Handle = control::from_u32(fb_id).ok_or(DrmError::NoFramebuffer)?;
        let info = control::Device::get_planar_framebuffer(self, handle).map_err(|e| match e {
            GetPlanarFramebufferError::UnrecognizedFourcc(f) => DrmError::UnknownFormat(fb_id, f.0),
            GetPlanarFramebufferError::Io(e) => DrmError::Ioctl("GETFB2", e),
        })?;
        let (width, height) = info.size();
        Ok(FramebufferDescriptor {
            fb_id,
            width,
            height,
            pixel_format: info.pixel_format(),
            // No modifier flag means an implicit, linear layout
            modifier: info.modifier().unwrap_or(DrmModifier::Linear),
            handles: info.buffers().map(|b| b.map(u32::from).unwrap_or(0)),
            pitches: info.pitches(),
            offsets: info.offsets(),
        })
    }

    /// Re-open a buffer handle through a global flink name so the mapping
    /// gets its own reference.
    pub fn open_gem(&self, handle: u32) -> Result<GemHandle> {
        let mut flink = ioctl::DrmGemFlink { handle, name: 0 };
        ioctl(self.raw(), ioctl::DRM_IOCTL_GEM_FLINK, &mut flink)
            .map_err(|e| DrmError::Ioctl("GEM_FLINK", e))?;
        let mut open = ioctl::DrmGemOpen { name: flink.name, ..Default::default() };
        ioctl(self.raw(), ioctl::DRM_IOCTL_GEM_OPEN, &mut open)
            .map_err(|e| DrmError::Ioctl("GEM_OPEN", e))?;
        Ok(GemHandle::new(Rc::clone(&self.fd), open.handle, open.size))
    }

    /// Fake mmap offset for CPU access to a dumb buffer.
    pub fn map_dumb_offset(&self, gem: &GemHandle) -> Result<u64> {
        let map = drm_ffi::mode::dumbbuffer::map(self.as_fd(), gem.handle(), 0, 0)
            .map_err(|e| DrmError::Ioctl("MODE_MAP_DUMB", e))?;
        Ok(map.offset)
    }

    /// Fake mmap offset through the i915 GTT aperture (detiled by hardware).
    pub fn i915_gtt_offset(&self, gem: &GemHandle) -> Result<u64> {
        let mut req = ioctl::DrmI915GemMmapGtt { handle: gem.handle(), ..Default::default() };
        ioctl(self.raw(), ioctl::DRM_IOCTL_I915_GEM_MMAP_GTT, &mut req)
            .map_err(|e| DrmError::Ioctl("I915_GEM_MMAP_GTT", e))?;
        Ok(req.offset)
    }

    /// Export a buffer handle as a dma-buf fd.
    pub fn prime_export(&self, handle: u32) -> Result<PrimeBuffer> {
        let buffer: buffer::Handle = control::from_u32(handle).ok_or_else(|| {
            DrmError::Ioctl("PRIME_HANDLE_TO_FD", std::io::Error::from_raw_os_error(libc::EINVAL))
        })?;
        let fd = control::Device::buffer_to_prime_fd(self, buffer, (libc::O_RDWR | libc::O_CLOEXEC) as u32)
            .map_err(|e| DrmError::Ioctl("PRIME_HANDLE_TO_FD", e))?;
        Ok(PrimeBuffer::from(fd))
    }

    /// Render node belonging to the same GPU, looked up through sysfs.
    pub fn render_node_path(&self) -> Option<PathBuf> {
        let rdev = std::fs::metadata(&self.path).ok()?.rdev();
        let (major, minor) = dev_major_minor(rdev);
        let dir = PathBuf::from(format!("/sys/dev/char/{}:{}/device/drm", major, minor));
        let mut nodes: Vec<String> = std::fs::read_dir(dir)
            .ok()?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| name.starts_with("renderD"))
            .collect();
        nodes.sort();
        nodes.into_iter().next().map(|name| Path::new("/dev/dri").join(name))
    }

    fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsRawFd for DrmDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.raw()
    }
}

impl PlaneEnumerator for DrmDevice {
    fn plane_ids(&self) -> Result<Vec<u32>> {
        let handles = control::Device::plane_handles(self)
            .map_err(|e| DrmError::Ioctl("GETPLANERESOURCES", e))?;
        Ok(handles.into_iter().map(u32::from).collect())
    }

    fn plane(&self, plane_id: u32) -> Result<DisplayPlane> {
        let handle: plane::Handle = control::from_u32(plane_id)
            .ok_or_else(|| DrmError::Plane(plane_id, std::io::Error::from_raw_os_error(libc::ENOENT)))?;
        let info = control::Device::get_plane(self, handle).map_err(|e| DrmError::Plane(plane_id, e))?;
        let plane_type = self.plane_type(handle).unwrap_or(PlaneType::Unknown);
        Ok(DisplayPlane {
            plane_id,
            crtc_id: info.crtc().map(u32::from).unwrap_or(0),
            fb_id: info.framebuffer().map(u32::from).unwrap_or(0),
            plane_type,
        })
    }
}

/// Split a Linux `dev_t` the way glibc's `major()`/`minor()` do.
fn dev_major_minor(dev: u64) -> (u64, u64) {
    let major = ((dev >> 8) & 0xfff) | ((dev >> 32) & !0xfff);
    let minor = (dev & 0xff) | ((dev >> 12) & !0xff);
    (major, minor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dev_major_minor() {
        // /dev/dri/card0 is 226:0, renderD128 is 226:128
        assert_eq!(dev_major_minor(0xe200), (226, 0));
        assert_eq!(dev_major_minor(0xe280), (226, 128));
    }

    #[test]
    fn test_open_missing_device() {
        let err = DrmDevice::open("/nonexistent/dri/card9").err().expect("must fail");
        assert!(err.to_string().contains("/nonexistent/dri/card9"));
    }

    #[test]
    fn test_null_handles_are_rejected() {
        let device = DrmDevice::open("/dev/null").expect("open");
        assert!(matches!(device.framebuffer(0), Err(DrmError::NoFramebuffer)));
        assert!(matches!(device.prime_export(0), Err(DrmError::Ioctl("PRIME_HANDLE_TO_FD", _))));
        assert!(matches!(device.plane(0), Err(DrmError::Plane(0, _))));
    }
}
