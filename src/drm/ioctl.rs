//! Raw ioctls the `drm` crate does not wrap
//!
//! GEM flink/open/close, the i915 GTT mmap offset and dma-buf CPU access
//! sync. Structures mirror the kernel UAPI headers (`drm.h`, `i915_drm.h`,
//! `dma-buf.h`); request numbers are computed from the structure sizes.

use libc::{c_int, c_ulong, c_void};
use std::io;
use std::mem::size_of;

const IOC_NRBITS: c_ulong = 8;
const IOC_TYPEBITS: c_ulong = 8;
const IOC_SIZEBITS: c_ulong = 14;

const IOC_NRSHIFT: c_ulong = 0;
const IOC_TYPESHIFT: c_ulong = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: c_ulong = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: c_ulong = IOC_SIZESHIFT + IOC_SIZEBITS;

const IOC_WRITE: c_ulong = 1;
const IOC_READ: c_ulong = 2;

const fn ioc(dir: c_ulong, ty: u8, nr: u32, size: usize) -> c_ulong {
    (dir << IOC_DIRSHIFT)
        | ((ty as c_ulong) << IOC_TYPESHIFT)
        | ((nr as c_ulong) << IOC_NRSHIFT)
        | ((size as c_ulong) << IOC_SIZESHIFT)
}

const fn iow<T>(ty: u8, nr: u32) -> c_ulong {
    ioc(IOC_WRITE, ty, nr, size_of::<T>())
}

const fn iowr<T>(ty: u8, nr: u32) -> c_ulong {
    ioc(IOC_READ | IOC_WRITE, ty, nr, size_of::<T>())
}

const DRM_IOCTL_BASE: u8 = b'd';
const DMA_BUF_BASE: u8 = b'b';
const DRM_COMMAND_BASE: u32 = 0x40;

#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmGemClose {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmGemFlink {
    pub handle: u32,
    pub name: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmGemOpen {
    pub name: u32,
    pub handle: u32,
    pub size: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmI915GemMmapGtt {
    pub handle: u32,
    pub pad: u32,
    pub offset: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct DmaBufSync {
    pub flags: u64,
}

pub const DRM_IOCTL_GEM_CLOSE: c_ulong = iow::<DrmGemClose>(DRM_IOCTL_BASE, 0x09);
pub const DRM_IOCTL_GEM_FLINK: c_ulong = iowr::<DrmGemFlink>(DRM_IOCTL_BASE, 0x0a);
pub const DRM_IOCTL_GEM_OPEN: c_ulong = iowr::<DrmGemOpen>(DRM_IOCTL_BASE, 0x0b);
pub const DRM_IOCTL_I915_GEM_MMAP_GTT: c_ulong =
    iowr::<DrmI915GemMmapGtt>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + 0x24);
pub const DMA_BUF_IOCTL_SYNC: c_ulong = iow::<DmaBufSync>(DMA_BUF_BASE, 0);

pub const DMA_BUF_SYNC_READ: u64 = 1 << 0;
pub const DMA_BUF_SYNC_START: u64 = 0 << 2;
pub const DMA_BUF_SYNC_END: u64 = 1 << 2;

/// Issue an ioctl, restarting on `EINTR`/`EAGAIN` the way libdrm's
/// `drmIoctl` does.
pub fn ioctl<T>(fd: c_int, request: c_ulong, arg: &mut T) -> io::Result<()> {
    loop {
        // SAFETY: `arg` is a live, exclusively borrowed `#[repr(C)]` value
        // whose size is encoded into `request`.
        let ret = unsafe { libc::ioctl(fd, request as _, arg as *mut T as *mut c_void) };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
            _ => return Err(err),
        }
    }
}
