//! Owned GEM handles, PRIME descriptors and memory mappings
//!
//! Every handle releases itself on drop, so a session tears down in reverse
//! acquisition order simply by dropping its fields.

use super::ioctl::{self, DmaBufSync, DrmGemClose};
use super::{DrmError, Result};
use log::warn;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;

/// A read-only shared mapping of a buffer object
pub struct MappedRegion {
    ptr: *mut u8,
    len: usize,
}

impl MappedRegion {
    /// Map `len` bytes of `fd` at `offset` read-only.
    pub fn map(fd: RawFd, len: usize, offset: u64) -> Result<Self> {
        if len == 0 {
            return Err(DrmError::Map(io::Error::from(io::ErrorKind::InvalidInput)));
        }
        // SAFETY: a fresh shared read-only mapping; the kernel validates fd and offset.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd,
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(DrmError::Map(io::Error::last_os_error()));
        }
        Ok(Self { ptr: ptr as *mut u8, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View of the mapped bytes. The producer may still be writing to them
    /// unless the caller holds a dma-buf read sync.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live mapping owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

/// A GEM handle opened on the device fd; closed with `GEM_CLOSE` on drop
pub struct GemHandle {
    fd: Rc<OwnedFd>,
    handle: u32,
    size: u64,
}

impl GemHandle {
    pub(super) fn new(fd: Rc<OwnedFd>, handle: u32, size: u64) -> Self {
        Self { fd, handle, size }
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// Size of the buffer object as reported by `GEM_OPEN`
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for GemHandle {
    fn drop(&mut self) {
        let mut arg = DrmGemClose { handle: self.handle, pad: 0 };
        if let Err(e) = ioctl::ioctl(self.fd.as_raw_fd(), ioctl::DRM_IOCTL_GEM_CLOSE, &mut arg) {
            warn!("GEM_CLOSE of handle {} failed: {}", self.handle, e);
        }
    }
}

/// A dma-buf file descriptor exported through PRIME
pub struct PrimeBuffer {
    fd: OwnedFd,
}

impl From<OwnedFd> for PrimeBuffer {
    fn from(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl PrimeBuffer {
    /// Block until the producer has finished with the buffer for reading.
    pub fn sync_start(&self) -> Result<()> {
        self.sync(ioctl::DMA_BUF_SYNC_START | ioctl::DMA_BUF_SYNC_READ)
    }

    pub fn sync_end(&self) -> Result<()> {
        self.sync(ioctl::DMA_BUF_SYNC_END | ioctl::DMA_BUF_SYNC_READ)
    }

    fn sync(&self, flags: u64) -> Result<()> {
        let mut arg = DmaBufSync { flags };
        ioctl::ioctl(self.fd.as_raw_fd(), ioctl::DMA_BUF_IOCTL_SYNC, &mut arg)
            .map_err(|e| DrmError::Ioctl("DMA_BUF_IOCTL_SYNC", e))
    }
}

impl AsRawFd for PrimeBuffer {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
