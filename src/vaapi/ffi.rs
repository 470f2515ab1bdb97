//! Raw libva declarations (va/va.h, va/va_drm.h, va/va_drmcommon.h)

#![allow(non_camel_case_types, non_snake_case, dead_code)]

use libc::{c_char, c_int, c_uint, c_void};

pub type VADisplay = *mut c_void;
pub type VAStatus = c_int;
pub type VAGenericID = c_uint;
pub type VASurfaceID = VAGenericID;
pub type VAImageID = VAGenericID;
pub type VABufferID = VAGenericID;
pub type VAMessageCallback = Option<unsafe extern "C" fn(*mut c_void, *const c_char)>;

pub const VA_STATUS_SUCCESS: VAStatus = 0;
pub const VA_INVALID_ID: VAGenericID = 0xffff_ffff;

pub const VA_SURFACE_ATTRIB_SETTABLE: u32 = 0x0000_0002;
pub const VA_SURFACE_ATTRIB_MEM_TYPE_DRM_PRIME: i32 = 0x2000_0000;
pub const VA_SURFACE_ATTRIB_MEM_TYPE_DRM_PRIME_2: i32 = 0x4000_0000;

// VASurfaceAttribType
pub const VASurfaceAttribPixelFormat: c_int = 1;
pub const VASurfaceAttribMemoryType: c_int = 6;
pub const VASurfaceAttribExternalBufferDescriptor: c_int = 7;

// VAGenericValueType
pub const VAGenericValueTypeInteger: c_int = 1;
pub const VAGenericValueTypePointer: c_int = 3;

const VA_PADDING_LOW: usize = 4;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VAImageFormat {
    pub fourcc: u32,
    pub byte_order: u32,
    pub bits_per_pixel: u32,
    pub depth: u32,
    pub red_mask: u32,
    pub green_mask: u32,
    pub blue_mask: u32,
    pub alpha_mask: u32,
    pub va_reserved: [u32; VA_PADDING_LOW],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VAImage {
    pub image_id: VAImageID,
    pub format: VAImageFormat,
    pub buf: VABufferID,
    pub width: u16,
    pub height: u16,
    pub data_size: u32,
    pub num_planes: u32,
    pub pitches: [u32; 3],
    pub offsets: [u32; 3],
    pub num_palette_entries: i32,
    pub entry_bytes: i32,
    pub component_order: [i8; 4],
    pub va_reserved: [u32; VA_PADDING_LOW],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union VAGenericValueUnion {
    pub i: i32,
    pub f: f32,
    pub p: *mut c_void,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VAGenericValue {
    pub type_: c_int,
    pub value: VAGenericValueUnion,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VASurfaceAttrib {
    pub type_: c_int,
    pub flags: u32,
    pub value: VAGenericValue,
}

impl VASurfaceAttrib {
    pub fn integer(type_: c_int, i: i32) -> Self {
        Self {
            type_,
            flags: VA_SURFACE_ATTRIB_SETTABLE,
            value: VAGenericValue { type_: VAGenericValueTypeInteger, value: VAGenericValueUnion { i } },
        }
    }

    pub fn pointer(type_: c_int, p: *mut c_void) -> Self {
        Self {
            type_,
            flags: VA_SURFACE_ATTRIB_SETTABLE,
            value: VAGenericValue { type_: VAGenericValueTypePointer, value: VAGenericValueUnion { p } },
        }
    }
}

#[repr(C)]
pub struct VASurfaceAttribExternalBuffers {
    pub pixel_format: u32,
    pub width: u32,
    pub height: u32,
    pub data_size: u32,
    pub num_planes: u32,
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
    pub buffers: *mut libc::uintptr_t,
    pub num_buffers: u32,
    pub flags: u32,
    pub private_data: *mut c_void,
    pub va_reserved: [u32; VA_PADDING_LOW],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VADRMPRIMEObject {
    pub fd: c_int,
    pub size: u32,
    pub drm_format_modifier: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VADRMPRIMELayer {
    pub drm_format: u32,
    pub num_planes: u32,
    pub object_index: [u32; 4],
    pub offset: [u32; 4],
    pub pitch: [u32; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VADRMPRIMESurfaceDescriptor {
    pub fourcc: u32,
    pub width: u32,
    pub height: u32,
    pub num_objects: u32,
    pub objects: [VADRMPRIMEObject; 4],
    pub num_layers: u32,
    pub layers: [VADRMPRIMELayer; 4],
}

#[link(name = "va")]
extern "C" {
    pub fn vaInitialize(dpy: VADisplay, major: *mut c_int, minor: *mut c_int) -> VAStatus;
    pub fn vaTerminate(dpy: VADisplay) -> VAStatus;
    pub fn vaErrorStr(status: VAStatus) -> *const c_char;
    pub fn vaQueryVendorString(dpy: VADisplay) -> *const c_char;
    pub fn vaSetErrorCallback(dpy: VADisplay, cb: VAMessageCallback, ctx: *mut c_void) -> VAMessageCallback;
    pub fn vaSetInfoCallback(dpy: VADisplay, cb: VAMessageCallback, ctx: *mut c_void) -> VAMessageCallback;
    pub fn vaCreateSurfaces(
        dpy: VADisplay,
        format: c_uint,
        width: c_uint,
        height: c_uint,
        surfaces: *mut VASurfaceID,
        num_surfaces: c_uint,
        attrib_list: *mut VASurfaceAttrib,
        num_attribs: c_uint,
    ) -> VAStatus;
    pub fn vaDestroySurfaces(dpy: VADisplay, surfaces: *mut VASurfaceID, num_surfaces: c_int) -> VAStatus;
    pub fn vaMaxNumImageFormats(dpy: VADisplay) -> c_int;
    pub fn vaQueryImageFormats(dpy: VADisplay, formats: *mut VAImageFormat, num_formats: *mut c_int) -> VAStatus;
    pub fn vaDeriveImage(dpy: VADisplay, surface: VASurfaceID, image: *mut VAImage) -> VAStatus;
    pub fn vaCreateImage(
        dpy: VADisplay,
        format: *mut VAImageFormat,
        width: c_int,
        height: c_int,
        image: *mut VAImage,
    ) -> VAStatus;
    pub fn vaGetImage(
        dpy: VADisplay,
        surface: VASurfaceID,
        x: c_int,
        y: c_int,
        width: c_uint,
        height: c_uint,
        image: VAImageID,
    ) -> VAStatus;
    pub fn vaDestroyImage(dpy: VADisplay, image: VAImageID) -> VAStatus;
    pub fn vaSyncSurface(dpy: VADisplay, render_target: VASurfaceID) -> VAStatus;
    pub fn vaMapBuffer(dpy: VADisplay, buf: VABufferID, pbuf: *mut *mut c_void) -> VAStatus;
    pub fn vaUnmapBuffer(dpy: VADisplay, buf: VABufferID) -> VAStatus;
}

#[link(name = "va-drm")]
extern "C" {
    pub fn vaGetDisplayDRM(fd: c_int) -> VADisplay;
}
