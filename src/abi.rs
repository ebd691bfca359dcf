//! Kernel DRM uapi layouts and request codes
//!
//! These mirror `drm.h` / `drm_mode.h` field for field so that libdrm and
//! compositors built against the real headers can talk to the shim unmodified.
//! Request codes are derived from the Rust struct sizes, so a layout mistake
//! shows up as an unrecognized request instead of silent memory corruption.

use std::ffi::{c_char, c_int, c_ulong};
use std::mem::size_of;

/// DRM fourcc format codes
pub mod fourcc {
    pub const XRGB8888: u32 = 0x34325258; // 'XR24'
    pub const ARGB8888: u32 = 0x34325241; // 'AR24'
    pub const RGB565: u32 = 0x36314752; // 'RG16'
}

// =============================================================================
// Request code encoding (asm-generic/ioctl.h)
// =============================================================================

const DRM_IOCTL_BASE: c_ulong = 0x64; // 'd'

const IOC_NONE: c_ulong = 0;
const IOC_WRITE: c_ulong = 1;
const IOC_READ: c_ulong = 2;

const fn ioc(dir: c_ulong, nr: c_ulong, size: usize) -> c_ulong {
    (dir << 30) | ((size as c_ulong) << 16) | (DRM_IOCTL_BASE << 8) | nr
}

const fn drm_io(nr: c_ulong) -> c_ulong {
    ioc(IOC_NONE, nr, 0)
}

const fn drm_iow<T>(nr: c_ulong) -> c_ulong {
    ioc(IOC_WRITE, nr, size_of::<T>())
}

const fn drm_iowr<T>(nr: c_ulong) -> c_ulong {
    ioc(IOC_READ | IOC_WRITE, nr, size_of::<T>())
}

/// True if the request carries the DRM ioctl type byte.
pub fn is_drm_request(request: c_ulong) -> bool {
    (request >> 8) & 0xff == DRM_IOCTL_BASE
}

pub const DRM_IOCTL_VERSION: c_ulong = drm_iowr::<DrmVersion>(0x00);
pub const DRM_IOCTL_GEM_CLOSE: c_ulong = drm_iow::<DrmGemClose>(0x09);
pub const DRM_IOCTL_GEM_FLINK: c_ulong = drm_iowr::<DrmGemFlink>(0x0a);
pub const DRM_IOCTL_GEM_OPEN: c_ulong = drm_iowr::<DrmGemOpen>(0x0b);
pub const DRM_IOCTL_GET_CAP: c_ulong = drm_iowr::<DrmGetCap>(0x0c);
pub const DRM_IOCTL_SET_CLIENT_CAP: c_ulong = drm_iow::<DrmSetClientCap>(0x0d);
pub const DRM_IOCTL_SET_MASTER: c_ulong = drm_io(0x1e);
pub const DRM_IOCTL_DROP_MASTER: c_ulong = drm_io(0x1f);

pub const DRM_IOCTL_MODE_GETRESOURCES: c_ulong = drm_iowr::<DrmModeCardRes>(0xa0);
pub const DRM_IOCTL_MODE_GETCRTC: c_ulong = drm_iowr::<DrmModeCrtc>(0xa1);
pub const DRM_IOCTL_MODE_SETCRTC: c_ulong = drm_iowr::<DrmModeCrtc>(0xa2);
pub const DRM_IOCTL_MODE_CURSOR: c_ulong = drm_iowr::<DrmModeCursor>(0xa3);
pub const DRM_IOCTL_MODE_GETENCODER: c_ulong = drm_iowr::<DrmModeGetEncoder>(0xa6);
pub const DRM_IOCTL_MODE_GETCONNECTOR: c_ulong = drm_iowr::<DrmModeGetConnector>(0xa7);
pub const DRM_IOCTL_MODE_GETPROPERTY: c_ulong = drm_iowr::<DrmModeGetProperty>(0xaa);
pub const DRM_IOCTL_MODE_GETPROPBLOB: c_ulong = drm_iowr::<DrmModeGetBlob>(0xac);
pub const DRM_IOCTL_MODE_GETFB: c_ulong = drm_iowr::<DrmModeFbCmd>(0xad);
pub const DRM_IOCTL_MODE_ADDFB: c_ulong = drm_iowr::<DrmModeFbCmd>(0xae);
pub const DRM_IOCTL_MODE_RMFB: c_ulong = drm_iowr::<u32>(0xaf);
pub const DRM_IOCTL_MODE_PAGE_FLIP: c_ulong = drm_iowr::<DrmModeCrtcPageFlip>(0xb0);
pub const DRM_IOCTL_MODE_CREATE_DUMB: c_ulong = drm_iowr::<DrmModeCreateDumb>(0xb2);
pub const DRM_IOCTL_MODE_MAP_DUMB: c_ulong = drm_iowr::<DrmModeMapDumb>(0xb3);
pub const DRM_IOCTL_MODE_DESTROY_DUMB: c_ulong = drm_iowr::<DrmModeDestroyDumb>(0xb4);
pub const DRM_IOCTL_MODE_GETPLANERESOURCES: c_ulong = drm_iowr::<DrmModeGetPlaneRes>(0xb5);
pub const DRM_IOCTL_MODE_GETPLANE: c_ulong = drm_iowr::<DrmModeGetPlane>(0xb6);
pub const DRM_IOCTL_MODE_SETPLANE: c_ulong = drm_iowr::<DrmModeSetPlane>(0xb7);
pub const DRM_IOCTL_MODE_ADDFB2: c_ulong = drm_iowr::<DrmModeFbCmd2>(0xb8);
pub const DRM_IOCTL_MODE_OBJ_GETPROPERTIES: c_ulong = drm_iowr::<DrmModeObjGetProperties>(0xb9);
pub const DRM_IOCTL_MODE_OBJ_SETPROPERTY: c_ulong = drm_iowr::<DrmModeObjSetProperty>(0xba);
pub const DRM_IOCTL_MODE_ATOMIC: c_ulong = drm_iowr::<DrmModeAtomic>(0xbc);
pub const DRM_IOCTL_MODE_CREATEPROPBLOB: c_ulong = drm_iowr::<DrmModeCreateBlob>(0xbd);
pub const DRM_IOCTL_MODE_DESTROYPROPBLOB: c_ulong = drm_iowr::<DrmModeDestroyBlob>(0xbe);

// =============================================================================
// Capabilities
// =============================================================================

pub const DRM_CAP_DUMB_BUFFER: u64 = 0x1;
pub const DRM_CAP_VBLANK_HIGH_CRTC: u64 = 0x2;
pub const DRM_CAP_DUMB_PREFERRED_DEPTH: u64 = 0x3;
pub const DRM_CAP_DUMB_PREFER_SHADOW: u64 = 0x4;
pub const DRM_CAP_PRIME: u64 = 0x5;
pub const DRM_CAP_TIMESTAMP_MONOTONIC: u64 = 0x6;
pub const DRM_CAP_ASYNC_PAGE_FLIP: u64 = 0x7;
pub const DRM_CAP_CURSOR_WIDTH: u64 = 0x8;
pub const DRM_CAP_CURSOR_HEIGHT: u64 = 0x9;
pub const DRM_CAP_ADDFB2_MODIFIERS: u64 = 0x10;
pub const DRM_CAP_CRTC_IN_VBLANK_EVENT: u64 = 0x12;

pub const DRM_CLIENT_CAP_UNIVERSAL_PLANES: u64 = 2;
pub const DRM_CLIENT_CAP_ATOMIC: u64 = 3;

// =============================================================================
// Mode object constants
// =============================================================================

pub const DRM_MODE_CONNECTED: u32 = 1;
pub const DRM_MODE_CONNECTOR_VIRTUAL: u32 = 15;
pub const DRM_MODE_ENCODER_VIRTUAL: u32 = 5;
pub const DRM_MODE_SUBPIXEL_UNKNOWN: u32 = 1;

pub const DRM_MODE_TYPE_PREFERRED: u32 = 1 << 3;
pub const DRM_MODE_TYPE_DRIVER: u32 = 1 << 6;

pub const DRM_MODE_OBJECT_CRTC: u32 = 0xcccc_cccc;
pub const DRM_MODE_OBJECT_CONNECTOR: u32 = 0xc0c0_c0c0;
pub const DRM_MODE_OBJECT_ENCODER: u32 = 0xe0e0_e0e0;
pub const DRM_MODE_OBJECT_PLANE: u32 = 0xeeee_eeee;
pub const DRM_MODE_OBJECT_ANY: u32 = 0;

pub const DRM_MODE_PROP_RANGE: u32 = 1 << 1;
pub const DRM_MODE_PROP_IMMUTABLE: u32 = 1 << 2;
pub const DRM_MODE_PROP_ENUM: u32 = 1 << 3;
pub const DRM_MODE_PROP_OBJECT: u32 = 1 << 6;
pub const DRM_MODE_PROP_ATOMIC: u32 = 0x8000_0000;

pub const DRM_PLANE_TYPE_OVERLAY: u64 = 0;
pub const DRM_PLANE_TYPE_PRIMARY: u64 = 1;
pub const DRM_PLANE_TYPE_CURSOR: u64 = 2;

pub const DRM_MODE_DPMS_ON: u64 = 0;
pub const DRM_MODE_DPMS_STANDBY: u64 = 1;
pub const DRM_MODE_DPMS_SUSPEND: u64 = 2;
pub const DRM_MODE_DPMS_OFF: u64 = 3;

pub const DRM_MODE_PAGE_FLIP_EVENT: u32 = 0x01;
pub const DRM_MODE_ATOMIC_TEST_ONLY: u32 = 0x0100;
pub const DRM_MODE_ATOMIC_NONBLOCK: u32 = 0x0200;
pub const DRM_MODE_ATOMIC_ALLOW_MODESET: u32 = 0x0400;

pub const DRM_EVENT_FLIP_COMPLETE: u32 = 0x02;

pub const DRM_DISPLAY_MODE_LEN: usize = 32;
pub const DRM_PROP_NAME_LEN: usize = 32;

// =============================================================================
// Structures
// =============================================================================

#[repr(C)]
pub struct DrmVersion {
    pub version_major: c_int,
    pub version_minor: c_int,
    pub version_patchlevel: c_int,
    pub name_len: libc::size_t,
    pub name: *mut c_char,
    pub date_len: libc::size_t,
    pub date: *mut c_char,
    pub desc_len: libc::size_t,
    pub desc: *mut c_char,
}

impl std::fmt::Debug for DrmVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmVersion")
            .field("name_len", &self.name_len)
            .field("date_len", &self.date_len)
            .field("desc_len", &self.desc_len)
            .finish()
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmGemClose {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmGemFlink {
    pub handle: u32,
    pub name: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmGemOpen {
    pub name: u32,
    pub handle: u32,
    pub size: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmGetCap {
    pub capability: u64,
    pub value: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmSetClientCap {
    pub capability: u64,
    pub value: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmModeCardRes {
    pub fb_id_ptr: u64,
    pub crtc_id_ptr: u64,
    pub connector_id_ptr: u64,
    pub encoder_id_ptr: u64,
    pub count_fbs: u32,
    pub count_crtcs: u32,
    pub count_connectors: u32,
    pub count_encoders: u32,
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrmModeModeinfo {
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub type_: u32,
    pub name: [c_char; DRM_DISPLAY_MODE_LEN],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmModeCrtc {
    pub set_connectors_ptr: u64,
    pub count_connectors: u32,
    pub crtc_id: u32,
    pub fb_id: u32,
    pub x: u32,
    pub y: u32,
    pub gamma_size: u32,
    pub mode_valid: u32,
    pub mode: DrmModeModeinfo,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmModeCursor {
    pub flags: u32,
    pub crtc_id: u32,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub handle: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmModeGetEncoder {
    pub encoder_id: u32,
    pub encoder_type: u32,
    pub crtc_id: u32,
    pub possible_crtcs: u32,
    pub possible_clones: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmModeGetConnector {
    pub encoders_ptr: u64,
    pub modes_ptr: u64,
    pub props_ptr: u64,
    pub prop_values_ptr: u64,
    pub count_modes: u32,
    pub count_props: u32,
    pub count_encoders: u32,
    pub encoder_id: u32,
    pub connector_id: u32,
    pub connector_type: u32,
    pub connector_type_id: u32,
    pub connection: u32,
    pub mm_width: u32,
    pub mm_height: u32,
    pub subpixel: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmModePropertyEnum {
    pub value: u64,
    pub name: [c_char; DRM_PROP_NAME_LEN],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmModeGetProperty {
    pub values_ptr: u64,
    pub enum_blob_ptr: u64,
    pub prop_id: u32,
    pub flags: u32,
    pub name: [c_char; DRM_PROP_NAME_LEN],
    pub count_values: u32,
    pub count_enum_blobs: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmModeGetBlob {
    pub blob_id: u32,
    pub length: u32,
    pub data: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmModeFbCmd {
    pub fb_id: u32,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub bpp: u32,
    pub depth: u32,
    pub handle: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmModeFbCmd2 {
    pub fb_id: u32,
    pub width: u32,
    pub height: u32,
    pub pixel_format: u32,
    pub flags: u32,
    pub handles: [u32; 4],
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
    pub modifier: [u64; 4],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmModeCrtcPageFlip {
    pub crtc_id: u32,
    pub fb_id: u32,
    pub flags: u32,
    pub reserved: u32,
    pub user_data: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmModeCreateDumb {
    pub height: u32,
    pub width: u32,
    pub bpp: u32,
    pub flags: u32,
    pub handle: u32,
    pub pitch: u32,
    pub size: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmModeMapDumb {
    pub handle: u32,
    pub pad: u32,
    pub offset: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmModeDestroyDumb {
    pub handle: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmModeGetPlaneRes {
    pub plane_id_ptr: u64,
    pub count_planes: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmModeGetPlane {
    pub plane_id: u32,
    pub crtc_id: u32,
    pub fb_id: u32,
    pub possible_crtcs: u32,
    pub gamma_size: u32,
    pub count_format_types: u32,
    pub format_type_ptr: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmModeSetPlane {
    pub plane_id: u32,
    pub crtc_id: u32,
    pub fb_id: u32,
    pub flags: u32,
    pub crtc_x: i32,
    pub crtc_y: i32,
    pub crtc_w: u32,
    pub crtc_h: u32,
    // Source values are 16.16 fixed point; note the kernel's h-before-w order
    pub src_x: u32,
    pub src_y: u32,
    pub src_h: u32,
    pub src_w: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmModeObjGetProperties {
    pub props_ptr: u64,
    pub prop_values_ptr: u64,
    pub count_props: u32,
    pub obj_id: u32,
    pub obj_type: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmModeObjSetProperty {
    pub value: u64,
    pub prop_id: u32,
    pub obj_id: u32,
    pub obj_type: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmModeAtomic {
    pub flags: u32,
    pub count_objs: u32,
    pub objs_ptr: u64,
    pub count_props_ptr: u64,
    pub props_ptr: u64,
    pub prop_values_ptr: u64,
    pub reserved: u64,
    pub user_data: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmModeCreateBlob {
    pub data: u64,
    pub length: u32,
    pub blob_id: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmModeDestroyBlob {
    pub blob_id: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmEvent {
    pub type_: u32,
    pub length: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmEventVblank {
    pub base: DrmEvent,
    pub user_data: u64,
    pub tv_sec: u32,
    pub tv_usec: u32,
    pub sequence: u32,
    pub crtc_id: u32,
}

// =============================================================================
// Caller memory helpers
// =============================================================================

/// Fixed-size NUL-terminated name as used by mode and property structs.
pub fn fixed_name<const N: usize>(name: &str) -> [c_char; N] {
    let mut out = [0 as c_char; N];
    for (dst, &b) in out.iter_mut().zip(name.as_bytes().iter().take(N - 1)) {
        *dst = b as c_char;
    }
    out
}

/// Read a fixed-size name back into a `String`, stopping at the first NUL.
pub fn name_to_string(name: &[c_char]) -> String {
    let bytes: Vec<u8> = name.iter().take_while(|&&c| c != 0).map(|&c| c as u8).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Write `items` into a caller-owned array announced as holding `capacity`
/// entries. Returns the number written.
///
/// # Safety
/// A non-zero `ptr` must point to writable memory for `capacity` aligned `T`s.
pub unsafe fn copy_to_user<T: Copy>(ptr: u64, capacity: u32, items: &[T]) -> usize {
    if ptr == 0 {
        return 0;
    }
    let n = items.len().min(capacity as usize);
    std::ptr::copy_nonoverlapping(items.as_ptr(), ptr as usize as *mut T, n);
    n
}

/// Read `count` entries from a caller-owned array.
///
/// # Safety
/// A non-zero `ptr` must point to readable memory for `count` aligned `T`s.
pub unsafe fn copy_from_user<T: Copy>(ptr: u64, count: u32) -> Vec<T> {
    if ptr == 0 || count == 0 {
        return Vec::new();
    }
    std::slice::from_raw_parts(ptr as usize as *const T, count as usize).to_vec()
}

/// Copy a string into a caller buffer of `cap` bytes, truncating as needed.
/// Returns the full length of `s`, which the version request reports back.
///
/// # Safety
/// A non-null `dst` must be writable for `cap` bytes.
pub unsafe fn copy_str_to_user(dst: *mut c_char, cap: usize, s: &str) -> usize {
    if !dst.is_null() && cap > 0 {
        let n = s.len().min(cap);
        std::ptr::copy_nonoverlapping(s.as_ptr(), dst as *mut u8, n);
    }
    s.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_sizes_match_kernel() {
        assert_eq!(size_of::<DrmModeCardRes>(), 64);
        assert_eq!(size_of::<DrmModeModeinfo>(), 68);
        assert_eq!(size_of::<DrmModeCrtc>(), 104);
        assert_eq!(size_of::<DrmModeGetConnector>(), 80);
        assert_eq!(size_of::<DrmModeGetProperty>(), 64);
        assert_eq!(size_of::<DrmModeFbCmd>(), 28);
        assert_eq!(size_of::<DrmModeFbCmd2>(), 104);
        assert_eq!(size_of::<DrmModeCreateDumb>(), 32);
        assert_eq!(size_of::<DrmModeMapDumb>(), 16);
        assert_eq!(size_of::<DrmModeGetPlaneRes>(), 16);
        assert_eq!(size_of::<DrmModeGetPlane>(), 32);
        assert_eq!(size_of::<DrmModeSetPlane>(), 48);
        assert_eq!(size_of::<DrmModeObjGetProperties>(), 32);
        assert_eq!(size_of::<DrmModeObjSetProperty>(), 24);
        assert_eq!(size_of::<DrmModeAtomic>(), 56);
        assert_eq!(size_of::<DrmModeCreateBlob>(), 16);
        assert_eq!(size_of::<DrmEventVblank>(), 32);
    }

    #[test]
    fn test_request_codes() {
        // Values as produced by the C macros on Linux
        assert_eq!(DRM_IOCTL_MODE_CREATE_DUMB, 0xc02064b2);
        assert_eq!(DRM_IOCTL_MODE_MAP_DUMB, 0xc01064b3);
        assert_eq!(DRM_IOCTL_MODE_GETRESOURCES, 0xc04064a0);
        assert_eq!(DRM_IOCTL_MODE_ATOMIC, 0xc03864bc);
        assert_eq!(DRM_IOCTL_SET_MASTER, 0x641e);
        assert!(is_drm_request(DRM_IOCTL_MODE_PAGE_FLIP));
        assert!(!is_drm_request(libc::TIOCGWINSZ as c_ulong));
    }

    #[test]
    fn test_fixed_name_truncates() {
        let name: [c_char; 8] = fixed_name("1080x2340@60");
        assert_eq!(name_to_string(&name), "1080x23");
        assert_eq!(name[7], 0);
    }

    #[test]
    fn test_copy_to_user_respects_capacity() {
        let mut out = [0u32; 2];
        let written = unsafe { copy_to_user(out.as_mut_ptr() as u64, 2, &[7u32, 8, 9]) };
        assert_eq!(written, 2);
        assert_eq!(out, [7, 8]);
        assert_eq!(unsafe { copy_to_user::<u32>(0, 4, &[1]) }, 0);
    }
}
