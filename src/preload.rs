//! Exported libc interposers for LD_PRELOAD use
//!
//! Each export forwards to one process-wide [`Interceptor`] built on first
//! use from `DRM_SHIM_*` settings. If the real entry points cannot be found
//! every call fails with `ENOSYS`.

use crate::config::ShimConfig;
use crate::device::Device;
use crate::interceptor::{set_errno, DlsymBackend, Interceptor};
use crate::logging;
use std::ffi::{c_char, c_int, c_ulong, c_void};
use std::sync::OnceLock;
use tracing::{error, info};

static SHIM: OnceLock<Option<Interceptor<DlsymBackend>>> = OnceLock::new();

/// Library constructor - runs when the library is loaded via LD_PRELOAD
#[used]
#[link_section = ".init_array"]
static LIBRARY_INIT: unsafe extern "C" fn() = library_init;

unsafe extern "C" fn library_init() {
    logging::init();
    info!("drm-surface-shim loaded, intercepting /dev/dri");
}

fn shim() -> Option<&'static Interceptor<DlsymBackend>> {
    SHIM.get_or_init(|| match DlsymBackend::resolve() {
        Ok(backend) => Some(Interceptor::new(backend, Device::new(ShimConfig::from_env()))),
        Err(e) => {
            error!("Cannot resolve real libc functions: {}", e);
            None
        }
    })
    .as_ref()
}

fn unavailable() -> c_int {
    set_errno(libc::ENOSYS);
    -1
}

// =============================================================================
// libc interposers
// =============================================================================

#[no_mangle]
pub unsafe extern "C" fn open(path: *const c_char, flags: c_int, mode: libc::mode_t) -> c_int {
    match shim() {
        Some(shim) => shim.open(path, flags, mode),
        None => unavailable(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn open64(path: *const c_char, flags: c_int, mode: libc::mode_t) -> c_int {
    open(path, flags, mode)
}

#[no_mangle]
pub unsafe extern "C" fn openat(dirfd: c_int, path: *const c_char, flags: c_int, mode: libc::mode_t) -> c_int {
    match shim() {
        Some(shim) => shim.openat(dirfd, path, flags, mode),
        None => unavailable(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    match shim() {
        Some(shim) => shim.ioctl(fd, request, arg),
        None => unavailable(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn mmap(
    addr: *mut c_void,
    len: usize,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: libc::off_t,
) -> *mut c_void {
    mmap64(addr, len, prot, flags, fd, libc::off64_t::from(offset))
}

#[no_mangle]
pub unsafe extern "C" fn mmap64(
    addr: *mut c_void,
    len: usize,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: libc::off64_t,
) -> *mut c_void {
    match shim() {
        Some(shim) => shim.mmap(addr, len, prot, flags, fd, offset),
        None => {
            unavailable();
            libc::MAP_FAILED
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn munmap(addr: *mut c_void, len: usize) -> c_int {
    match shim() {
        Some(shim) => shim.munmap(addr, len),
        None => unavailable(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    match shim() {
        Some(shim) => shim.close(fd),
        None => unavailable(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: usize) -> isize {
    match shim() {
        Some(shim) => shim.read(fd, buf, count),
        None => unavailable() as isize,
    }
}

// =============================================================================
// Window manager controls
// =============================================================================

fn status(result: crate::Result<()>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(e) => {
            error!("window control failed: {}", e);
            e.status()
        }
    }
}

/// Hand the shim the `ANativeWindow*` that flips should draw into.
#[cfg(target_os = "android")]
#[no_mangle]
pub unsafe extern "C" fn drm_shim_set_native_window(window: *mut c_void) -> c_int {
    let Some(shim) = shim() else {
        return -libc::ENOSYS;
    };
    status(crate::surface::NativeWindowSurface::from_raw(window).map(|surface| {
        shim.device().set_surface(Box::new(surface));
    }))
}

#[no_mangle]
pub extern "C" fn drm_shim_set_window_geometry(fb_id: u32, x: c_int, y: c_int, width: u32, height: u32) -> c_int {
    match shim() {
        Some(shim) => status(shim.device().set_window_geometry(fb_id, x, y, width, height)),
        None => -libc::ENOSYS,
    }
}

#[no_mangle]
pub extern "C" fn drm_shim_set_window_z(fb_id: u32, z: u32) -> c_int {
    match shim() {
        Some(shim) => status(shim.device().set_window_z(fb_id, z)),
        None => -libc::ENOSYS,
    }
}

#[no_mangle]
pub extern "C" fn drm_shim_set_window_visible(fb_id: u32, visible: c_int) -> c_int {
    match shim() {
        Some(shim) => status(shim.device().set_window_visible(fb_id, visible != 0)),
        None => -libc::ENOSYS,
    }
}

/// Destroy a window and release the buffer behind it.
#[no_mangle]
pub extern "C" fn drm_shim_destroy_window(fb_id: u32) -> c_int {
    match shim() {
        Some(shim) => status(shim.device().destroy_window(fb_id)),
        None => -libc::ENOSYS,
    }
}
