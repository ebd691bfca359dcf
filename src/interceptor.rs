//! Syscall routing between the emulated device and the real C library
//!
//! [`Interceptor`] decides, call by call, whether an `open`/`ioctl`/`mmap`/...
//! belongs to the emulated device or should go to the process's real entry
//! point. The real entry points sit behind [`SyscallBackend`]: in a preloaded
//! library that is [`DlsymBackend`], in tests a scripted fake.

use crate::abi::is_drm_request;
use crate::device::Device;
use crate::{Error, Result};
use std::ffi::{c_char, c_int, c_uint, c_ulong, c_void, CStr};
use std::os::unix::io::RawFd;
use std::sync::atomic::{fence, Ordering};
use tracing::{debug, info, trace, warn};

// RTLD_NEXT for getting the next symbol in the lookup chain (for LD_PRELOAD)
const RTLD_NEXT: *mut c_void = -1isize as *mut c_void;

/// Paths that open the emulated device
pub const DEVICE_PATHS: [&str; 4] = [
    "/dev/dri/card0",
    "/dev/dri/card1",
    "/dev/dri/renderD128",
    "/dev/dri/controlD64",
];

/// The process's real C library entry points. Implementations report failure
/// the way libc does: a -1 (or `MAP_FAILED`) return with `errno` set.
pub trait SyscallBackend: Send + Sync {
    unsafe fn open(&self, path: *const c_char, flags: c_int, mode: libc::mode_t) -> c_int;
    unsafe fn openat(&self, dirfd: c_int, path: *const c_char, flags: c_int, mode: libc::mode_t) -> c_int;
    unsafe fn ioctl(&self, fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int;
    unsafe fn mmap(
        &self,
        addr: *mut c_void,
        len: usize,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: libc::off64_t,
    ) -> *mut c_void;
    unsafe fn munmap(&self, addr: *mut c_void, len: usize) -> c_int;
    unsafe fn close(&self, fd: c_int) -> c_int;
    unsafe fn read(&self, fd: c_int, buf: *mut c_void, count: usize) -> isize;
}

type OpenFn = unsafe extern "C" fn(*const c_char, c_int, ...) -> c_int;
type OpenatFn = unsafe extern "C" fn(c_int, *const c_char, c_int, ...) -> c_int;
type IoctlFn = unsafe extern "C" fn(c_int, c_ulong, ...) -> c_int;
type MmapFn = unsafe extern "C" fn(*mut c_void, usize, c_int, c_int, c_int, libc::off64_t) -> *mut c_void;

/// Entry point taking a 64-bit offset. `off_t` is already 64 bits wide on
/// 64-bit targets, where some C libraries drop the `mmap64` alias.
#[cfg(target_pointer_width = "64")]
const MMAP_SYMBOL: &CStr = c"mmap";
#[cfg(not(target_pointer_width = "64"))]
const MMAP_SYMBOL: &CStr = c"mmap64";
type MunmapFn = unsafe extern "C" fn(*mut c_void, usize) -> c_int;
type CloseFn = unsafe extern "C" fn(c_int) -> c_int;
type ReadFn = unsafe extern "C" fn(c_int, *mut c_void, usize) -> isize;

/// Real entry points looked up with `dlsym(RTLD_NEXT, ...)`
pub struct DlsymBackend {
    open: OpenFn,
    openat: OpenatFn,
    ioctl: IoctlFn,
    mmap: MmapFn,
    munmap: MunmapFn,
    close: CloseFn,
    read: ReadFn,
}

unsafe fn next_symbol<T: Copy>(name: &CStr) -> Result<T> {
    let ptr = libc::dlsym(RTLD_NEXT, name.as_ptr());
    if ptr.is_null() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no next definition of {:?}", name),
        )));
    }
    Ok(std::mem::transmute_copy::<*mut c_void, T>(&ptr))
}

impl DlsymBackend {
    /// Resolve every wrapped symbol. Call once, before any call is routed.
    pub fn resolve() -> Result<Self> {
        let backend = unsafe {
            Self {
                open: next_symbol(c"open")?,
                openat: next_symbol(c"openat")?,
                ioctl: next_symbol(c"ioctl")?,
                mmap: next_symbol(MMAP_SYMBOL)?,
                munmap: next_symbol(c"munmap")?,
                close: next_symbol(c"close")?,
                read: next_symbol(c"read")?,
            }
        };
        // Publish the pointers before any other thread can route through them
        fence(Ordering::SeqCst);
        info!("Real function pointers initialized");
        Ok(backend)
    }
}

impl SyscallBackend for DlsymBackend {
    unsafe fn open(&self, path: *const c_char, flags: c_int, mode: libc::mode_t) -> c_int {
        (self.open)(path, flags, mode as c_uint)
    }

    unsafe fn openat(&self, dirfd: c_int, path: *const c_char, flags: c_int, mode: libc::mode_t) -> c_int {
        (self.openat)(dirfd, path, flags, mode as c_uint)
    }

    unsafe fn ioctl(&self, fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
        (self.ioctl)(fd, request, arg)
    }

    unsafe fn mmap(
        &self,
        addr: *mut c_void,
        len: usize,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: libc::off64_t,
    ) -> *mut c_void {
        (self.mmap)(addr, len, prot, flags, fd, offset)
    }

    unsafe fn munmap(&self, addr: *mut c_void, len: usize) -> c_int {
        (self.munmap)(addr, len)
    }

    unsafe fn close(&self, fd: c_int) -> c_int {
        (self.close)(fd)
    }

    unsafe fn read(&self, fd: c_int, buf: *mut c_void, count: usize) -> isize {
        (self.read)(fd, buf, count)
    }
}

pub fn set_errno(code: c_int) {
    #[cfg(target_os = "android")]
    unsafe {
        *libc::__errno() = code;
    }
    #[cfg(not(target_os = "android"))]
    unsafe {
        *libc::__errno_location() = code;
    }
}

fn fail(err: &Error) -> c_int {
    set_errno(err.errno());
    -1
}

/// True for paths that should open the emulated device.
pub fn is_device_path(path: &CStr) -> bool {
    let bytes = path.to_bytes();
    DEVICE_PATHS.iter().any(|p| p.as_bytes() == bytes) || bytes.starts_with(b"/dev/dri/")
}

/// Mode is only meaningful, and only present in the caller's varargs, when
/// the flags can create a file.
fn wants_mode(flags: c_int) -> bool {
    flags & libc::O_CREAT != 0 || flags & libc::O_TMPFILE == libc::O_TMPFILE
}

/// Routes each wrapped call to the device or to the real backend.
pub struct Interceptor<B: SyscallBackend> {
    backend: B,
    device: Device,
    // Copied out of the device config so fd checks never take the device lock
    synthetic_fd: RawFd,
}

impl<B: SyscallBackend> Interceptor<B> {
    pub fn new(backend: B, device: Device) -> Self {
        let synthetic_fd = device.synthetic_fd();
        Self {
            backend,
            device,
            synthetic_fd,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn synthetic_fd(&self) -> RawFd {
        self.synthetic_fd
    }

    fn is_synthetic(&self, fd: c_int) -> bool {
        fd == self.synthetic_fd
    }

    /// # Safety
    /// `path` must be null or a valid C string.
    pub unsafe fn open(&self, path: *const c_char, flags: c_int, mode: libc::mode_t) -> c_int {
        if !path.is_null() && is_device_path(CStr::from_ptr(path)) {
            info!("open({:?}) intercepted -> fd {}", CStr::from_ptr(path), self.synthetic_fd);
            return self.synthetic_fd;
        }
        let mode = if wants_mode(flags) { mode } else { 0 };
        self.backend.open(path, flags, mode)
    }

    /// # Safety
    /// `path` must be null or a valid C string.
    pub unsafe fn openat(&self, dirfd: c_int, path: *const c_char, flags: c_int, mode: libc::mode_t) -> c_int {
        if !path.is_null() {
            let p = CStr::from_ptr(path);
            if is_device_path(p) || p.to_bytes().starts_with(b"dri/card") {
                info!("openat({:?}) intercepted -> fd {}", p, self.synthetic_fd);
                return self.synthetic_fd;
            }
        }
        let mode = if wants_mode(flags) { mode } else { 0 };
        self.backend.openat(dirfd, path, flags, mode)
    }

    /// # Safety
    /// `arg` must be valid for `request` as the kernel would require.
    pub unsafe fn ioctl(&self, fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
        if !self.is_synthetic(fd) {
            return self.backend.ioctl(fd, request, arg);
        }
        if !is_drm_request(request) {
            debug!("non-DRM ioctl 0x{:x} on device fd", request);
            set_errno(libc::ENOTTY);
            return -1;
        }
        match self.device.ioctl(request, arg) {
            0 => 0,
            status => {
                set_errno(-status);
                -1
            }
        }
    }

    /// Map a dumb buffer. The offset handed out by MAP_DUMB is the buffer's
    /// address, so mapping it just hands that address back. The offset is
    /// 64 bits wide on every target so addresses survive 32-bit `off_t`.
    ///
    /// # Safety
    /// Same contract as `mmap(2)`.
    pub unsafe fn mmap(
        &self,
        addr: *mut c_void,
        len: usize,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: libc::off64_t,
    ) -> *mut c_void {
        if self.is_synthetic(fd) && offset != 0 {
            return match self.device.resolve_mapping(offset as u64, len) {
                Ok(mapped) => mapped as usize as *mut c_void,
                Err(e) => {
                    warn!("mmap of offset 0x{:x} on device fd refused: {}", offset, e);
                    fail(&e);
                    libc::MAP_FAILED
                }
            };
        }
        self.backend.mmap(addr, len, prot, flags, fd, offset)
    }

    /// Buffer memory belongs to the device, so unmapping it is a no-op.
    ///
    /// # Safety
    /// Same contract as `munmap(2)`.
    pub unsafe fn munmap(&self, addr: *mut c_void, len: usize) -> c_int {
        if self.device.is_buffer_address(addr as usize as u64) {
            trace!("munmap of buffer mapping {:p} ignored", addr);
            return 0;
        }
        self.backend.munmap(addr, len)
    }

    /// # Safety
    /// Same contract as `close(2)`.
    pub unsafe fn close(&self, fd: c_int) -> c_int {
        if self.is_synthetic(fd) {
            debug!("close() on device fd, resetting session");
            self.device.reset();
            return 0;
        }
        self.backend.close(fd)
    }

    /// # Safety
    /// `buf` must be writable for `count` bytes.
    pub unsafe fn read(&self, fd: c_int, buf: *mut c_void, count: usize) -> isize {
        if !self.is_synthetic(fd) {
            return self.backend.read(fd, buf, count);
        }
        if buf.is_null() {
            return fail(&Error::invalid("null read buffer")) as isize;
        }
        let out = std::slice::from_raw_parts_mut(buf as *mut u8, count);
        match self.device.read_events(out) {
            Ok(n) => n as isize,
            Err(e) => fail(&e) as isize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::*;
    use crate::config::ShimConfig;
    use crate::surface::MemorySurface;
    use std::sync::Mutex;

    const REAL_FD: c_int = 42;
    const REAL_MAP: usize = 0x7000_0000;

    /// Records every call and answers with fixed values
    #[derive(Default)]
    struct ScriptedBackend {
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn log(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl SyscallBackend for ScriptedBackend {
        unsafe fn open(&self, path: *const c_char, flags: c_int, mode: libc::mode_t) -> c_int {
            self.log(format!("open {} {:o} {:o}", CStr::from_ptr(path).to_string_lossy(), flags, mode));
            REAL_FD
        }

        unsafe fn openat(&self, dirfd: c_int, path: *const c_char, _flags: c_int, _mode: libc::mode_t) -> c_int {
            self.log(format!("openat {} {}", dirfd, CStr::from_ptr(path).to_string_lossy()));
            REAL_FD
        }

        unsafe fn ioctl(&self, fd: c_int, request: c_ulong, _arg: *mut c_void) -> c_int {
            self.log(format!("ioctl {} 0x{:x}", fd, request));
            0
        }

        unsafe fn mmap(
            &self,
            _addr: *mut c_void,
            len: usize,
            _prot: c_int,
            _flags: c_int,
            fd: c_int,
            offset: libc::off64_t,
        ) -> *mut c_void {
            self.log(format!("mmap {} {} 0x{:x}", fd, len, offset));
            REAL_MAP as *mut c_void
        }

        unsafe fn munmap(&self, addr: *mut c_void, _len: usize) -> c_int {
            self.log(format!("munmap {:p}", addr));
            0
        }

        unsafe fn close(&self, fd: c_int) -> c_int {
            self.log(format!("close {}", fd));
            0
        }

        unsafe fn read(&self, fd: c_int, _buf: *mut c_void, _count: usize) -> isize {
            self.log(format!("read {}", fd));
            0
        }
    }

    fn interceptor() -> Interceptor<ScriptedBackend> {
        let config = ShimConfig {
            heap_threshold: 1 << 30,
            ..ShimConfig::default()
        };
        let device = Device::with_surface(config, Box::new(MemorySurface::new(32, 32)));
        Interceptor::new(ScriptedBackend::default(), device)
    }

    fn calls(i: &Interceptor<ScriptedBackend>) -> Vec<String> {
        i.backend.calls.lock().unwrap().clone()
    }

    fn errno() -> i32 {
        std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
    }

    fn mapped_buffer(i: &Interceptor<ScriptedBackend>) -> (u32, u64) {
        let fd = i.synthetic_fd();
        let mut create = DrmModeCreateDumb {
            width: 16,
            height: 16,
            bpp: 32,
            ..Default::default()
        };
        let mut map = DrmModeMapDumb::default();
        unsafe {
            assert_eq!(i.ioctl(fd, DRM_IOCTL_MODE_CREATE_DUMB, &mut create as *mut _ as *mut c_void), 0);
            map.handle = create.handle;
            assert_eq!(i.ioctl(fd, DRM_IOCTL_MODE_MAP_DUMB, &mut map as *mut _ as *mut c_void), 0);
        }
        (create.handle, map.offset)
    }

    #[test]
    fn test_device_paths_get_synthetic_fd() {
        let i = interceptor();
        for path in [c"/dev/dri/card0", c"/dev/dri/renderD128", c"/dev/dri/by-path/platform-card"] {
            assert_eq!(unsafe { i.open(path.as_ptr(), libc::O_RDWR, 0) }, i.synthetic_fd());
        }
        assert_eq!(unsafe { i.openat(libc::AT_FDCWD, c"/dev/dri/card1".as_ptr(), libc::O_RDWR, 0) }, i.synthetic_fd());
        assert!(calls(&i).is_empty());
    }

    #[test]
    fn test_other_paths_pass_through_with_mode() {
        let i = interceptor();
        let fd = unsafe { i.open(c"/tmp/x".as_ptr(), libc::O_RDWR | libc::O_CREAT, 0o644) };
        assert_eq!(fd, REAL_FD);
        let fd = unsafe { i.open(c"/etc/hosts".as_ptr(), libc::O_RDONLY, 0o777) };
        assert_eq!(fd, REAL_FD);
        let log = calls(&i);
        assert!(log[0].starts_with("open /tmp/x") && log[0].ends_with(" 644"));
        assert!(log[1].ends_with(" 0"));
    }

    #[test]
    fn test_ioctl_routing_and_errno() {
        let i = interceptor();
        let fd = i.synthetic_fd();
        let mut junk = [0u8; 16];
        let ret = unsafe { i.ioctl(fd, 0xc010_64fe, junk.as_mut_ptr() as *mut c_void) };
        assert_eq!(ret, -1);
        assert_eq!(errno(), libc::EOPNOTSUPP);

        let ret = unsafe { i.ioctl(fd, libc::TIOCGWINSZ as c_ulong, junk.as_mut_ptr() as *mut c_void) };
        assert_eq!(ret, -1);
        assert_eq!(errno(), libc::ENOTTY);

        let ret = unsafe { i.ioctl(7, DRM_IOCTL_MODE_GETRESOURCES, std::ptr::null_mut()) };
        assert_eq!(ret, 0);
        assert_eq!(calls(&i), vec![format!("ioctl 7 0x{:x}", DRM_IOCTL_MODE_GETRESOURCES)]);
    }

    #[test]
    fn test_mmap_returns_buffer_address() {
        let i = interceptor();
        let fd = i.synthetic_fd();
        let (_, offset) = mapped_buffer(&i);
        let ptr = unsafe {
            i.mmap(
                std::ptr::null_mut(),
                1024,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                offset as libc::off64_t,
            )
        };
        assert_eq!(ptr as usize as u64, offset);

        let bad = unsafe { i.mmap(std::ptr::null_mut(), 16, libc::PROT_READ, libc::MAP_SHARED, fd, 0x10) };
        assert_eq!(bad, libc::MAP_FAILED);
        assert_eq!(errno(), libc::EINVAL);

        let other = unsafe { i.mmap(std::ptr::null_mut(), 64, libc::PROT_READ, libc::MAP_PRIVATE, 3, 0) };
        assert_eq!(other as usize, REAL_MAP);
    }

    #[test]
    fn test_mmap_passes_wide_offsets_through() {
        let i = interceptor();
        let offset: libc::off64_t = 1 << 40;
        let ptr = unsafe { i.mmap(std::ptr::null_mut(), 4096, libc::PROT_READ, libc::MAP_SHARED, 3, offset) };
        assert_eq!(ptr as usize, REAL_MAP);
        assert_eq!(calls(&i), vec!["mmap 3 4096 0x10000000000".to_string()]);
    }

    #[test]
    fn test_munmap_of_buffer_is_noop() {
        let i = interceptor();
        let (_, offset) = mapped_buffer(&i);
        assert_eq!(unsafe { i.munmap(offset as usize as *mut c_void, 1024) }, 0);
        assert!(i.device().is_buffer_address(offset));
        assert_eq!(unsafe { i.munmap(REAL_MAP as *mut c_void, 4096) }, 0);
        assert_eq!(calls(&i).len(), 1);
    }

    #[test]
    fn test_close_resets_device() {
        let i = interceptor();
        let (_, offset) = mapped_buffer(&i);
        assert_eq!(unsafe { i.close(i.synthetic_fd()) }, 0);
        assert!(!i.device().is_buffer_address(offset));
        assert_eq!(unsafe { i.close(5) }, 0);
        assert_eq!(calls(&i), vec!["close 5".to_string()]);
    }

    #[test]
    fn test_read_without_events_is_eagain() {
        let i = interceptor();
        let mut buf = [0u8; 64];
        let ret = unsafe { i.read(i.synthetic_fd(), buf.as_mut_ptr() as *mut c_void, buf.len()) };
        assert_eq!(ret, -1);
        assert_eq!(errno(), libc::EAGAIN);
        assert_eq!(unsafe { i.read(0, buf.as_mut_ptr() as *mut c_void, buf.len()) }, 0);
    }
}
