//! Platform window surfaces
//!
//! The compositor draws into whatever implements [`WindowSurface`]. On Android
//! that is an `ANativeWindow` handed over by the window manager; tests and the
//! smoke binary use [`MemorySurface`].

use crate::{Error, Result};
use std::sync::{Arc, Mutex, PoisonError};

/// A locked, CPU-writable view of the surface's back buffer. Pixels are
/// 32 bits; `stride` is in pixels.
#[derive(Debug, Clone, Copy)]
pub struct LockedBuffer {
    pub bits: *mut u32,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
}

/// Native window buffer format, `HAL_PIXEL_FORMAT_BGRA_8888`. Its bytes in
/// memory are B, G, R, A, the layout of a little-endian XRGB8888 word, so
/// framebuffer pixels are copied without swizzling.
pub const SURFACE_FORMAT: i32 = 5;

pub trait WindowSurface: Send {
    /// Current size in pixels
    fn size(&self) -> (u32, u32);

    /// Block until the back buffer is writable.
    fn lock(&mut self) -> Result<LockedBuffer>;

    /// Release the buffer taken by `lock` and queue it for display.
    fn unlock_and_post(&mut self) -> Result<()>;
}

struct MemoryPixels {
    pixels: Vec<u32>,
    width: u32,
    height: u32,
    stride: u32,
    posts: u64,
    locked: bool,
    fail_lock: bool,
}

/// Heap-backed surface. Clones share the same pixels, so a test can keep a
/// handle after giving one to the device.
#[derive(Clone)]
pub struct MemorySurface {
    inner: Arc<Mutex<MemoryPixels>>,
}

impl MemorySurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_stride(width, height, width)
    }

    /// Surface whose rows are `stride` pixels apart, like a padded window buffer.
    pub fn with_stride(width: u32, height: u32, stride: u32) -> Self {
        let stride = stride.max(width);
        Self {
            inner: Arc::new(Mutex::new(MemoryPixels {
                pixels: vec![0; stride as usize * height as usize],
                width,
                height,
                stride,
                posts: 0,
                locked: false,
                fail_lock: false,
            })),
        }
    }

    fn pixels(&self) -> std::sync::MutexGuard<'_, MemoryPixels> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<u32> {
        let p = self.pixels();
        if x >= p.width || y >= p.height {
            return None;
        }
        p.pixels.get((y * p.stride + x) as usize).copied()
    }

    pub fn fill(&self, value: u32) {
        self.pixels().pixels.iter_mut().for_each(|px| *px = value);
    }

    /// Number of completed `unlock_and_post` calls
    pub fn posts(&self) -> u64 {
        self.pixels().posts
    }

    /// Make subsequent locks fail, as a window torn down by the platform would.
    pub fn set_fail_lock(&self, fail: bool) {
        self.pixels().fail_lock = fail;
    }
}

impl WindowSurface for MemorySurface {
    fn size(&self) -> (u32, u32) {
        let p = self.pixels();
        (p.width, p.height)
    }

    fn lock(&mut self) -> Result<LockedBuffer> {
        let mut p = self.pixels();
        if p.fail_lock {
            return Err(Error::SurfaceUnavailable("memory surface lock refused".into()));
        }
        if p.locked {
            return Err(Error::SurfaceUnavailable("memory surface already locked".into()));
        }
        p.locked = true;
        Ok(LockedBuffer {
            bits: p.pixels.as_mut_ptr(),
            width: p.width,
            height: p.height,
            stride: p.stride,
        })
    }

    fn unlock_and_post(&mut self) -> Result<()> {
        let mut p = self.pixels();
        if !p.locked {
            return Err(Error::SurfaceUnavailable("post without lock".into()));
        }
        p.locked = false;
        p.posts += 1;
        Ok(())
    }
}

#[cfg(target_os = "android")]
pub use native::NativeWindowSurface;

#[cfg(target_os = "android")]
mod native {
    use super::*;
    use std::ffi::{c_int, c_void};
    use std::ptr::NonNull;
    use tracing::{debug, info};

    #[repr(C)]
    pub struct ANativeWindow {
        _private: [u8; 0],
    }

    #[repr(C)]
    struct ANativeWindowBuffer {
        width: i32,
        height: i32,
        stride: i32,
        format: i32,
        bits: *mut c_void,
        reserved: [u32; 6],
    }

    #[link(name = "android")]
    extern "C" {
        fn ANativeWindow_acquire(window: *mut ANativeWindow);
        fn ANativeWindow_release(window: *mut ANativeWindow);
        fn ANativeWindow_getWidth(window: *mut ANativeWindow) -> i32;
        fn ANativeWindow_getHeight(window: *mut ANativeWindow) -> i32;
        fn ANativeWindow_setBuffersGeometry(window: *mut ANativeWindow, w: i32, h: i32, format: i32) -> c_int;
        fn ANativeWindow_lock(window: *mut ANativeWindow, out: *mut ANativeWindowBuffer, dirty: *mut c_void) -> c_int;
        fn ANativeWindow_unlockAndPost(window: *mut ANativeWindow) -> c_int;
    }

    /// Surface backed by an `ANativeWindow` reference
    pub struct NativeWindowSurface {
        window: NonNull<ANativeWindow>,
    }

    // The window reference is only touched while the device lock is held
    unsafe impl Send for NativeWindowSurface {}

    impl NativeWindowSurface {
        /// Take a reference on `window` and switch it to 32-bit BGRA buffers.
        ///
        /// # Safety
        /// `window` must be a valid `ANativeWindow` pointer.
        pub unsafe fn from_raw(window: *mut c_void) -> Result<Self> {
            let window = NonNull::new(window as *mut ANativeWindow)
                .ok_or_else(|| Error::SurfaceUnavailable("null native window".into()))?;
            ANativeWindow_acquire(window.as_ptr());
            if ANativeWindow_setBuffersGeometry(window.as_ptr(), 0, 0, SURFACE_FORMAT) != 0 {
                ANativeWindow_release(window.as_ptr());
                return Err(Error::SurfaceUnavailable("setBuffersGeometry failed".into()));
            }
            let surface = Self { window };
            let (w, h) = surface.size();
            info!("Native window attached: {}x{}", w, h);
            Ok(surface)
        }
    }

    impl WindowSurface for NativeWindowSurface {
        fn size(&self) -> (u32, u32) {
            unsafe {
                (
                    ANativeWindow_getWidth(self.window.as_ptr()).max(0) as u32,
                    ANativeWindow_getHeight(self.window.as_ptr()).max(0) as u32,
                )
            }
        }

        fn lock(&mut self) -> Result<LockedBuffer> {
            let mut buffer = ANativeWindowBuffer {
                width: 0,
                height: 0,
                stride: 0,
                format: 0,
                bits: std::ptr::null_mut(),
                reserved: [0; 6],
            };
            let ret = unsafe { ANativeWindow_lock(self.window.as_ptr(), &mut buffer, std::ptr::null_mut()) };
            if ret != 0 || buffer.bits.is_null() {
                return Err(Error::SurfaceUnavailable(format!("ANativeWindow_lock returned {}", ret)));
            }
            Ok(LockedBuffer {
                bits: buffer.bits as *mut u32,
                width: buffer.width.max(0) as u32,
                height: buffer.height.max(0) as u32,
                stride: buffer.stride.max(0) as u32,
            })
        }

        fn unlock_and_post(&mut self) -> Result<()> {
            let ret = unsafe { ANativeWindow_unlockAndPost(self.window.as_ptr()) };
            if ret != 0 {
                return Err(Error::SurfaceUnavailable(format!("unlockAndPost returned {}", ret)));
            }
            Ok(())
        }
    }

    impl Drop for NativeWindowSurface {
        fn drop(&mut self) {
            debug!("Releasing native window");
            unsafe { ANativeWindow_release(self.window.as_ptr()) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_post_cycle() {
        let mut surface = MemorySurface::new(4, 2);
        let handle = surface.clone();
        let buf = surface.lock().unwrap();
        assert_eq!((buf.width, buf.height, buf.stride), (4, 2, 4));
        unsafe { *buf.bits.add(5) = 0xff00_ff00 };
        assert!(surface.lock().is_err());
        surface.unlock_and_post().unwrap();
        assert_eq!(handle.pixel(1, 1), Some(0xff00_ff00));
        assert_eq!(handle.posts(), 1);
        assert!(surface.unlock_and_post().is_err());
    }

    #[test]
    fn test_surface_format_matches_xrgb_bytes() {
        assert_eq!(SURFACE_FORMAT, 5);
        // red 0xff, green 0x80, blue 0x40 lands in memory blue first
        let xrgb = 0x00ff_8040u32;
        let [b, g, r, _] = xrgb.to_le_bytes();
        assert_eq!((r, g, b), (0xff, 0x80, 0x40));

        let mut surface = MemorySurface::new(1, 1);
        let buf = surface.lock().unwrap();
        unsafe { *buf.bits = xrgb };
        let bytes = unsafe { std::slice::from_raw_parts(buf.bits as *const u8, 4) };
        assert_eq!(bytes[..3], [0x40, 0x80, 0xff]);
        surface.unlock_and_post().unwrap();
    }

    #[test]
    fn test_lock_failure_toggle() {
        let mut surface = MemorySurface::with_stride(4, 4, 8);
        surface.set_fail_lock(true);
        assert!(matches!(surface.lock(), Err(Error::SurfaceUnavailable(_))));
        surface.set_fail_lock(false);
        assert_eq!(surface.lock().unwrap().stride, 8);
        assert_eq!(surface.pixel(4, 0), None);
    }
}
