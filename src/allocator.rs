//! Backing memory for dumb buffers
//!
//! Small buffers come from the heap. Larger ones prefer a platform hardware
//! buffer (Android `AHardwareBuffer`, asked for GPU sampling as well as CPU
//! access, then CPU access alone), then an anonymous shared-memory segment,
//! then the heap again. Each fallback logs a
//! warning; only a failure of the last step reaches the caller.

use crate::{Error, Result};
use std::alloc::{self, Layout};
use std::ptr::NonNull;
use tracing::{debug, error, warn};

/// Heap blocks are aligned for the widest vector copy in the compositor.
const HEAP_ALIGN: usize = 64;

#[cfg(any(target_os = "android", test))]
const AHARDWAREBUFFER_USAGE_CPU_READ_OFTEN: u64 = 3;
#[cfg(any(target_os = "android", test))]
const AHARDWAREBUFFER_USAGE_CPU_WRITE_OFTEN: u64 = 3 << 4;
#[cfg(any(target_os = "android", test))]
const AHARDWAREBUFFER_USAGE_GPU_SAMPLED_IMAGE: u64 = 1 << 8;

/// Usage sets tried in order for a BLOB hardware buffer. Many gralloc
/// implementations refuse GPU usage on BLOB, so the last one is CPU only.
#[cfg(any(target_os = "android", test))]
const HARDWARE_USAGES: [u64; 2] = [
    AHARDWAREBUFFER_USAGE_CPU_READ_OFTEN | AHARDWAREBUFFER_USAGE_CPU_WRITE_OFTEN | AHARDWAREBUFFER_USAGE_GPU_SAMPLED_IMAGE,
    AHARDWAREBUFFER_USAGE_CPU_READ_OFTEN | AHARDWAREBUFFER_USAGE_CPU_WRITE_OFTEN,
];

/// Which mechanism backs a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Heap,
    SharedMemory,
    HardwareBuffer,
}

enum Backing {
    Heap { layout: Layout },
    SharedMemory { map_len: usize },
    #[cfg(target_os = "android")]
    HardwareBuffer { buffer: *mut android::AHardwareBuffer },
}

/// A zero-initialized, CPU-mappable memory region
pub struct BackingMemory {
    ptr: NonNull<u8>,
    len: usize,
    backing: Backing,
}

// The region is plain memory owned by this value; access is serialized by the
// device lock.
unsafe impl Send for BackingMemory {}

impl BackingMemory {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Address as reported through the map-dumb offset field
    pub fn address(&self) -> u64 {
        self.ptr.as_ptr() as usize as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn strategy(&self) -> Strategy {
        match self.backing {
            Backing::Heap { .. } => Strategy::Heap,
            Backing::SharedMemory { .. } => Strategy::SharedMemory,
            #[cfg(target_os = "android")]
            Backing::HardwareBuffer { .. } => Strategy::HardwareBuffer,
        }
    }

    /// True if `addr..addr+len` lies inside this region.
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        let start = self.address();
        addr >= start && addr.saturating_add(len as u64) <= start + self.len as u64
    }
}

impl Drop for BackingMemory {
    fn drop(&mut self) {
        debug!("Freeing {:?} backing of {} bytes", self.strategy(), self.len);
        match self.backing {
            Backing::Heap { layout } => unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) },
            Backing::SharedMemory { map_len } => unsafe {
                // Raw syscall: the exported munmap would re-enter the device lock
                libc::syscall(libc::SYS_munmap, self.ptr.as_ptr(), map_len);
            },
            #[cfg(target_os = "android")]
            Backing::HardwareBuffer { buffer } => unsafe {
                android::AHardwareBuffer_unlock(buffer, std::ptr::null_mut());
                android::AHardwareBuffer_release(buffer);
            },
        }
    }
}

/// Chooses and performs the allocation strategy for a requested size
#[derive(Debug, Clone)]
pub struct BufferAllocator {
    heap_threshold: usize,
    hardware_buffers: bool,
}

impl BufferAllocator {
    pub fn new(heap_threshold: usize) -> Self {
        Self {
            heap_threshold,
            hardware_buffers: hardware_buffers_supported(),
        }
    }

    /// Strategy the allocator will try first for `size` bytes.
    pub fn preferred(&self, size: usize) -> Strategy {
        if size < self.heap_threshold {
            Strategy::Heap
        } else if self.hardware_buffers {
            Strategy::HardwareBuffer
        } else {
            Strategy::SharedMemory
        }
    }

    pub fn allocate(&self, size: usize) -> Result<BackingMemory> {
        if size == 0 {
            return Err(Error::invalid("zero-sized allocation"));
        }

        match self.preferred(size) {
            Strategy::Heap => return alloc_heap(size),
            Strategy::HardwareBuffer => match alloc_hardware(size) {
                Ok(mem) => return Ok(mem),
                Err(e) => warn!("Hardware buffer of {} bytes failed ({}), trying shared memory", size, e),
            },
            Strategy::SharedMemory => {}
        }

        match alloc_shared(size) {
            Ok(mem) => return Ok(mem),
            Err(e) => warn!("Shared memory of {} bytes failed ({}), falling back to heap", size, e),
        }

        alloc_heap(size).map_err(|e| {
            error!("All allocation strategies failed for {} bytes", size);
            e
        })
    }
}

fn alloc_heap(size: usize) -> Result<BackingMemory> {
    let layout = Layout::from_size_align(size, HEAP_ALIGN)
        .map_err(|e| Error::Alloc(format!("bad layout for {} bytes: {}", size, e)))?;
    let ptr = unsafe { alloc::alloc_zeroed(layout) };
    let ptr = NonNull::new(ptr).ok_or_else(|| Error::Alloc(format!("heap exhausted ({} bytes)", size)))?;
    debug!("Heap allocation of {} bytes at {:p}", size, ptr);
    Ok(BackingMemory {
        ptr,
        len: size,
        backing: Backing::Heap { layout },
    })
}

fn alloc_shared(size: usize) -> Result<BackingMemory> {
    let fd = create_shared_fd(size)?;

    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    // The mapping keeps the segment alive
    unsafe { libc::close(fd) };

    if ptr == libc::MAP_FAILED {
        return Err(Error::Alloc(format!("mmap: {}", std::io::Error::last_os_error())));
    }
    let ptr = NonNull::new(ptr as *mut u8).ok_or_else(|| Error::Alloc("mmap returned null".into()))?;
    debug!("Shared memory allocation of {} bytes at {:p}", size, ptr);
    Ok(BackingMemory {
        ptr,
        len: size,
        backing: Backing::SharedMemory { map_len: size },
    })
}

#[cfg(not(target_os = "android"))]
fn create_shared_fd(size: usize) -> Result<libc::c_int> {
    let fd = unsafe { libc::memfd_create(c"drm-surface-shim".as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(Error::Alloc(format!("memfd_create: {}", std::io::Error::last_os_error())));
    }
    if unsafe { libc::ftruncate(fd, size as libc::off_t) } < 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(Error::Alloc(format!("ftruncate: {}", err)));
    }
    Ok(fd)
}

#[cfg(target_os = "android")]
fn create_shared_fd(size: usize) -> Result<libc::c_int> {
    let fd = unsafe { android::ASharedMemory_create(c"drm-surface-shim".as_ptr(), size) };
    if fd < 0 {
        return Err(Error::Alloc(format!("ASharedMemory_create: {}", std::io::Error::last_os_error())));
    }
    Ok(fd)
}

#[cfg(not(target_os = "android"))]
fn hardware_buffers_supported() -> bool {
    false
}

#[cfg(not(target_os = "android"))]
fn alloc_hardware(_size: usize) -> Result<BackingMemory> {
    Err(Error::Alloc("hardware buffers are not available on this platform".into()))
}

#[cfg(target_os = "android")]
fn hardware_buffers_supported() -> bool {
    android::sdk_version() >= 26
}

#[cfg(target_os = "android")]
fn alloc_hardware(size: usize) -> Result<BackingMemory> {
    use android::*;

    let width = u32::try_from(size).map_err(|_| Error::Alloc("hardware buffer too large".into()))?;
    let mut buffer: *mut AHardwareBuffer = std::ptr::null_mut();
    let mut ret = 0;
    for usage in HARDWARE_USAGES {
        let desc = AHardwareBuffer_Desc {
            width,
            height: 1,
            layers: 1,
            format: AHARDWAREBUFFER_FORMAT_BLOB,
            usage,
            stride: 0,
            rfu0: 0,
            rfu1: 0,
        };
        ret = unsafe { AHardwareBuffer_allocate(&desc, &mut buffer) };
        if ret == 0 && !buffer.is_null() {
            break;
        }
        debug!("AHardwareBuffer_allocate with usage 0x{:x} returned {}", usage, ret);
        buffer = std::ptr::null_mut();
    }
    if buffer.is_null() {
        return Err(Error::Alloc(format!("AHardwareBuffer_allocate returned {}", ret)));
    }

    // Stays locked for CPU access until the buffer is dropped
    let mut vaddr: *mut libc::c_void = std::ptr::null_mut();
    let usage = AHARDWAREBUFFER_USAGE_CPU_READ_OFTEN | AHARDWAREBUFFER_USAGE_CPU_WRITE_OFTEN;
    let ret = unsafe { AHardwareBuffer_lock(buffer, usage, -1, std::ptr::null(), &mut vaddr) };
    let Some(ptr) = NonNull::new(vaddr as *mut u8).filter(|_| ret == 0) else {
        unsafe { AHardwareBuffer_release(buffer) };
        return Err(Error::Alloc(format!("AHardwareBuffer_lock returned {}", ret)));
    };

    unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, size) };
    debug!("Hardware buffer allocation of {} bytes at {:p}", size, ptr);
    Ok(BackingMemory {
        ptr,
        len: size,
        backing: Backing::HardwareBuffer { buffer },
    })
}

#[cfg(target_os = "android")]
#[allow(non_camel_case_types)]
mod android {
    use std::ffi::{c_char, c_int, c_void};

    #[repr(C)]
    pub struct AHardwareBuffer {
        _data: [u8; 0],
    }

    #[repr(C)]
    pub struct AHardwareBuffer_Desc {
        pub width: u32,
        pub height: u32,
        pub layers: u32,
        pub format: u32,
        pub usage: u64,
        pub stride: u32,
        pub rfu0: u32,
        pub rfu1: u64,
    }

    #[repr(C)]
    pub struct ARect {
        pub left: i32,
        pub top: i32,
        pub right: i32,
        pub bottom: i32,
    }

    pub const AHARDWAREBUFFER_FORMAT_BLOB: u32 = 0x21;

    #[link(name = "nativewindow")]
    extern "C" {
        pub fn AHardwareBuffer_allocate(desc: *const AHardwareBuffer_Desc, out: *mut *mut AHardwareBuffer) -> c_int;
        pub fn AHardwareBuffer_release(buffer: *mut AHardwareBuffer);
        pub fn AHardwareBuffer_lock(
            buffer: *mut AHardwareBuffer,
            usage: u64,
            fence: i32,
            rect: *const ARect,
            out_virtual_address: *mut *mut c_void,
        ) -> c_int;
        pub fn AHardwareBuffer_unlock(buffer: *mut AHardwareBuffer, fence: *mut i32) -> c_int;
    }

    #[link(name = "android")]
    extern "C" {
        pub fn ASharedMemory_create(name: *const c_char, size: usize) -> c_int;
    }

    extern "C" {
        fn __system_property_get(name: *const c_char, value: *mut c_char) -> c_int;
    }

    /// `ro.build.version.sdk`, or 0 if it cannot be read
    pub fn sdk_version() -> u32 {
        let mut value = [0 as c_char; 92];
        let len = unsafe { __system_property_get(c"ro.build.version.sdk".as_ptr(), value.as_mut_ptr()) };
        if len <= 0 {
            return 0;
        }
        let bytes: Vec<u8> = value[..len as usize].iter().map(|&c| c as u8).collect();
        std::str::from_utf8(&bytes).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(0)
    }
}
