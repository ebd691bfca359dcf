//! Page-flip compositing
//!
//! A flip locks the window surface, copies every active window's buffer into
//! it from the lowest z-order up, then posts the surface. Windows whose
//! framebuffer or buffer has gone away are skipped. If the surface cannot be
//! locked nothing is drawn and the flip fails.

use crate::registry::{Registry, Window};
use crate::surface::{LockedBuffer, WindowSurface};
use crate::Result;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

/// Cumulative compositing statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlipStats {
    pub flips: u64,
    pub windows_drawn: u64,
    pub last_composite: Duration,
    pub total_composite: Duration,
    pub pixels_copied: u64,
}

/// Destination and source rectangles of one window after clipping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blit {
    pub dst_x: u32,
    pub dst_y: u32,
    pub src_x: u32,
    pub src_y: u32,
    pub width: u32,
    pub height: u32,
}

/// Clip `window` against a `surface`-sized target and a `buffer`-sized source.
/// A negative origin moves the source offset so only the visible part is read.
pub fn clip(window: &Window, surface: (u32, u32), buffer: (u32, u32)) -> Option<Blit> {
    let x0 = i64::from(window.x).max(0);
    let y0 = i64::from(window.y).max(0);
    let x1 = (i64::from(window.x) + i64::from(window.width)).min(i64::from(surface.0));
    let y1 = (i64::from(window.y) + i64::from(window.height)).min(i64::from(surface.1));
    if x1 <= x0 || y1 <= y0 {
        return None;
    }

    let src_x = x0 - i64::from(window.x);
    let src_y = y0 - i64::from(window.y);
    let width = (x1 - x0).min(i64::from(buffer.0) - src_x);
    let height = (y1 - y0).min(i64::from(buffer.1) - src_y);
    if width <= 0 || height <= 0 {
        return None;
    }

    Some(Blit {
        dst_x: x0 as u32,
        dst_y: y0 as u32,
        src_x: src_x as u32,
        src_y: src_y as u32,
        width: width as u32,
        height: height as u32,
    })
}

/// Copy `count` pixels in 64, 32, 16 and 4 pixel blocks, then one at a time.
///
/// # Safety
/// `dst` and `src` must be valid for `count` pixels and must not overlap.
pub unsafe fn copy_pixels(dst: *mut u32, src: *const u32, count: usize) {
    let mut done = 0;
    for block in [64, 32, 16, 4] {
        while count - done >= block {
            copy_block(dst.add(done), src.add(done), block);
            done += block;
        }
    }
    while done < count {
        *dst.add(done) = *src.add(done);
        done += 1;
    }
}

/// Safe entry point for [`copy_pixels`] over slices.
pub fn copy_row(dst: &mut [u32], src: &[u32]) {
    let count = dst.len().min(src.len());
    unsafe { copy_pixels(dst.as_mut_ptr(), src.as_ptr(), count) }
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
unsafe fn copy_block(dst: *mut u32, src: *const u32, pixels: usize) {
    use std::arch::x86_64::{__m128i, _mm_loadu_si128, _mm_storeu_si128};
    // SSE2 is part of the x86_64 baseline
    for lane in (0..pixels).step_by(4) {
        let v = _mm_loadu_si128(src.add(lane) as *const __m128i);
        _mm_storeu_si128(dst.add(lane) as *mut __m128i, v);
    }
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
unsafe fn copy_block(dst: *mut u32, src: *const u32, pixels: usize) {
    use std::arch::aarch64::{vld1q_u32, vst1q_u32};
    for lane in (0..pixels).step_by(4) {
        vst1q_u32(dst.add(lane), vld1q_u32(src.add(lane)));
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
unsafe fn copy_block(dst: *mut u32, src: *const u32, pixels: usize) {
    std::ptr::copy_nonoverlapping(src, dst, pixels);
}

/// Draw one window into the locked target. Returns pixels copied, or `None`
/// when the window has nothing drawable.
fn draw_window(registry: &Registry, window: &Window, target: &LockedBuffer) -> Option<u64> {
    let Some(fb) = registry.framebuffer(window.fb_id) else {
        debug!("Window fb={} has no framebuffer, skipping", window.fb_id);
        return None;
    };
    let Some(buffer) = registry.buffer(fb.handle) else {
        debug!("Window fb={} lost buffer {}, skipping", window.fb_id, fb.handle);
        return None;
    };
    let Some(memory) = buffer.memory.as_ref() else {
        debug!("Window fb={} buffer {} never mapped, skipping", window.fb_id, fb.handle);
        return None;
    };
    if fb.bpp != 32 || fb.pitch % 4 != 0 {
        debug!("Window fb={} has {} bpp pitch {}, skipping", window.fb_id, fb.bpp, fb.pitch);
        return None;
    }

    let blit = clip(window, (target.width, target.height), (fb.width, fb.height))?;
    let src_stride = (fb.pitch / 4) as usize;
    let src_base = memory.as_ptr() as *const u32;

    for row in 0..blit.height as usize {
        let src_offset = (blit.src_y as usize + row) * src_stride + blit.src_x as usize;
        let dst_offset = (blit.dst_y as usize + row) * target.stride as usize + blit.dst_x as usize;
        // Both offsets stay inside their buffers: `clip` bounds the rectangle by
        // the framebuffer and surface sizes, and a framebuffer's rows always
        // end inside its buffer.
        unsafe {
            copy_pixels(target.bits.add(dst_offset), src_base.add(src_offset), blit.width as usize);
        }
    }

    trace!(
        "Drew fb={} at {},{} {}x{} z={}",
        window.fb_id,
        blit.dst_x,
        blit.dst_y,
        blit.width,
        blit.height,
        window.z
    );
    Some(u64::from(blit.width) * u64::from(blit.height))
}

/// Run one compositing pass and present the result.
pub fn composite(registry: &Registry, surface: &mut dyn WindowSurface, stats: &mut FlipStats) -> Result<()> {
    let start = Instant::now();

    let target = surface.lock().map_err(|e| {
        error!("Cannot lock window surface: {}", e);
        e
    })?;

    let mut drawn = 0u64;
    let mut pixels = 0u64;
    for window in registry.windows_by_z() {
        if let Some(copied) = draw_window(registry, &window, &target) {
            drawn += 1;
            pixels += copied;
        }
    }

    surface.unlock_and_post().map_err(|e| {
        error!("Cannot post window surface: {}", e);
        e
    })?;

    stats.flips += 1;
    if drawn > 0 {
        let elapsed = start.elapsed();
        stats.windows_drawn += drawn;
        stats.pixels_copied += pixels;
        stats.last_composite = elapsed;
        stats.total_composite += elapsed;
        debug!("Flip {}: {} windows, {} pixels in {:?}", stats.flips, drawn, pixels, elapsed);
    } else {
        trace!("Flip {}: nothing to draw", stats.flips);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::BufferAllocator;
    use crate::surface::MemorySurface;
    use crate::Error;

    fn window(x: i32, y: i32, width: u32, height: u32) -> Window {
        Window {
            fb_id: 1,
            x,
            y,
            width,
            height,
            z: 0,
            active: true,
            primary: false,
        }
    }

    /// Buffer + framebuffer + window filled with `color`, returns the fb id.
    fn solid_window(reg: &mut Registry, color: u32, size: u32, at: (i32, i32), z: u32) -> u32 {
        let handle = reg.create_dumb(size, size, 32).unwrap().handle;
        let addr = reg.map_dumb(handle, &BufferAllocator::new(1 << 30)).unwrap();
        let pixels = unsafe { std::slice::from_raw_parts_mut(addr as usize as *mut u32, (size * size) as usize) };
        pixels.fill(color);
        let fb = reg.add_framebuffer(handle, size, size, size * 4, 32, 24, 0).unwrap();
        reg.set_window_geometry(fb, at.0, at.1, size, size).unwrap();
        reg.set_window_z(fb, z).unwrap();
        fb
    }

    #[test]
    fn test_copy_row_all_widths() {
        for width in [0usize, 1, 3, 4, 5, 17, 63, 64, 65, 127, 200] {
            let src: Vec<u32> = (0..width as u32).collect();
            let mut dst = vec![0xdead_beef; width];
            copy_row(&mut dst, &src);
            assert_eq!(dst, src, "width {}", width);
        }
    }

    #[test]
    fn test_clip_inside_and_outside() {
        assert_eq!(
            clip(&window(2, 3, 4, 4), (10, 10), (4, 4)),
            Some(Blit { dst_x: 2, dst_y: 3, src_x: 0, src_y: 0, width: 4, height: 4 })
        );
        assert_eq!(clip(&window(10, 0, 4, 4), (10, 10), (4, 4)), None);
        assert_eq!(clip(&window(-4, 0, 4, 4), (10, 10), (4, 4)), None);
        assert_eq!(clip(&window(0, 0, 0, 4), (10, 10), (4, 4)), None);
    }

    #[test]
    fn test_clip_edges() {
        // Right edge cut
        assert_eq!(
            clip(&window(8, 8, 4, 4), (10, 10), (4, 4)),
            Some(Blit { dst_x: 8, dst_y: 8, src_x: 0, src_y: 0, width: 2, height: 2 })
        );
        // Negative origin shifts the source
        assert_eq!(
            clip(&window(-1, -2, 4, 4), (10, 10), (4, 4)),
            Some(Blit { dst_x: 0, dst_y: 0, src_x: 1, src_y: 2, width: 3, height: 2 })
        );
        // Window larger than its buffer copies only the buffer
        assert_eq!(
            clip(&window(0, 0, 8, 8), (10, 10), (3, 2)),
            Some(Blit { dst_x: 0, dst_y: 0, src_x: 0, src_y: 0, width: 3, height: 2 })
        );
    }

    #[test]
    fn test_occlusion_follows_z_order() {
        let mut reg = Registry::new();
        let surface = MemorySurface::new(16, 16);
        let mut target = surface.clone();
        let mut stats = FlipStats::default();

        // Higher z created first so slot order differs from z order
        solid_window(&mut reg, 0x00ff_0000, 8, (4, 4), 1);
        solid_window(&mut reg, 0x0000_00ff, 8, (0, 0), 0);

        composite(&reg, &mut target, &mut stats).unwrap();
        assert_eq!(surface.pixel(5, 5), Some(0x00ff_0000));
        assert_eq!(surface.pixel(1, 1), Some(0x0000_00ff));
        assert_eq!(surface.pixel(15, 15), Some(0));
        assert_eq!(stats.windows_drawn, 2);
        assert_eq!(stats.pixels_copied, 128);
        assert_eq!(surface.posts(), 1);
    }

    #[test]
    fn test_empty_flip_records_no_throughput() {
        let reg = Registry::new();
        let surface = MemorySurface::new(4, 4);
        let mut target = surface.clone();
        let mut stats = FlipStats::default();
        composite(&reg, &mut target, &mut stats).unwrap();
        assert_eq!(stats.flips, 1);
        assert_eq!(stats.pixels_copied, 0);
        assert_eq!(stats.total_composite, Duration::ZERO);
    }

    #[test]
    fn test_destroyed_buffer_is_skipped() {
        let mut reg = Registry::new();
        let surface = MemorySurface::new(8, 8);
        let mut target = surface.clone();
        let mut stats = FlipStats::default();
        let fb = solid_window(&mut reg, 0x1234_5678, 4, (0, 0), 0);
        let handle = reg.framebuffer(fb).unwrap().handle;
        reg.destroy_dumb(handle).unwrap();

        composite(&reg, &mut target, &mut stats).unwrap();
        assert_eq!(surface.pixel(0, 0), Some(0));
        assert_eq!(stats.windows_drawn, 0);
    }

    #[test]
    fn test_framebuffer_pitch_and_size_are_honored() {
        let mut reg = Registry::new();
        let surface = MemorySurface::new(8, 8);
        let mut target = surface.clone();
        let mut stats = FlipStats::default();

        // 8x4 buffer viewed as a 4x8 framebuffer with a 16 byte pitch
        let handle = reg.create_dumb(8, 4, 32).unwrap().handle;
        let addr = reg.map_dumb(handle, &BufferAllocator::new(1 << 30)).unwrap();
        let pixels = unsafe { std::slice::from_raw_parts_mut(addr as usize as *mut u32, 32) };
        for (i, p) in pixels.iter_mut().enumerate() {
            *p = i as u32 + 1;
        }
        let fb = reg.add_framebuffer(handle, 4, 8, 16, 32, 24, 0).unwrap();
        reg.set_window_geometry(fb, 0, 0, 8, 8).unwrap();

        composite(&reg, &mut target, &mut stats).unwrap();
        assert_eq!(surface.pixel(0, 1), Some(5));
        assert_eq!(surface.pixel(3, 7), Some(32));
        assert_eq!(surface.pixel(4, 0), Some(0));
        assert_eq!(stats.pixels_copied, 32);
    }

    #[test]
    fn test_lock_failure_draws_nothing() {
        let mut reg = Registry::new();
        let surface = MemorySurface::new(8, 8);
        let mut target = surface.clone();
        let mut stats = FlipStats::default();
        solid_window(&mut reg, 0xffff_ffff, 4, (0, 0), 0);
        surface.set_fail_lock(true);

        let err = composite(&reg, &mut target, &mut stats).unwrap_err();
        assert!(matches!(err, Error::SurfaceUnavailable(_)));
        assert_eq!(stats, FlipStats::default());
        assert_eq!(surface.posts(), 0);
    }

    #[test]
    fn test_padded_surface_stride() {
        let mut reg = Registry::new();
        let surface = MemorySurface::with_stride(6, 6, 16);
        let mut target = surface.clone();
        solid_window(&mut reg, 0xabcd_ef01, 4, (3, 3), 0);
        composite(&reg, &mut target, &mut FlipStats::default()).unwrap();
        assert_eq!(surface.pixel(5, 5), Some(0xabcd_ef01));
        assert_eq!(surface.pixel(2, 5), Some(0));
    }
}
