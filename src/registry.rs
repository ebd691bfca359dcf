//! Virtual device object tables
//!
//! Every emulated object lives in a fixed-capacity table and is identified by
//! a stable integer id, never by address. Requests beyond a table's capacity
//! fail with `OutOfMemory`; lookups of dead ids fail with `InvalidArgument`.
//!
//! # Object IDs
//! - Connector: 1
//! - Encoder: 5
//! - CRTC: 10
//! - Overlay plane: 20
//! - Dumb buffer handles and framebuffers: 1+, each with its own counter
//! - Property blobs: 100+

use crate::allocator::{BackingMemory, BufferAllocator};
use crate::{Error, Result};
use tracing::{debug, error, info};

pub const CONNECTOR_ID: u32 = 1;
pub const ENCODER_ID: u32 = 5;
pub const CRTC_ID: u32 = 10;
pub const PLANE_ID: u32 = 20;
const BLOB_ID_BASE: u32 = 100;

pub const MAX_BUFFERS: usize = 64;
pub const MAX_FRAMEBUFFERS: usize = 64;
pub const MAX_BLOBS: usize = 32;
pub const MAX_BLOB_SIZE: usize = 1 << 20;
pub const MAX_WINDOWS: usize = 16;
pub const MAX_GEM_NAMES: usize = 64;
pub const MAX_DIMENSION: u32 = 8192;

/// Fixed-capacity slot arena
pub struct SlotTable<T> {
    slots: Box<[Option<T>]>,
}

impl<T> SlotTable<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }

    /// Store `value` in the first free slot, returning the slot index.
    pub fn insert(&mut self, value: T) -> Option<usize> {
        let index = self.slots.iter().position(|s| s.is_none())?;
        self.slots[index] = Some(value);
        Some(index)
    }

    pub fn find(&self, mut pred: impl FnMut(&T) -> bool) -> Option<&T> {
        self.iter().find(|v| pred(*v))
    }

    pub fn find_mut(&mut self, mut pred: impl FnMut(&T) -> bool) -> Option<&mut T> {
        self.iter_mut().find(|v| pred(&**v))
    }

    pub fn remove_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Option<T> {
        let slot = self.slots.iter_mut().find(|s| s.as_ref().is_some_and(&mut pred))?;
        slot.take()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|v| !keep(v)) {
                *slot = None;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().filter_map(Option::as_mut)
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }
}

/// A CPU-writable pixel buffer
pub struct DumbBuffer {
    pub handle: u32,
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
    pub pitch: u32,
    pub size: u64,
    /// Allocated on first map
    pub memory: Option<BackingMemory>,
}

impl DumbBuffer {
    pub fn is_mapped(&self) -> bool {
        self.memory.is_some()
    }
}

/// A dumb buffer bound for display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framebuffer {
    pub id: u32,
    pub handle: u32,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub bpp: u32,
    pub depth: u32,
    pub format: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyBlob {
    pub id: u32,
    pub data: Vec<u8>,
}

/// A compositing unit: one presented framebuffer plus its placement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub fb_id: u32,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub z: u32,
    pub active: bool,
    /// Created implicitly by a page flip; follows whatever the CRTC presents
    pub primary: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GemName {
    name: u32,
    handle: u32,
}

/// Last SETCRTC configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrtcState {
    pub fb_id: u32,
    pub x: u32,
    pub y: u32,
    pub mode_valid: bool,
}

enum BlobSlot {
    Empty,
    Deleted,
    Live(PropertyBlob),
}

/// Open-addressed blob table: hashed start slot, fixed odd probe step.
pub struct BlobTable {
    slots: Box<[BlobSlot]>,
    live: usize,
}

// Odd, so it is coprime with the power-of-two table size and visits every slot
const BLOB_PROBE_STEP: usize = 7;

impl BlobTable {
    fn new() -> Self {
        Self {
            slots: (0..MAX_BLOBS).map(|_| BlobSlot::Empty).collect(),
            live: 0,
        }
    }

    fn home(id: u32) -> usize {
        (id.wrapping_mul(0x9e37_79b9) >> 16) as usize % MAX_BLOBS
    }

    fn probe(id: u32) -> impl Iterator<Item = usize> {
        let home = Self::home(id);
        (0..MAX_BLOBS).map(move |i| (home + i * BLOB_PROBE_STEP) % MAX_BLOBS)
    }

    fn position(&self, id: u32) -> Option<usize> {
        for index in Self::probe(id) {
            match &self.slots[index] {
                BlobSlot::Empty => return None,
                BlobSlot::Live(blob) if blob.id == id => return Some(index),
                _ => {}
            }
        }
        None
    }

    fn insert(&mut self, blob: PropertyBlob) -> Result<()> {
        if self.live == MAX_BLOBS {
            return Err(Error::oom(format!("blob table full ({} entries)", MAX_BLOBS)));
        }
        let index = Self::probe(blob.id)
            .find(|&i| !matches!(self.slots[i], BlobSlot::Live(_)))
            .ok_or_else(|| Error::oom("no free blob slot"))?;
        self.slots[index] = BlobSlot::Live(blob);
        self.live += 1;
        Ok(())
    }

    pub fn get(&self, id: u32) -> Option<&PropertyBlob> {
        match &self.slots[self.position(id)?] {
            BlobSlot::Live(blob) => Some(blob),
            _ => None,
        }
    }

    fn remove(&mut self, id: u32) -> Option<PropertyBlob> {
        let index = self.position(id)?;
        match std::mem::replace(&mut self.slots[index], BlobSlot::Deleted) {
            BlobSlot::Live(blob) => {
                self.live -= 1;
                Some(blob)
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

/// All emulated objects of one device session
pub struct Registry {
    buffers: SlotTable<DumbBuffer>,
    framebuffers: SlotTable<Framebuffer>,
    blobs: BlobTable,
    windows: SlotTable<Window>,
    gem_names: SlotTable<GemName>,
    next_handle: u32,
    next_fb_id: u32,
    next_blob_id: u32,
    pub crtc: CrtcState,
    pub plane_fb: u32,
    pub dpms: u64,
    pub current_fb: u32,
    /// Memory of destroyed buffers, freed by the owner once its address is
    /// no longer published
    released: Vec<BackingMemory>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Row pitch in bytes: `ceil(width * bpp / 32) * 4`
pub fn dumb_pitch(width: u32, bpp: u32) -> u64 {
    (u64::from(width) * u64::from(bpp)).div_ceil(32) * 4
}

/// A framebuffer may only describe pixels inside its buffer: every row must
/// fit its pitch and the last row must end within the allocation.
fn check_layout(buffer: &DumbBuffer, width: u32, height: u32, pitch: u32, bpp: u32) -> Result<()> {
    if width == 0 || height == 0 || bpp == 0 || bpp > 32 {
        return Err(Error::invalid(format!("bad framebuffer {}x{} bpp={}", width, height, bpp)));
    }
    let row = (u64::from(width) * u64::from(bpp)).div_ceil(8);
    let pitch = u64::from(pitch);
    if pitch < row {
        return Err(Error::invalid(format!("pitch {} below row size {} for width {}", pitch, row, width)));
    }
    let extent = pitch * u64::from(height - 1) + row;
    if extent > buffer.size {
        return Err(Error::invalid(format!(
            "framebuffer needs {} bytes, buffer {} has {}",
            extent, buffer.handle, buffer.size
        )));
    }
    Ok(())
}

impl Registry {
    pub fn new() -> Self {
        Self {
            buffers: SlotTable::with_capacity(MAX_BUFFERS),
            framebuffers: SlotTable::with_capacity(MAX_FRAMEBUFFERS),
            blobs: BlobTable::new(),
            windows: SlotTable::with_capacity(MAX_WINDOWS),
            gem_names: SlotTable::with_capacity(MAX_GEM_NAMES),
            next_handle: 1,
            next_fb_id: 1,
            next_blob_id: BLOB_ID_BASE,
            // The synthesized mode is live from the start, as if firmware had set it
            crtc: CrtcState {
                mode_valid: true,
                ..CrtcState::default()
            },
            plane_fb: 0,
            dpms: crate::abi::DRM_MODE_DPMS_ON,
            current_fb: 0,
            released: Vec::new(),
        }
    }

    /// Drop every object, freeing all backing memory.
    pub fn reset(&mut self) {
        info!(
            "Resetting registry ({} buffers, {} blobs, {} windows)",
            self.buffers.len(),
            self.blobs.len(),
            self.windows.len()
        );
        let mut released = std::mem::take(&mut self.released);
        released.extend(self.buffers.iter_mut().filter_map(|b| b.memory.take()));
        *self = Self::new();
        self.released = released;
    }

    /// Hand over the memory of buffers destroyed since the last call.
    pub fn take_released(&mut self) -> Vec<BackingMemory> {
        std::mem::take(&mut self.released)
    }

    // =========================================================================
    // Dumb buffers
    // =========================================================================

    pub fn create_dumb(&mut self, width: u32, height: u32, bpp: u32) -> Result<&DumbBuffer> {
        if width == 0 || height == 0 || bpp == 0 || bpp > 32 {
            return Err(Error::invalid(format!("bad dumb buffer {}x{} bpp={}", width, height, bpp)));
        }
        if width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(Error::invalid(format!("dumb buffer {}x{} exceeds {}", width, height, MAX_DIMENSION)));
        }

        let pitch = dumb_pitch(width, bpp);
        let size = pitch * u64::from(height);

        let handle = self.next_handle;
        let buffer = DumbBuffer {
            handle,
            width,
            height,
            bpp,
            // Bounded by MAX_DIMENSION, so this always fits
            pitch: pitch as u32,
            size,
            memory: None,
        };
        let slot = self.buffers.insert(buffer).ok_or_else(|| {
            error!("Dumb buffer table full ({} entries)", MAX_BUFFERS);
            Error::oom("dumb buffer table full")
        })?;
        self.next_handle += 1;

        debug!("Created dumb buffer {} ({}x{} bpp={} pitch={} size={})", handle, width, height, bpp, pitch, size);
        self.buffers.slots[slot]
            .as_ref()
            .ok_or_else(|| Error::invalid("dumb buffer slot vanished"))
    }

    pub fn buffer(&self, handle: u32) -> Option<&DumbBuffer> {
        self.buffers.find(|b| b.handle == handle)
    }

    pub fn buffers(&self) -> impl Iterator<Item = &DumbBuffer> {
        self.buffers.iter()
    }

    /// Back the buffer with memory on first use and return its address.
    pub fn map_dumb(&mut self, handle: u32, allocator: &BufferAllocator) -> Result<u64> {
        let buffer = self
            .buffers
            .find_mut(|b| b.handle == handle)
            .ok_or_else(|| Error::invalid(format!("unknown dumb buffer {}", handle)))?;

        if let Some(memory) = &buffer.memory {
            return Ok(memory.address());
        }

        let memory = allocator.allocate(buffer.size as usize).map_err(|e| {
            error!("Backing allocation for buffer {} failed: {}", handle, e);
            e
        })?;
        let address = memory.address();
        buffer.memory = Some(memory);
        debug!("Mapped dumb buffer {} at 0x{:x}", handle, address);
        Ok(address)
    }

    pub fn destroy_dumb(&mut self, handle: u32) -> Result<()> {
        let buffer = self
            .buffers
            .remove_where(|b| b.handle == handle)
            .ok_or_else(|| Error::invalid(format!("unknown dumb buffer {}", handle)))?;
        self.gem_names.retain(|g| g.handle != handle);
        debug!("Destroyed dumb buffer {} (mapped={})", handle, buffer.is_mapped());
        if let Some(memory) = buffer.memory {
            self.released.push(memory);
        }
        Ok(())
    }

    /// Live buffer whose backing memory covers `addr..addr+len`
    pub fn buffer_at(&self, addr: u64, len: usize) -> Option<&DumbBuffer> {
        self.buffers
            .find(|b| b.memory.as_ref().is_some_and(|m| m.contains(addr, len)))
    }

    /// `(start, end)` of every mapped buffer's memory
    pub fn mapped_ranges(&self) -> Vec<(u64, u64)> {
        self.buffers
            .iter()
            .filter_map(|b| b.memory.as_ref())
            .map(|m| (m.address(), m.address() + m.len() as u64))
            .collect()
    }

    // =========================================================================
    // Framebuffers
    // =========================================================================

    #[allow(clippy::too_many_arguments)]
    pub fn add_framebuffer(
        &mut self,
        handle: u32,
        width: u32,
        height: u32,
        pitch: u32,
        bpp: u32,
        depth: u32,
        format: u32,
    ) -> Result<u32> {
        let buffer = self
            .buffer(handle)
            .ok_or_else(|| Error::invalid(format!("framebuffer references unknown buffer {}", handle)))?;
        check_layout(buffer, width, height, pitch, bpp)?;

        let id = self.next_fb_id;
        let fb = Framebuffer {
            id,
            handle,
            width,
            height,
            pitch,
            bpp,
            depth,
            format,
        };
        self.framebuffers.insert(fb).ok_or_else(|| {
            error!("Framebuffer table full ({} entries)", MAX_FRAMEBUFFERS);
            Error::oom("framebuffer table full")
        })?;
        self.next_fb_id += 1;
        self.current_fb = id;

        debug!("Created framebuffer {}: {}x{} format=0x{:08x} handle={}", id, width, height, format, handle);
        Ok(id)
    }

    /// Forget the framebuffer and any window presenting it. The dumb buffer and
    /// its memory stay alive until destroyed explicitly.
    pub fn remove_framebuffer(&mut self, fb_id: u32) -> Result<()> {
        self.framebuffers
            .remove_where(|f| f.id == fb_id)
            .ok_or_else(|| Error::invalid(format!("unknown framebuffer {}", fb_id)))?;
        self.windows.retain(|w| w.fb_id != fb_id);
        if self.current_fb == fb_id {
            self.current_fb = 0;
        }
        if self.crtc.fb_id == fb_id {
            self.crtc.fb_id = 0;
        }
        if self.plane_fb == fb_id {
            self.plane_fb = 0;
        }
        debug!("Removed framebuffer {}", fb_id);
        Ok(())
    }

    pub fn framebuffer(&self, fb_id: u32) -> Option<&Framebuffer> {
        self.framebuffers.find(|f| f.id == fb_id)
    }

    pub fn framebuffer_ids(&self) -> Vec<u32> {
        self.framebuffers.iter().map(|f| f.id).collect()
    }

    // =========================================================================
    // Property blobs
    // =========================================================================

    pub fn create_blob(&mut self, data: Vec<u8>) -> Result<u32> {
        if data.is_empty() || data.len() > MAX_BLOB_SIZE {
            return Err(Error::invalid(format!("blob length {} out of range", data.len())));
        }
        let id = self.next_blob_id;
        let len = data.len();
        self.blobs.insert(PropertyBlob { id, data }).map_err(|e| {
            error!("Cannot create blob: {}", e);
            e
        })?;
        self.next_blob_id += 1;
        debug!("Created blob {} ({} bytes)", id, len);
        Ok(id)
    }

    pub fn blob(&self, id: u32) -> Option<&PropertyBlob> {
        self.blobs.get(id)
    }

    pub fn destroy_blob(&mut self, id: u32) -> Result<()> {
        self.blobs
            .remove(id)
            .map(|_| debug!("Destroyed blob {}", id))
            .ok_or_else(|| Error::invalid(format!("unknown blob {}", id)))
    }

    // =========================================================================
    // GEM names
    // =========================================================================

    /// Export a handle; the name is the handle itself.
    pub fn gem_flink(&mut self, handle: u32) -> Result<u32> {
        if self.buffer(handle).is_none() {
            return Err(Error::invalid(format!("flink of unknown handle {}", handle)));
        }
        if self.gem_names.find(|g| g.handle == handle).is_none() {
            self.gem_names
                .insert(GemName { name: handle, handle })
                .ok_or_else(|| Error::oom("GEM name table full"))?;
        }
        Ok(handle)
    }

    /// Resolve a name to `(handle, size)`.
    pub fn gem_open(&self, name: u32) -> Result<(u32, u64)> {
        let gem = self
            .gem_names
            .find(|g| g.name == name)
            .ok_or_else(|| Error::invalid(format!("unknown GEM name {}", name)))?;
        let buffer = self
            .buffer(gem.handle)
            .ok_or_else(|| Error::invalid(format!("GEM name {} outlived its buffer", name)))?;
        Ok((buffer.handle, buffer.size))
    }

    /// Handles alias the dumb buffer itself, so closing one only validates it.
    pub fn gem_close(&self, handle: u32) -> Result<()> {
        self.buffer(handle)
            .map(|_| ())
            .ok_or_else(|| Error::invalid(format!("close of unknown handle {}", handle)))
    }

    // =========================================================================
    // Windows
    // =========================================================================

    pub fn window(&self, fb_id: u32) -> Option<&Window> {
        self.windows.find(|w| w.fb_id == fb_id)
    }

    fn window_entry(&mut self, fb_id: u32) -> Result<&mut Window> {
        if self.framebuffer(fb_id).is_none() {
            return Err(Error::invalid(format!("no framebuffer {} for window", fb_id)));
        }
        if self.window(fb_id).is_none() {
            let z = self.windows.iter().map(|w| w.z + 1).max().unwrap_or(0);
            let window = Window {
                fb_id,
                x: 0,
                y: 0,
                width: 0,
                height: 0,
                z,
                active: true,
                primary: false,
            };
            self.windows.insert(window).ok_or_else(|| {
                error!("Window table full ({} entries)", MAX_WINDOWS);
                Error::oom("window table full")
            })?;
        }
        self.windows
            .find_mut(|w| w.fb_id == fb_id)
            .ok_or_else(|| Error::invalid("window slot vanished"))
    }

    /// Place the window presenting `fb_id`, creating it on top if needed.
    pub fn set_window_geometry(&mut self, fb_id: u32, x: i32, y: i32, width: u32, height: u32) -> Result<()> {
        let window = self.window_entry(fb_id)?;
        window.x = x;
        window.y = y;
        window.width = width;
        window.height = height;
        debug!("Window fb={} placed at {},{} {}x{}", fb_id, x, y, width, height);
        Ok(())
    }

    pub fn set_window_z(&mut self, fb_id: u32, z: u32) -> Result<()> {
        self.window_entry(fb_id)?.z = z;
        debug!("Window fb={} z-order {}", fb_id, z);
        Ok(())
    }

    pub fn set_window_visible(&mut self, fb_id: u32, visible: bool) -> Result<()> {
        self.window_entry(fb_id)?.active = visible;
        Ok(())
    }

    /// Remove the window presenting `fb_id` and release its dumb buffer.
    pub fn destroy_window(&mut self, fb_id: u32) -> Result<()> {
        let window = self
            .windows
            .remove_where(|w| w.fb_id == fb_id)
            .ok_or_else(|| Error::invalid(format!("no window for framebuffer {}", fb_id)))?;
        if let Some(handle) = self.framebuffer(window.fb_id).map(|f| f.handle) {
            if self.buffer(handle).is_some() {
                self.destroy_dumb(handle)?;
            }
        }
        debug!("Destroyed window fb={}", fb_id);
        Ok(())
    }

    /// Make sure a flipped framebuffer has a window. A framebuffer without one
    /// takes over the implicit primary window, which is created full-surface at
    /// z-order 0 the first time.
    pub fn present(&mut self, fb_id: u32, surface: (u32, u32)) -> Result<()> {
        if self.framebuffer(fb_id).is_none() {
            return Err(Error::invalid(format!("flip to unknown framebuffer {}", fb_id)));
        }
        if self.window(fb_id).is_some() {
            return Ok(());
        }

        if let Some(primary) = self.windows.find_mut(|w| w.primary) {
            primary.fb_id = fb_id;
            return Ok(());
        }

        let window = Window {
            fb_id,
            x: 0,
            y: 0,
            width: surface.0,
            height: surface.1,
            z: 0,
            active: true,
            primary: true,
        };
        self.windows.insert(window).ok_or_else(|| {
            error!("Window table full ({} entries)", MAX_WINDOWS);
            Error::oom("window table full")
        })?;
        debug!("Created primary window for framebuffer {}", fb_id);
        Ok(())
    }

    /// Active windows, lowest z-order first (slot order breaks ties).
    pub fn windows_by_z(&self) -> Vec<Window> {
        let mut windows: Vec<Window> = self.windows.iter().filter(|w| w.active).copied().collect();
        windows.sort_by_key(|w| w.z);
        windows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> BufferAllocator {
        BufferAllocator::new(1 << 30)
    }

    #[test]
    fn test_pitch_and_size() {
        let mut reg = Registry::new();
        let buf = reg.create_dumb(64, 64, 32).unwrap();
        assert_eq!(buf.pitch, 256);
        assert_eq!(buf.size, 16384);

        let buf = reg.create_dumb(33, 7, 24).unwrap();
        assert_eq!(u64::from(buf.pitch), dumb_pitch(33, 24));
        assert_eq!(buf.pitch, 100); // ceil(792 / 32) * 4
        assert_eq!(buf.size, 700);
    }

    #[test]
    fn test_handles_unique_and_monotonic() {
        let mut reg = Registry::new();
        let a = reg.create_dumb(8, 8, 32).unwrap().handle;
        let b = reg.create_dumb(8, 8, 32).unwrap().handle;
        reg.destroy_dumb(a).unwrap();
        let c = reg.create_dumb(8, 8, 32).unwrap().handle;
        assert!(a < b && b < c);
    }

    #[test]
    fn test_buffer_capacity() {
        let mut reg = Registry::new();
        for _ in 0..MAX_BUFFERS {
            reg.create_dumb(4, 4, 32).unwrap();
        }
        assert!(matches!(reg.create_dumb(4, 4, 32), Err(Error::OutOfMemory(_))));
    }

    #[test]
    fn test_destroy_then_use_fails() {
        let mut reg = Registry::new();
        let handle = reg.create_dumb(16, 16, 32).unwrap().handle;
        reg.map_dumb(handle, &allocator()).unwrap();
        reg.destroy_dumb(handle).unwrap();
        assert!(matches!(reg.map_dumb(handle, &allocator()), Err(Error::InvalidArgument(_))));
        assert!(matches!(reg.destroy_dumb(handle), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_map_is_lazy_and_stable() {
        let mut reg = Registry::new();
        let handle = reg.create_dumb(16, 16, 32).unwrap().handle;
        assert!(!reg.buffer(handle).unwrap().is_mapped());
        let first = reg.map_dumb(handle, &allocator()).unwrap();
        let second = reg.map_dumb(handle, &allocator()).unwrap();
        assert_eq!(first, second);
        assert_eq!(reg.buffer_at(first + 4, 4).map(|b| b.handle), Some(handle));
        assert!(reg.buffer_at(first, 16 * 16 * 4 + 1).is_none());
    }

    #[test]
    fn test_framebuffer_ids_increase() {
        let mut reg = Registry::new();
        let handle = reg.create_dumb(8, 8, 32).unwrap().handle;
        let a = reg.add_framebuffer(handle, 8, 8, 32, 32, 24, 0).unwrap();
        reg.remove_framebuffer(a).unwrap();
        let b = reg.add_framebuffer(handle, 8, 8, 32, 32, 24, 0).unwrap();
        assert_eq!(a, 1);
        assert!(b > a);
        assert_eq!(reg.current_fb, b);
        assert!(reg.add_framebuffer(999, 8, 8, 32, 32, 24, 0).is_err());
    }

    #[test]
    fn test_remove_framebuffer_keeps_buffer() {
        let mut reg = Registry::new();
        let handle = reg.create_dumb(8, 8, 32).unwrap().handle;
        reg.map_dumb(handle, &allocator()).unwrap();
        let fb = reg.add_framebuffer(handle, 8, 8, 32, 32, 24, 0).unwrap();
        reg.set_window_geometry(fb, 0, 0, 8, 8).unwrap();
        reg.remove_framebuffer(fb).unwrap();
        assert!(reg.buffer(handle).unwrap().is_mapped());
        assert!(reg.window(fb).is_none());
    }

    #[test]
    fn test_blob_round_trip_and_probe_reuse() {
        let mut reg = Registry::new();
        let ids: Vec<u32> = (0..MAX_BLOBS).map(|i| reg.create_blob(vec![i as u8; i + 1]).unwrap()).collect();
        assert!(matches!(reg.create_blob(vec![1]), Err(Error::OutOfMemory(_))));

        for (i, id) in ids.iter().enumerate() {
            assert_eq!(reg.blob(*id).unwrap().data, vec![i as u8; i + 1]);
        }

        reg.destroy_blob(ids[3]).unwrap();
        assert!(reg.blob(ids[3]).is_none());
        // Lookups past the tombstone still succeed
        assert!(ids.iter().filter(|&&id| id != ids[3]).all(|&id| reg.blob(id).is_some()));

        let fresh = reg.create_blob(b"mode".to_vec()).unwrap();
        assert_eq!(reg.blob(fresh).unwrap().data, b"mode");
        assert!(reg.destroy_blob(ids[3]).is_err());
    }

    #[test]
    fn test_gem_identity() {
        let mut reg = Registry::new();
        let handle = reg.create_dumb(8, 8, 32).unwrap().handle;
        let name = reg.gem_flink(handle).unwrap();
        assert_eq!(name, handle);
        assert_eq!(reg.gem_open(name).unwrap(), (handle, 256));
        reg.gem_close(handle).unwrap();
        reg.destroy_dumb(handle).unwrap();
        assert!(reg.gem_open(name).is_err());
        assert!(reg.gem_close(handle).is_err());
    }

    #[test]
    fn test_primary_window_follows_flips() {
        let mut reg = Registry::new();
        let handle = reg.create_dumb(8, 8, 32).unwrap().handle;
        let a = reg.add_framebuffer(handle, 8, 8, 32, 32, 24, 0).unwrap();
        let b = reg.add_framebuffer(handle, 8, 8, 32, 32, 24, 0).unwrap();

        reg.present(a, (100, 50)).unwrap();
        reg.present(b, (100, 50)).unwrap();

        let windows = reg.windows_by_z();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].fb_id, b);
        assert_eq!((windows[0].width, windows[0].height), (100, 50));
        assert!(reg.present(42, (100, 50)).is_err());
    }

    #[test]
    fn test_placed_primary_window_keeps_following_flips() {
        let mut reg = Registry::new();
        let handle = reg.create_dumb(8, 8, 32).unwrap().handle;
        let a = reg.add_framebuffer(handle, 8, 8, 32, 32, 24, 0).unwrap();
        let b = reg.add_framebuffer(handle, 8, 8, 32, 32, 24, 0).unwrap();

        reg.present(a, (100, 50)).unwrap();
        reg.set_window_geometry(a, 10, 10, 40, 20).unwrap();
        reg.present(b, (100, 50)).unwrap();

        let windows = reg.windows_by_z();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].fb_id, b);
        assert!(windows[0].primary);
        assert_eq!((windows[0].x, windows[0].y, windows[0].width, windows[0].height), (10, 10, 40, 20));
    }

    #[test]
    fn test_framebuffer_layout_must_fit_buffer() {
        let mut reg = Registry::new();
        // 8x8 at 32 bpp: pitch 32, 256 bytes
        let handle = reg.create_dumb(8, 8, 32).unwrap().handle;
        assert!(reg.add_framebuffer(handle, 4, 4, 32, 32, 24, 0).is_ok());
        assert!(reg.add_framebuffer(handle, 4, 8, 16, 32, 24, 0).is_ok());
        // Pitch shorter than a row
        assert!(matches!(reg.add_framebuffer(handle, 8, 8, 16, 32, 24, 0), Err(Error::InvalidArgument(_))));
        // Rows run past the allocation
        assert!(matches!(reg.add_framebuffer(handle, 8, 8, 64, 32, 24, 0), Err(Error::InvalidArgument(_))));
        assert!(matches!(reg.add_framebuffer(handle, 8, 9, 32, 32, 24, 0), Err(Error::InvalidArgument(_))));
        assert!(matches!(reg.add_framebuffer(handle, 0, 8, 32, 32, 24, 0), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_removed_framebuffer_leaves_crtc_and_plane() {
        let mut reg = Registry::new();
        let handle = reg.create_dumb(8, 8, 32).unwrap().handle;
        let fb = reg.add_framebuffer(handle, 8, 8, 32, 32, 24, 0).unwrap();
        reg.crtc.fb_id = fb;
        reg.plane_fb = fb;
        reg.remove_framebuffer(fb).unwrap();
        assert_eq!((reg.crtc.fb_id, reg.plane_fb, reg.current_fb), (0, 0, 0));
    }

    #[test]
    fn test_destroyed_memory_is_handed_over() {
        let mut reg = Registry::new();
        let a = reg.create_dumb(8, 8, 32).unwrap().handle;
        let b = reg.create_dumb(8, 8, 32).unwrap().handle;
        let unmapped = reg.create_dumb(8, 8, 32).unwrap().handle;
        let addr = reg.map_dumb(a, &allocator()).unwrap();
        reg.map_dumb(b, &allocator()).unwrap();
        assert_eq!(reg.mapped_ranges().len(), 2);
        assert!(reg.mapped_ranges().contains(&(addr, addr + 256)));

        reg.destroy_dumb(a).unwrap();
        reg.destroy_dumb(unmapped).unwrap();
        assert_eq!(reg.mapped_ranges().len(), 1);
        let released = reg.take_released();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].address(), addr);
        assert!(reg.take_released().is_empty());

        reg.reset();
        assert!(reg.mapped_ranges().is_empty());
        assert_eq!(reg.take_released().len(), 1);
    }

    #[test]
    fn test_windows_sorted_by_z() {
        let mut reg = Registry::new();
        let handle = reg.create_dumb(8, 8, 32).unwrap().handle;
        let a = reg.add_framebuffer(handle, 8, 8, 32, 32, 24, 0).unwrap();
        let b = reg.add_framebuffer(handle, 8, 8, 32, 32, 24, 0).unwrap();
        reg.set_window_z(a, 5).unwrap();
        reg.set_window_z(b, 2).unwrap();
        let order: Vec<u32> = reg.windows_by_z().iter().map(|w| w.fb_id).collect();
        assert_eq!(order, vec![b, a]);

        reg.set_window_visible(b, false).unwrap();
        assert_eq!(reg.windows_by_z().len(), 1);
    }

    #[test]
    fn test_destroy_window_releases_buffer() {
        let mut reg = Registry::new();
        let handle = reg.create_dumb(8, 8, 32).unwrap().handle;
        let fb = reg.add_framebuffer(handle, 8, 8, 32, 32, 24, 0).unwrap();
        reg.set_window_geometry(fb, 0, 0, 8, 8).unwrap();
        reg.destroy_window(fb).unwrap();
        assert!(reg.buffer(handle).is_none());
        assert!(reg.destroy_window(fb).is_err());
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut reg = Registry::new();
        let handle = reg.create_dumb(8, 8, 32).unwrap().handle;
        reg.create_blob(vec![1, 2, 3]).unwrap();
        reg.reset();
        assert!(reg.buffer(handle).is_none());
        assert_eq!(reg.buffers().count(), 0);
        assert_eq!(reg.create_dumb(8, 8, 32).unwrap().handle, 1);
    }
}
