//! Emulated DRM/KMS device
//!
//! [`Device`] owns every piece of session state behind one mutex: the object
//! registry, the buffer allocator, the window surface and the pending
//! flip-complete events. Each request is decoded into a [`Request`] and
//! handled to completion while that lock is held, including the whole
//! compositing pass of a page flip.
//!
//! The address ranges of mapped buffers are also published to a separate
//! snapshot after every change, so `munmap` can recognize buffer addresses
//! without the session lock. Memory of a destroyed buffer is freed only after
//! its range has left the snapshot.
//!
//! # Display pipeline
//! One connector (1) -> one encoder (5) -> one CRTC (10), plus a single overlay
//! plane (20). The connector reports one mode synthesized from the current
//! surface size and the configured refresh rate.

use crate::abi::*;
use crate::allocator::BufferAllocator;
use crate::compositor::{self, FlipStats};
use crate::config::ShimConfig;
use crate::registry::{Registry, CONNECTOR_ID, CRTC_ID, ENCODER_ID, MAX_DIMENSION, PLANE_ID};
use crate::request::Request;
use crate::surface::{MemorySurface, WindowSurface};
use crate::{Error, Result};
use std::collections::VecDeque;
use std::ffi::{c_ulong, c_void};
use std::mem::size_of;
use std::os::unix::io::RawFd;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, error, info, trace, warn};

pub const DRIVER_NAME: &str = "surface-shim";
pub const DRIVER_DATE: &str = "20250101";
pub const DRIVER_DESC: &str = "DRM emulation over a platform window surface";

/// Property ids
pub const PROP_TYPE: u32 = 1;
pub const PROP_DPMS: u32 = 2;
pub const PROP_CRTC_ID: u32 = 3;

pub const PLANE_FORMATS: [u32; 2] = [fourcc::XRGB8888, fourcc::ARGB8888];

const MAX_PENDING_EVENTS: usize = 64;
const MAX_ATOMIC_PROPS: usize = 4096;

/// Physical size estimate for the virtual panel
const ASSUMED_DPI: f32 = 400.0;

struct PropertyInfo {
    name: &'static str,
    flags: u32,
    values: Vec<u64>,
    enums: &'static [(u64, &'static str)],
}

fn property_info(prop_id: u32) -> PropertyInfo {
    match prop_id {
        PROP_TYPE => PropertyInfo {
            name: "type",
            flags: DRM_MODE_PROP_ENUM | DRM_MODE_PROP_IMMUTABLE,
            values: vec![DRM_PLANE_TYPE_OVERLAY, DRM_PLANE_TYPE_PRIMARY, DRM_PLANE_TYPE_CURSOR],
            enums: &[
                (DRM_PLANE_TYPE_OVERLAY, "Overlay"),
                (DRM_PLANE_TYPE_PRIMARY, "Primary"),
                (DRM_PLANE_TYPE_CURSOR, "Cursor"),
            ],
        },
        PROP_DPMS => PropertyInfo {
            name: "DPMS",
            flags: DRM_MODE_PROP_ENUM,
            values: vec![DRM_MODE_DPMS_ON, DRM_MODE_DPMS_STANDBY, DRM_MODE_DPMS_SUSPEND, DRM_MODE_DPMS_OFF],
            enums: &[
                (DRM_MODE_DPMS_ON, "On"),
                (DRM_MODE_DPMS_STANDBY, "Standby"),
                (DRM_MODE_DPMS_SUSPEND, "Suspend"),
                (DRM_MODE_DPMS_OFF, "Off"),
            ],
        },
        PROP_CRTC_ID => PropertyInfo {
            name: "CRTC_ID",
            flags: DRM_MODE_PROP_OBJECT | DRM_MODE_PROP_ATOMIC,
            values: vec![u64::from(DRM_MODE_OBJECT_CRTC)],
            enums: &[],
        },
        other => {
            // Callers cope with an odd property far better than with a failure
            debug!("Property {} unknown, answering with a generic range", other);
            PropertyInfo {
                name: "unknown",
                flags: DRM_MODE_PROP_RANGE,
                values: vec![0, 1],
                enums: &[],
            }
        }
    }
}

/// Mode timings derived from the panel size; blanking is fixed padding.
pub fn synthesize_mode(width: u32, height: u32, refresh: u32) -> DrmModeModeinfo {
    let hdisplay = width.clamp(1, MAX_DIMENSION) as u16;
    let vdisplay = height.clamp(1, MAX_DIMENSION) as u16;
    let refresh = refresh.max(1);

    let htotal = hdisplay + 200;
    let vtotal = vdisplay + 50;
    let clock = u64::from(htotal) * u64::from(vtotal) * u64::from(refresh) / 1000;
    let clock = u32::try_from(clock).unwrap_or(u32::MAX);

    DrmModeModeinfo {
        clock,
        hdisplay,
        hsync_start: hdisplay + 50,
        hsync_end: hdisplay + 100,
        htotal,
        hskew: 0,
        vdisplay,
        vsync_start: vdisplay + 10,
        vsync_end: vdisplay + 20,
        vtotal,
        vscan: 0,
        vrefresh: refresh,
        flags: 0,
        type_: DRM_MODE_TYPE_PREFERRED | DRM_MODE_TYPE_DRIVER,
        name: fixed_name(&format!("{}x{}@{}", hdisplay, vdisplay, refresh)),
    }
}

fn monotonic_now() -> (u32, u32) {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    (ts.tv_sec as u32, (ts.tv_nsec / 1000) as u32)
}

fn format_bpp_depth(format: u32) -> Option<(u32, u32)> {
    match format {
        fourcc::XRGB8888 => Some((32, 24)),
        fourcc::ARGB8888 => Some((32, 32)),
        fourcc::RGB565 => Some((16, 16)),
        _ => None,
    }
}

fn legacy_format(bpp: u32, depth: u32) -> Result<u32> {
    match (bpp, depth) {
        (32, 24) => Ok(fourcc::XRGB8888),
        (32, 32) => Ok(fourcc::ARGB8888),
        (16, 16) => Ok(fourcc::RGB565),
        _ => Err(Error::invalid(format!("no format for bpp={} depth={}", bpp, depth))),
    }
}

struct DeviceState {
    config: ShimConfig,
    registry: Registry,
    allocator: BufferAllocator,
    surface: Box<dyn WindowSurface>,
    stats: FlipStats,
    events: VecDeque<DrmEventVblank>,
    flip_sequence: u32,
    master: bool,
    atomic: bool,
}

/// The emulated device. All methods lock the session state for their duration,
/// except [`Device::is_buffer_address`].
pub struct Device {
    state: Mutex<DeviceState>,
    mappings: RwLock<Vec<(u64, u64)>>,
}

impl Device {
    /// Device drawing into an offscreen surface of the configured size until a
    /// real window is attached with [`Device::set_surface`].
    pub fn new(config: ShimConfig) -> Self {
        let offscreen = MemorySurface::new(config.width, config.height);
        Self::with_surface(config, Box::new(offscreen))
    }

    pub fn with_surface(config: ShimConfig, surface: Box<dyn WindowSurface>) -> Self {
        let (w, h) = surface.size();
        info!(
            "Creating DRM device: fd={} surface={}x{} @{}Hz",
            config.synthetic_fd, w, h, config.refresh_rate
        );
        Self {
            state: Mutex::new(DeviceState {
                allocator: BufferAllocator::new(config.heap_threshold),
                config,
                registry: Registry::new(),
                surface,
                stats: FlipStats::default(),
                events: VecDeque::new(),
                flip_sequence: 0,
                master: false,
                atomic: false,
            }),
            mappings: RwLock::new(Vec::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Republish the mapped ranges, then free memory released since the last
    /// call. Runs with the session lock held.
    fn publish_mappings(&self, state: &mut DeviceState) {
        let ranges = state.registry.mapped_ranges();
        *self.mappings.write().unwrap_or_else(PoisonError::into_inner) = ranges;
        let released = state.registry.take_released();
        if !released.is_empty() {
            debug!("Freeing {} released buffer(s)", released.len());
        }
        drop(released);
    }

    pub fn synthetic_fd(&self) -> RawFd {
        self.state().config.synthetic_fd
    }

    /// Handle a raw request, returning 0 or a negative errno.
    ///
    /// # Safety
    /// `arg` must be null or point to the structure `cmd` encodes, and every
    /// user pointer inside it must honor the counts it is paired with.
    pub unsafe fn ioctl(&self, cmd: c_ulong, arg: *mut c_void) -> i32 {
        let request = match Request::decode(cmd, arg) {
            Ok(request) => request,
            Err(e) => {
                error!("ioctl 0x{:x} rejected: {}", cmd, e);
                return e.status();
            }
        };
        let name = request.name();
        match self.dispatch(request) {
            Ok(()) => 0,
            Err(e) => {
                match e {
                    Error::OutOfMemory(_) | Error::Alloc(_) | Error::SurfaceUnavailable(_) => {
                        error!("ioctl {} failed: {}", name, e)
                    }
                    _ => warn!("ioctl {} failed: {}", name, e),
                }
                e.status()
            }
        }
    }

    /// Run one decoded request against the session state.
    ///
    /// # Safety
    /// User pointers carried inside the request must be valid for the counts
    /// they are paired with.
    pub unsafe fn dispatch(&self, request: Request<'_>) -> Result<()> {
        let mut state = self.state();
        trace!("ioctl: {}", request.name());
        let result = match request {
            Request::Version(v) => state.version(v),
            Request::GetCap(c) => state.get_cap(c),
            Request::SetClientCap(c) => state.set_client_cap(c),
            Request::SetMaster => {
                debug!("ioctl: SET_MASTER");
                state.master = true;
                Ok(())
            }
            Request::DropMaster => {
                debug!("ioctl: DROP_MASTER");
                state.master = false;
                Ok(())
            }
            Request::GemClose(g) => state.registry.gem_close(g.handle),
            Request::GemFlink(g) => {
                g.name = state.registry.gem_flink(g.handle)?;
                Ok(())
            }
            Request::GemOpen(g) => {
                let (handle, size) = state.registry.gem_open(g.name)?;
                g.handle = handle;
                g.size = size;
                Ok(())
            }
            Request::GetResources(r) => state.get_resources(r),
            Request::GetCrtc(c) => state.get_crtc(c),
            Request::SetCrtc(c) => state.set_crtc(c),
            Request::Cursor(c) => {
                debug!(
                    "ioctl: MODE_CURSOR flags=0x{:x} handle={} {}x{} at {},{}",
                    c.flags, c.handle, c.width, c.height, c.x, c.y
                );
                Ok(())
            }
            Request::GetEncoder(e) => state.get_encoder(e),
            Request::GetConnector(c) => state.get_connector(c),
            Request::GetProperty(p) => state.get_property(p),
            Request::GetPropBlob(b) => state.get_prop_blob(b),
            Request::GetFb(f) => state.get_fb(f),
            Request::AddFb(f) => state.add_fb(f),
            Request::AddFb2(f) => state.add_fb2(f),
            Request::RmFb(id) => state.registry.remove_framebuffer(*id),
            Request::PageFlip(f) => state.page_flip(f),
            Request::CreateDumb(c) => state.create_dumb(c),
            Request::MapDumb(m) => state.map_dumb(m),
            Request::DestroyDumb(d) => state.registry.destroy_dumb(d.handle),
            Request::GetPlaneResources(r) => {
                let planes = [PLANE_ID];
                copy_to_user(r.plane_id_ptr, r.count_planes, &planes);
                r.count_planes = planes.len() as u32;
                Ok(())
            }
            Request::GetPlane(p) => state.get_plane(p),
            Request::SetPlane(p) => state.set_plane(p),
            Request::ObjGetProperties(p) => state.obj_get_properties(p),
            Request::ObjSetProperty(p) => state.obj_set_property(p),
            Request::Atomic(a) => state.atomic(a),
            Request::CreatePropBlob(b) => state.create_prop_blob(b),
            Request::DestroyPropBlob(b) => state.registry.destroy_blob(b.blob_id),
        };
        self.publish_mappings(&mut state);
        result
    }

    /// Drain queued flip-complete events into `buf`, whole events only.
    /// Fails with `EAGAIN` when nothing is pending.
    pub fn read_events(&self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state();
        if state.events.is_empty() {
            return Err(Error::Io(std::io::Error::from_raw_os_error(libc::EAGAIN)));
        }

        let event_len = size_of::<DrmEventVblank>();
        if buf.len() < event_len {
            return Err(Error::invalid(format!("read buffer of {} bytes holds no event", buf.len())));
        }

        let mut written = 0;
        while written + event_len <= buf.len() {
            let Some(event) = state.events.pop_front() else {
                break;
            };
            let bytes = unsafe { std::slice::from_raw_parts(&event as *const DrmEventVblank as *const u8, event_len) };
            buf[written..written + event_len].copy_from_slice(bytes);
            written += event_len;
        }
        trace!("Delivered {} bytes of events", written);
        Ok(written)
    }

    pub fn is_master(&self) -> bool {
        self.state().master
    }

    pub fn pending_events(&self) -> usize {
        self.state().events.len()
    }

    /// Validate an mmap of a previously returned buffer address.
    pub fn resolve_mapping(&self, addr: u64, len: usize) -> Result<u64> {
        let state = self.state();
        let buffer = state
            .registry
            .buffer_at(addr, 1)
            .ok_or_else(|| Error::invalid(format!("0x{:x} is not a buffer mapping", addr)))?;
        if state.registry.buffer_at(addr, len).is_none() {
            warn!("mmap of {} bytes at 0x{:x} runs past buffer {}", len, addr, buffer.handle);
        }
        debug!("mmap: buffer {} at 0x{:x}", buffer.handle, addr);
        Ok(addr)
    }

    /// Whether `addr` falls inside a mapped buffer. Reads only the published
    /// snapshot, so it is safe to call while the session lock is held.
    pub fn is_buffer_address(&self, addr: u64) -> bool {
        self.mappings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|&(start, end)| addr >= start && addr < end)
    }

    /// Forget the session: every buffer, framebuffer, blob and window.
    pub fn reset(&self) {
        let mut state = self.state();
        state.registry.reset();
        state.events.clear();
        state.master = false;
        state.atomic = false;
        self.publish_mappings(&mut state);
    }

    /// Attach the window surface later flips draw into.
    pub fn set_surface(&self, surface: Box<dyn WindowSurface>) {
        let (w, h) = surface.size();
        info!("Window surface attached: {}x{}", w, h);
        self.state().surface = surface;
    }

    pub fn surface_size(&self) -> (u32, u32) {
        self.state().surface.size()
    }

    pub fn set_window_geometry(&self, fb_id: u32, x: i32, y: i32, width: u32, height: u32) -> Result<()> {
        self.state().registry.set_window_geometry(fb_id, x, y, width, height)
    }

    pub fn set_window_z(&self, fb_id: u32, z: u32) -> Result<()> {
        self.state().registry.set_window_z(fb_id, z)
    }

    pub fn set_window_visible(&self, fb_id: u32, visible: bool) -> Result<()> {
        self.state().registry.set_window_visible(fb_id, visible)
    }

    pub fn destroy_window(&self, fb_id: u32) -> Result<()> {
        let mut state = self.state();
        let result = state.registry.destroy_window(fb_id);
        self.publish_mappings(&mut state);
        result
    }

    pub fn stats(&self) -> FlipStats {
        self.state().stats
    }

    /// Framebuffer most recently added, set on the CRTC or flipped; 0 once it
    /// is removed.
    pub fn current_framebuffer(&self) -> u32 {
        self.state().registry.current_fb
    }

    /// The one mode the connector advertises
    pub fn mode(&self) -> DrmModeModeinfo {
        self.state().mode()
    }
}

impl DeviceState {
    fn mode(&self) -> DrmModeModeinfo {
        let (w, h) = self.surface.size();
        synthesize_mode(w, h, self.config.refresh_rate)
    }

    fn queue_flip_event(&mut self, user_data: u64) {
        if self.events.len() == MAX_PENDING_EVENTS {
            warn!("Event queue full, dropping oldest flip event");
            self.events.pop_front();
        }
        self.flip_sequence = self.flip_sequence.wrapping_add(1);
        let (tv_sec, tv_usec) = monotonic_now();
        self.events.push_back(DrmEventVblank {
            base: DrmEvent {
                type_: DRM_EVENT_FLIP_COMPLETE,
                length: size_of::<DrmEventVblank>() as u32,
            },
            user_data,
            tv_sec,
            tv_usec,
            sequence: self.flip_sequence,
            crtc_id: CRTC_ID,
        });
    }

    // =========================================================================
    // Capability / version
    // =========================================================================

    unsafe fn version(&mut self, v: &mut DrmVersion) -> Result<()> {
        debug!("ioctl: VERSION");
        v.version_major = 1;
        v.version_minor = 0;
        v.version_patchlevel = 0;
        v.name_len = copy_str_to_user(v.name, v.name_len, DRIVER_NAME);
        v.date_len = copy_str_to_user(v.date, v.date_len, DRIVER_DATE);
        v.desc_len = copy_str_to_user(v.desc, v.desc_len, DRIVER_DESC);
        Ok(())
    }

    fn get_cap(&mut self, cap: &mut DrmGetCap) -> Result<()> {
        cap.value = match cap.capability {
            DRM_CAP_DUMB_BUFFER => 1,
            DRM_CAP_VBLANK_HIGH_CRTC => 1,
            DRM_CAP_DUMB_PREFERRED_DEPTH => 24,
            DRM_CAP_DUMB_PREFER_SHADOW => 0,
            DRM_CAP_PRIME => 0,
            DRM_CAP_TIMESTAMP_MONOTONIC => 1,
            DRM_CAP_ASYNC_PAGE_FLIP => 0,
            DRM_CAP_CURSOR_WIDTH | DRM_CAP_CURSOR_HEIGHT => 64,
            DRM_CAP_ADDFB2_MODIFIERS => 0,
            DRM_CAP_CRTC_IN_VBLANK_EVENT => 1,
            _ => 0,
        };
        debug!("ioctl: GET_CAP capability=0x{:x} -> {}", cap.capability, cap.value);
        Ok(())
    }

    fn set_client_cap(&mut self, cap: &mut DrmSetClientCap) -> Result<()> {
        debug!("ioctl: SET_CLIENT_CAP capability={} value={}", cap.capability, cap.value);
        // Universal planes changes nothing: the only plane is always listed
        if cap.capability == DRM_CLIENT_CAP_ATOMIC {
            self.atomic = cap.value != 0;
        }
        Ok(())
    }

    // =========================================================================
    // Mode objects
    // =========================================================================

    unsafe fn get_resources(&mut self, res: &mut DrmModeCardRes) -> Result<()> {
        let fbs = self.registry.framebuffer_ids();
        debug!("ioctl: MODE_GETRESOURCES ({} framebuffers)", fbs.len());

        copy_to_user(res.fb_id_ptr, res.count_fbs, &fbs);
        copy_to_user(res.crtc_id_ptr, res.count_crtcs, &[CRTC_ID]);
        copy_to_user(res.connector_id_ptr, res.count_connectors, &[CONNECTOR_ID]);
        copy_to_user(res.encoder_id_ptr, res.count_encoders, &[ENCODER_ID]);

        res.count_fbs = fbs.len() as u32;
        res.count_crtcs = 1;
        res.count_connectors = 1;
        res.count_encoders = 1;
        res.min_width = 1;
        res.max_width = MAX_DIMENSION;
        res.min_height = 1;
        res.max_height = MAX_DIMENSION;
        Ok(())
    }

    fn get_crtc(&mut self, crtc: &mut DrmModeCrtc) -> Result<()> {
        if crtc.crtc_id != CRTC_ID {
            return Err(Error::invalid(format!("unknown CRTC {}", crtc.crtc_id)));
        }
        let state = self.registry.crtc;
        crtc.fb_id = state.fb_id;
        crtc.x = state.x;
        crtc.y = state.y;
        crtc.gamma_size = 0;
        crtc.mode_valid = u32::from(state.mode_valid);
        crtc.mode = if state.mode_valid { self.mode() } else { DrmModeModeinfo::default() };
        debug!("ioctl: MODE_GETCRTC fb={} mode_valid={}", crtc.fb_id, crtc.mode_valid);
        Ok(())
    }

    unsafe fn set_crtc(&mut self, crtc: &mut DrmModeCrtc) -> Result<()> {
        if crtc.crtc_id != CRTC_ID {
            return Err(Error::invalid(format!("unknown CRTC {}", crtc.crtc_id)));
        }
        let connectors: Vec<u32> = copy_from_user(crtc.set_connectors_ptr, crtc.count_connectors);
        if let Some(bad) = connectors.iter().find(|&&c| c != CONNECTOR_ID) {
            return Err(Error::invalid(format!("unknown connector {}", bad)));
        }

        if crtc.fb_id != 0 {
            let size = self.surface.size();
            self.registry.present(crtc.fb_id, size)?;
            self.registry.current_fb = crtc.fb_id;
        }

        let mode_valid = crtc.mode_valid != 0;
        if mode_valid && crtc.mode != self.mode() {
            debug!(
                "SETCRTC mode {} differs from the synthesized one, keeping the surface size",
                name_to_string(&crtc.mode.name)
            );
        }
        self.registry.crtc.fb_id = crtc.fb_id;
        self.registry.crtc.x = crtc.x;
        self.registry.crtc.y = crtc.y;
        self.registry.crtc.mode_valid = mode_valid;

        info!(
            "SETCRTC: fb={} at {},{} mode_valid={} connectors={:?}",
            crtc.fb_id, crtc.x, crtc.y, mode_valid, connectors
        );
        Ok(())
    }

    fn get_encoder(&mut self, enc: &mut DrmModeGetEncoder) -> Result<()> {
        if enc.encoder_id != ENCODER_ID {
            return Err(Error::invalid(format!("unknown encoder {}", enc.encoder_id)));
        }
        enc.encoder_type = DRM_MODE_ENCODER_VIRTUAL;
        enc.crtc_id = CRTC_ID;
        enc.possible_crtcs = 1;
        enc.possible_clones = 0;
        debug!("ioctl: MODE_GETENCODER {}", enc.encoder_id);
        Ok(())
    }

    fn connector_properties(&self) -> Vec<(u32, u64)> {
        vec![(PROP_DPMS, self.registry.dpms), (PROP_CRTC_ID, u64::from(CRTC_ID))]
    }

    unsafe fn get_connector(&mut self, conn: &mut DrmModeGetConnector) -> Result<()> {
        if conn.connector_id != CONNECTOR_ID {
            return Err(Error::invalid(format!("unknown connector {}", conn.connector_id)));
        }
        let mode = self.mode();
        let props = self.connector_properties();
        let ids: Vec<u32> = props.iter().map(|p| p.0).collect();
        let values: Vec<u64> = props.iter().map(|p| p.1).collect();

        copy_to_user(conn.modes_ptr, conn.count_modes, &[mode]);
        copy_to_user(conn.encoders_ptr, conn.count_encoders, &[ENCODER_ID]);
        copy_to_user(conn.props_ptr, conn.count_props, &ids);
        copy_to_user(conn.prop_values_ptr, conn.count_props, &values);

        conn.count_modes = 1;
        conn.count_encoders = 1;
        conn.count_props = ids.len() as u32;
        conn.encoder_id = ENCODER_ID;
        conn.connector_type = DRM_MODE_CONNECTOR_VIRTUAL;
        conn.connector_type_id = 1;
        conn.connection = DRM_MODE_CONNECTED;
        conn.mm_width = (f32::from(mode.hdisplay) * 25.4 / ASSUMED_DPI) as u32;
        conn.mm_height = (f32::from(mode.vdisplay) * 25.4 / ASSUMED_DPI) as u32;
        conn.subpixel = DRM_MODE_SUBPIXEL_UNKNOWN;

        debug!(
            "ioctl: MODE_GETCONNECTOR mode {}x{}@{} ({}x{}mm)",
            mode.hdisplay, mode.vdisplay, mode.vrefresh, conn.mm_width, conn.mm_height
        );
        Ok(())
    }

    // =========================================================================
    // Properties and blobs
    // =========================================================================

    unsafe fn get_property(&mut self, prop: &mut DrmModeGetProperty) -> Result<()> {
        let info = property_info(prop.prop_id);
        let enums: Vec<DrmModePropertyEnum> = info
            .enums
            .iter()
            .map(|&(value, name)| DrmModePropertyEnum {
                value,
                name: fixed_name(name),
            })
            .collect();

        copy_to_user(prop.values_ptr, prop.count_values, &info.values);
        copy_to_user(prop.enum_blob_ptr, prop.count_enum_blobs, &enums);

        prop.flags = info.flags;
        prop.name = fixed_name(info.name);
        prop.count_values = info.values.len() as u32;
        prop.count_enum_blobs = enums.len() as u32;
        debug!("ioctl: MODE_GETPROPERTY {} ({})", prop.prop_id, info.name);
        Ok(())
    }

    unsafe fn get_prop_blob(&mut self, req: &mut DrmModeGetBlob) -> Result<()> {
        let blob = self
            .registry
            .blob(req.blob_id)
            .ok_or_else(|| Error::invalid(format!("unknown blob {}", req.blob_id)))?;
        copy_to_user(req.data, req.length, &blob.data);
        req.length = blob.data.len() as u32;
        debug!("ioctl: MODE_GETPROPBLOB {} ({} bytes)", req.blob_id, req.length);
        Ok(())
    }

    unsafe fn create_prop_blob(&mut self, req: &mut DrmModeCreateBlob) -> Result<()> {
        if req.data == 0 || req.length == 0 {
            return Err(Error::invalid("empty blob"));
        }
        if req.length as usize > crate::registry::MAX_BLOB_SIZE {
            return Err(Error::invalid(format!("blob of {} bytes too large", req.length)));
        }
        let data: Vec<u8> = copy_from_user(req.data, req.length);
        req.blob_id = self.registry.create_blob(data)?;
        Ok(())
    }

    fn object_properties(&self, obj_id: u32, obj_type: u32) -> Result<Vec<(u32, u64)>> {
        let matches = |expected: u32| obj_type == DRM_MODE_OBJECT_ANY || obj_type == expected;
        match obj_id {
            CONNECTOR_ID if matches(DRM_MODE_OBJECT_CONNECTOR) => Ok(self.connector_properties()),
            PLANE_ID if matches(DRM_MODE_OBJECT_PLANE) => {
                let crtc = if self.registry.plane_fb != 0 { CRTC_ID } else { 0 };
                Ok(vec![(PROP_TYPE, DRM_PLANE_TYPE_OVERLAY), (PROP_CRTC_ID, u64::from(crtc))])
            }
            CRTC_ID if matches(DRM_MODE_OBJECT_CRTC) => Ok(Vec::new()),
            ENCODER_ID if matches(DRM_MODE_OBJECT_ENCODER) => Ok(Vec::new()),
            _ => Err(Error::invalid(format!("unknown object {} type 0x{:x}", obj_id, obj_type))),
        }
    }

    unsafe fn obj_get_properties(&mut self, req: &mut DrmModeObjGetProperties) -> Result<()> {
        let props = self.object_properties(req.obj_id, req.obj_type)?;
        let ids: Vec<u32> = props.iter().map(|p| p.0).collect();
        let values: Vec<u64> = props.iter().map(|p| p.1).collect();
        copy_to_user(req.props_ptr, req.count_props, &ids);
        copy_to_user(req.prop_values_ptr, req.count_props, &values);
        req.count_props = ids.len() as u32;
        debug!("ioctl: MODE_OBJ_GETPROPERTIES obj={} -> {} props", req.obj_id, req.count_props);
        Ok(())
    }

    fn obj_set_property(&mut self, req: &mut DrmModeObjSetProperty) -> Result<()> {
        self.object_properties(req.obj_id, req.obj_type)?;
        match (req.obj_id, req.prop_id) {
            (CONNECTOR_ID, PROP_DPMS) => {
                if req.value > DRM_MODE_DPMS_OFF {
                    return Err(Error::invalid(format!("DPMS value {}", req.value)));
                }
                self.registry.dpms = req.value;
                info!("DPMS set to {}", req.value);
            }
            (obj, prop) => debug!("ioctl: MODE_OBJ_SETPROPERTY obj={} prop={} value={} ignored", obj, prop, req.value),
        }
        Ok(())
    }

    unsafe fn atomic(&mut self, req: &mut DrmModeAtomic) -> Result<()> {
        if !self.atomic {
            warn!("Atomic commit before the client enabled DRM_CLIENT_CAP_ATOMIC");
        }
        // A dry run always passes and never looks at the batch
        if req.flags & DRM_MODE_ATOMIC_TEST_ONLY != 0 {
            debug!("ioctl: MODE_ATOMIC test only, {} objects", req.count_objs);
            return Ok(());
        }

        let objs: Vec<u32> = copy_from_user(req.objs_ptr, req.count_objs);
        let counts: Vec<u32> = copy_from_user(req.count_props_ptr, req.count_objs);
        if objs.len() != req.count_objs as usize || counts.len() != objs.len() {
            return Err(Error::invalid("atomic object arrays missing"));
        }

        let total: usize = counts.iter().map(|&c| c as usize).sum();
        if total > MAX_ATOMIC_PROPS {
            return Err(Error::invalid(format!("atomic request with {} properties", total)));
        }
        let props: Vec<u32> = copy_from_user(req.props_ptr, total as u32);
        let values: Vec<u64> = copy_from_user(req.prop_values_ptr, total as u32);
        if props.len() != total || values.len() != total {
            return Err(Error::invalid("atomic property arrays missing"));
        }

        debug!("ioctl: MODE_ATOMIC flags=0x{:x} objs={} props={}", req.flags, objs.len(), total);

        let mut next = 0;
        for (obj, count) in objs.iter().zip(counts.iter()) {
            for _ in 0..*count {
                debug!("  atomic: obj={} prop={} value={}", obj, props[next], values[next]);
                next += 1;
            }
        }

        if req.flags & DRM_MODE_PAGE_FLIP_EVENT != 0 {
            self.queue_flip_event(req.user_data);
        }
        Ok(())
    }

    // =========================================================================
    // Buffers and framebuffers
    // =========================================================================

    fn create_dumb(&mut self, req: &mut DrmModeCreateDumb) -> Result<()> {
        let buffer = self.registry.create_dumb(req.width, req.height, req.bpp)?;
        req.handle = buffer.handle;
        req.pitch = buffer.pitch;
        req.size = buffer.size;
        Ok(())
    }

    fn map_dumb(&mut self, req: &mut DrmModeMapDumb) -> Result<()> {
        req.offset = self.registry.map_dumb(req.handle, &self.allocator)?;
        Ok(())
    }

    fn get_fb(&mut self, req: &mut DrmModeFbCmd) -> Result<()> {
        let fb = *self
            .registry
            .framebuffer(req.fb_id)
            .ok_or_else(|| Error::invalid(format!("unknown framebuffer {}", req.fb_id)))?;
        req.width = fb.width;
        req.height = fb.height;
        req.pitch = fb.pitch;
        req.bpp = fb.bpp;
        req.depth = fb.depth;
        req.handle = fb.handle;
        Ok(())
    }

    fn add_fb(&mut self, req: &mut DrmModeFbCmd) -> Result<()> {
        let format = legacy_format(req.bpp, req.depth)?;
        req.fb_id = self.registry.add_framebuffer(
            req.handle, req.width, req.height, req.pitch, req.bpp, req.depth, format,
        )?;
        Ok(())
    }

    fn add_fb2(&mut self, req: &mut DrmModeFbCmd2) -> Result<()> {
        // Only single-plane buffers starting at byte 0 are scanned out
        if req.offsets[0] != 0 {
            return Err(Error::invalid(format!("plane 0 offset {} not supported", req.offsets[0])));
        }
        let (bpp, depth) = format_bpp_depth(req.pixel_format)
            .ok_or_else(|| Error::invalid(format!("unsupported format 0x{:08x}", req.pixel_format)))?;
        req.fb_id = self.registry.add_framebuffer(
            req.handles[0],
            req.width,
            req.height,
            req.pitches[0],
            bpp,
            depth,
            req.pixel_format,
        )?;
        Ok(())
    }

    fn page_flip(&mut self, req: &mut DrmModeCrtcPageFlip) -> Result<()> {
        if req.crtc_id != CRTC_ID {
            return Err(Error::invalid(format!("flip on unknown CRTC {}", req.crtc_id)));
        }
        let size = self.surface.size();
        self.registry.present(req.fb_id, size)?;
        self.registry.crtc.fb_id = req.fb_id;
        self.registry.current_fb = req.fb_id;

        compositor::composite(&self.registry, self.surface.as_mut(), &mut self.stats)?;

        if req.flags & DRM_MODE_PAGE_FLIP_EVENT != 0 {
            self.queue_flip_event(req.user_data);
        }
        Ok(())
    }

    // =========================================================================
    // Planes
    // =========================================================================

    unsafe fn get_plane(&mut self, plane: &mut DrmModeGetPlane) -> Result<()> {
        if plane.plane_id != PLANE_ID {
            return Err(Error::invalid(format!("unknown plane {}", plane.plane_id)));
        }
        copy_to_user(plane.format_type_ptr, plane.count_format_types, &PLANE_FORMATS);
        plane.count_format_types = PLANE_FORMATS.len() as u32;
        plane.fb_id = self.registry.plane_fb;
        plane.crtc_id = if plane.fb_id != 0 { CRTC_ID } else { 0 };
        plane.possible_crtcs = 1;
        plane.gamma_size = 0;
        Ok(())
    }

    fn set_plane(&mut self, req: &mut DrmModeSetPlane) -> Result<()> {
        if req.plane_id != PLANE_ID {
            return Err(Error::invalid(format!("unknown plane {}", req.plane_id)));
        }
        if req.fb_id != 0 && self.registry.framebuffer(req.fb_id).is_none() {
            return Err(Error::invalid(format!("plane framebuffer {} unknown", req.fb_id)));
        }
        self.registry.plane_fb = req.fb_id;
        debug!(
            "ioctl: MODE_SETPLANE fb={} crtc={},{} {}x{} src={}x{}",
            req.fb_id,
            req.crtc_x,
            req.crtc_y,
            req.crtc_w,
            req.crtc_h,
            req.src_w >> 16,
            req.src_h >> 16
        );
        Ok(())
    }
}
