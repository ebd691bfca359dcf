//! Typed client calls over the raw request interface
//!
//! [`Card`] turns owned Rust values into the kernel request layouts and back,
//! including the two-call enumeration dance (ask for counts, allocate, ask
//! again). It keeps no state of its own: every call goes straight to an
//! [`Ioctl`] target, which is either the in-process [`Device`] or a real file
//! descriptor.

use crate::abi::*;
use crate::device::Device;
use crate::interceptor::DEVICE_PATHS;
use crate::{Error, Result};
use std::ffi::{c_char, c_ulong, c_void};
use std::os::unix::io::{AsRawFd, BorrowedFd};
use std::ptr;
use tracing::debug;

/// Anything that can carry a DRM request.
pub trait Ioctl {
    /// Issue `request`, returning 0 or a negative errno.
    ///
    /// # Safety
    /// `arg` must be null or point to the structure `request` encodes.
    unsafe fn ioctl(&self, request: c_ulong, arg: *mut c_void) -> i32;
}

impl Ioctl for Device {
    unsafe fn ioctl(&self, request: c_ulong, arg: *mut c_void) -> i32 {
        Device::ioctl(self, request, arg)
    }
}

impl Ioctl for BorrowedFd<'_> {
    unsafe fn ioctl(&self, request: c_ulong, arg: *mut c_void) -> i32 {
        if libc::ioctl(self.as_raw_fd(), request as _, arg) < 0 {
            -std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
        } else {
            0
        }
    }
}

/// Kind of device node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Primary,
    Control,
    Render,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceNode {
    pub path: &'static str,
    pub node_type: NodeType,
}

/// The device nodes that open the emulated card.
pub fn enumerate_devices() -> Vec<DeviceNode> {
    DEVICE_PATHS
        .iter()
        .map(|&path| DeviceNode {
            path,
            node_type: if path.contains("renderD") {
                NodeType::Render
            } else if path.contains("controlD") {
                NodeType::Control
            } else {
                NodeType::Primary
            },
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverVersion {
    pub major: i32,
    pub minor: i32,
    pub patchlevel: i32,
    pub name: String,
    pub date: String,
    pub desc: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resources {
    pub framebuffers: Vec<u32>,
    pub crtcs: Vec<u32>,
    pub connectors: Vec<u32>,
    pub encoders: Vec<u32>,
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
}

#[derive(Debug, Clone)]
pub struct Connector {
    pub id: u32,
    pub connector_type: u32,
    pub connector_type_id: u32,
    pub connection: u32,
    pub mm_width: u32,
    pub mm_height: u32,
    pub subpixel: u32,
    pub encoder_id: u32,
    pub encoders: Vec<u32>,
    pub modes: Vec<DrmModeModeinfo>,
    /// (property id, value)
    pub properties: Vec<(u32, u64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Encoder {
    pub id: u32,
    pub encoder_type: u32,
    pub crtc_id: u32,
    pub possible_crtcs: u32,
    pub possible_clones: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crtc {
    pub id: u32,
    pub fb_id: u32,
    pub x: u32,
    pub y: u32,
    pub gamma_size: u32,
    pub mode: Option<DrmModeModeinfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub id: u32,
    pub name: String,
    pub flags: u32,
    pub values: Vec<u64>,
    pub enums: Vec<(u64, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plane {
    pub id: u32,
    pub crtc_id: u32,
    pub fb_id: u32,
    pub possible_crtcs: u32,
    pub formats: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumbBuffer {
    pub handle: u32,
    pub pitch: u32,
    pub size: u64,
}

fn user_ptr<T>(items: &mut [T]) -> u64 {
    if items.is_empty() {
        0
    } else {
        items.as_mut_ptr() as usize as u64
    }
}

/// A DRM card reached through some [`Ioctl`] target
pub struct Card<'a, D: Ioctl + ?Sized> {
    dev: &'a D,
}

impl<'a, D: Ioctl + ?Sized> Card<'a, D> {
    pub fn new(dev: &'a D) -> Self {
        Self { dev }
    }

    unsafe fn raw(&self, request: c_ulong, arg: *mut c_void) -> Result<()> {
        match self.dev.ioctl(request, arg) {
            status if status < 0 => Err(Error::Io(std::io::Error::from_raw_os_error(-status))),
            _ => Ok(()),
        }
    }

    /// Issue a request whose argument holds no user pointers, or whose user
    /// pointers reference memory that outlives the call.
    fn call<T>(&self, request: c_ulong, arg: &mut T) -> Result<()> {
        unsafe { self.raw(request, arg as *mut T as *mut c_void) }
    }

    pub fn version(&self) -> Result<DriverVersion> {
        let mut v = DrmVersion {
            version_major: 0,
            version_minor: 0,
            version_patchlevel: 0,
            name_len: 0,
            name: ptr::null_mut(),
            date_len: 0,
            date: ptr::null_mut(),
            desc_len: 0,
            desc: ptr::null_mut(),
        };
        self.call(DRM_IOCTL_VERSION, &mut v)?;

        let mut name = vec![0u8; v.name_len];
        let mut date = vec![0u8; v.date_len];
        let mut desc = vec![0u8; v.desc_len];
        v.name = name.as_mut_ptr() as *mut c_char;
        v.date = date.as_mut_ptr() as *mut c_char;
        v.desc = desc.as_mut_ptr() as *mut c_char;
        self.call(DRM_IOCTL_VERSION, &mut v)?;

        let text = |mut bytes: Vec<u8>, len: usize| {
            bytes.truncate(len);
            String::from_utf8_lossy(&bytes).into_owned()
        };
        Ok(DriverVersion {
            major: v.version_major,
            minor: v.version_minor,
            patchlevel: v.version_patchlevel,
            name: text(name, v.name_len),
            date: text(date, v.date_len),
            desc: text(desc, v.desc_len),
        })
    }

    pub fn get_cap(&self, capability: u64) -> Result<u64> {
        let mut cap = DrmGetCap { capability, value: 0 };
        self.call(DRM_IOCTL_GET_CAP, &mut cap)?;
        Ok(cap.value)
    }

    pub fn set_client_cap(&self, capability: u64, value: u64) -> Result<()> {
        self.call(DRM_IOCTL_SET_CLIENT_CAP, &mut DrmSetClientCap { capability, value })
    }

    pub fn set_master(&self) -> Result<()> {
        unsafe { self.raw(DRM_IOCTL_SET_MASTER, ptr::null_mut()) }
    }

    pub fn drop_master(&self) -> Result<()> {
        unsafe { self.raw(DRM_IOCTL_DROP_MASTER, ptr::null_mut()) }
    }

    pub fn resources(&self) -> Result<Resources> {
        let mut res = DrmModeCardRes::default();
        self.call(DRM_IOCTL_MODE_GETRESOURCES, &mut res)?;

        let mut fbs = vec![0u32; res.count_fbs as usize];
        let mut crtcs = vec![0u32; res.count_crtcs as usize];
        let mut connectors = vec![0u32; res.count_connectors as usize];
        let mut encoders = vec![0u32; res.count_encoders as usize];
        res.fb_id_ptr = user_ptr(&mut fbs);
        res.crtc_id_ptr = user_ptr(&mut crtcs);
        res.connector_id_ptr = user_ptr(&mut connectors);
        res.encoder_id_ptr = user_ptr(&mut encoders);
        self.call(DRM_IOCTL_MODE_GETRESOURCES, &mut res)?;

        // Objects may have disappeared between the two calls
        fbs.truncate(res.count_fbs as usize);
        crtcs.truncate(res.count_crtcs as usize);
        connectors.truncate(res.count_connectors as usize);
        encoders.truncate(res.count_encoders as usize);

        Ok(Resources {
            framebuffers: fbs,
            crtcs,
            connectors,
            encoders,
            min_width: res.min_width,
            max_width: res.max_width,
            min_height: res.min_height,
            max_height: res.max_height,
        })
    }

    pub fn connector(&self, id: u32) -> Result<Connector> {
        let mut conn = DrmModeGetConnector {
            connector_id: id,
            ..Default::default()
        };
        self.call(DRM_IOCTL_MODE_GETCONNECTOR, &mut conn)?;

        let mut encoders = vec![0u32; conn.count_encoders as usize];
        let mut modes = vec![DrmModeModeinfo::default(); conn.count_modes as usize];
        let mut props = vec![0u32; conn.count_props as usize];
        let mut values = vec![0u64; conn.count_props as usize];
        conn.encoders_ptr = user_ptr(&mut encoders);
        conn.modes_ptr = user_ptr(&mut modes);
        conn.props_ptr = user_ptr(&mut props);
        conn.prop_values_ptr = user_ptr(&mut values);
        self.call(DRM_IOCTL_MODE_GETCONNECTOR, &mut conn)?;

        encoders.truncate(conn.count_encoders as usize);
        modes.truncate(conn.count_modes as usize);
        let properties = props.into_iter().zip(values).take(conn.count_props as usize).collect();

        Ok(Connector {
            id,
            connector_type: conn.connector_type,
            connector_type_id: conn.connector_type_id,
            connection: conn.connection,
            mm_width: conn.mm_width,
            mm_height: conn.mm_height,
            subpixel: conn.subpixel,
            encoder_id: conn.encoder_id,
            encoders,
            modes,
            properties,
        })
    }

    pub fn encoder(&self, id: u32) -> Result<Encoder> {
        let mut enc = DrmModeGetEncoder {
            encoder_id: id,
            ..Default::default()
        };
        self.call(DRM_IOCTL_MODE_GETENCODER, &mut enc)?;
        Ok(Encoder {
            id,
            encoder_type: enc.encoder_type,
            crtc_id: enc.crtc_id,
            possible_crtcs: enc.possible_crtcs,
            possible_clones: enc.possible_clones,
        })
    }

    pub fn crtc(&self, id: u32) -> Result<Crtc> {
        let mut crtc = DrmModeCrtc {
            crtc_id: id,
            ..Default::default()
        };
        self.call(DRM_IOCTL_MODE_GETCRTC, &mut crtc)?;
        Ok(Crtc {
            id,
            fb_id: crtc.fb_id,
            x: crtc.x,
            y: crtc.y,
            gamma_size: crtc.gamma_size,
            mode: (crtc.mode_valid != 0).then_some(crtc.mode),
        })
    }

    /// Program the CRTC. `fb_id` 0 keeps no framebuffer bound; `mode` None
    /// turns the pipe off.
    pub fn set_crtc(
        &self,
        crtc_id: u32,
        fb_id: u32,
        x: u32,
        y: u32,
        connectors: &[u32],
        mode: Option<&DrmModeModeinfo>,
    ) -> Result<()> {
        let mut ids = connectors.to_vec();
        let mut crtc = DrmModeCrtc {
            set_connectors_ptr: user_ptr(&mut ids),
            count_connectors: ids.len() as u32,
            crtc_id,
            fb_id,
            x,
            y,
            mode_valid: u32::from(mode.is_some()),
            mode: mode.copied().unwrap_or_default(),
            ..Default::default()
        };
        self.call(DRM_IOCTL_MODE_SETCRTC, &mut crtc)
    }

    pub fn property(&self, id: u32) -> Result<Property> {
        let mut prop = DrmModeGetProperty {
            prop_id: id,
            ..Default::default()
        };
        self.call(DRM_IOCTL_MODE_GETPROPERTY, &mut prop)?;

        let mut values = vec![0u64; prop.count_values as usize];
        let mut enums = vec![DrmModePropertyEnum::default(); prop.count_enum_blobs as usize];
        prop.values_ptr = user_ptr(&mut values);
        prop.enum_blob_ptr = user_ptr(&mut enums);
        self.call(DRM_IOCTL_MODE_GETPROPERTY, &mut prop)?;

        values.truncate(prop.count_values as usize);
        enums.truncate(prop.count_enum_blobs as usize);
        Ok(Property {
            id,
            name: name_to_string(&prop.name),
            flags: prop.flags,
            values,
            enums: enums.iter().map(|e| (e.value, name_to_string(&e.name))).collect(),
        })
    }

    /// (property id, value) pairs of a mode object
    pub fn object_properties(&self, obj_id: u32, obj_type: u32) -> Result<Vec<(u32, u64)>> {
        let mut req = DrmModeObjGetProperties {
            obj_id,
            obj_type,
            ..Default::default()
        };
        self.call(DRM_IOCTL_MODE_OBJ_GETPROPERTIES, &mut req)?;

        let mut props = vec![0u32; req.count_props as usize];
        let mut values = vec![0u64; req.count_props as usize];
        req.props_ptr = user_ptr(&mut props);
        req.prop_values_ptr = user_ptr(&mut values);
        self.call(DRM_IOCTL_MODE_OBJ_GETPROPERTIES, &mut req)?;

        Ok(props.into_iter().zip(values).take(req.count_props as usize).collect())
    }

    pub fn set_object_property(&self, obj_id: u32, obj_type: u32, prop_id: u32, value: u64) -> Result<()> {
        self.call(
            DRM_IOCTL_MODE_OBJ_SETPROPERTY,
            &mut DrmModeObjSetProperty {
                value,
                prop_id,
                obj_id,
                obj_type,
            },
        )
    }

    pub fn create_property_blob(&self, data: &[u8]) -> Result<u32> {
        let mut req = DrmModeCreateBlob {
            data: data.as_ptr() as usize as u64,
            length: data.len() as u32,
            blob_id: 0,
        };
        self.call(DRM_IOCTL_MODE_CREATEPROPBLOB, &mut req)?;
        debug!("Created property blob {} ({} bytes)", req.blob_id, data.len());
        Ok(req.blob_id)
    }

    pub fn property_blob(&self, blob_id: u32) -> Result<Vec<u8>> {
        let mut req = DrmModeGetBlob {
            blob_id,
            ..Default::default()
        };
        self.call(DRM_IOCTL_MODE_GETPROPBLOB, &mut req)?;
        let mut data = vec![0u8; req.length as usize];
        req.data = user_ptr(&mut data);
        self.call(DRM_IOCTL_MODE_GETPROPBLOB, &mut req)?;
        data.truncate(req.length as usize);
        Ok(data)
    }

    pub fn destroy_property_blob(&self, blob_id: u32) -> Result<()> {
        self.call(DRM_IOCTL_MODE_DESTROYPROPBLOB, &mut DrmModeDestroyBlob { blob_id })
    }

    pub fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> Result<DumbBuffer> {
        let mut req = DrmModeCreateDumb {
            width,
            height,
            bpp,
            ..Default::default()
        };
        self.call(DRM_IOCTL_MODE_CREATE_DUMB, &mut req)?;
        Ok(DumbBuffer {
            handle: req.handle,
            pitch: req.pitch,
            size: req.size,
        })
    }

    /// Offset to pass to `mmap` on the device descriptor
    pub fn map_dumb(&self, handle: u32) -> Result<u64> {
        let mut req = DrmModeMapDumb {
            handle,
            ..Default::default()
        };
        self.call(DRM_IOCTL_MODE_MAP_DUMB, &mut req)?;
        Ok(req.offset)
    }

    pub fn destroy_dumb(&self, handle: u32) -> Result<()> {
        self.call(DRM_IOCTL_MODE_DESTROY_DUMB, &mut DrmModeDestroyDumb { handle })
    }

    /// Single-plane ADDFB2
    pub fn add_framebuffer(&self, handle: u32, width: u32, height: u32, format: u32, pitch: u32) -> Result<u32> {
        let mut req = DrmModeFbCmd2 {
            width,
            height,
            pixel_format: format,
            ..Default::default()
        };
        req.handles[0] = handle;
        req.pitches[0] = pitch;
        self.call(DRM_IOCTL_MODE_ADDFB2, &mut req)?;
        Ok(req.fb_id)
    }

    pub fn remove_framebuffer(&self, fb_id: u32) -> Result<()> {
        let mut id = fb_id;
        self.call(DRM_IOCTL_MODE_RMFB, &mut id)
    }

    pub fn page_flip(&self, crtc_id: u32, fb_id: u32, flags: u32, user_data: u64) -> Result<()> {
        self.call(
            DRM_IOCTL_MODE_PAGE_FLIP,
            &mut DrmModeCrtcPageFlip {
                crtc_id,
                fb_id,
                flags,
                reserved: 0,
                user_data,
            },
        )
    }

    pub fn plane_resources(&self) -> Result<Vec<u32>> {
        let mut res = DrmModeGetPlaneRes::default();
        self.call(DRM_IOCTL_MODE_GETPLANERESOURCES, &mut res)?;
        let mut planes = vec![0u32; res.count_planes as usize];
        res.plane_id_ptr = user_ptr(&mut planes);
        self.call(DRM_IOCTL_MODE_GETPLANERESOURCES, &mut res)?;
        planes.truncate(res.count_planes as usize);
        Ok(planes)
    }

    pub fn plane(&self, id: u32) -> Result<Plane> {
        let mut req = DrmModeGetPlane {
            plane_id: id,
            ..Default::default()
        };
        self.call(DRM_IOCTL_MODE_GETPLANE, &mut req)?;
        let mut formats = vec![0u32; req.count_format_types as usize];
        req.format_type_ptr = user_ptr(&mut formats);
        self.call(DRM_IOCTL_MODE_GETPLANE, &mut req)?;
        formats.truncate(req.count_format_types as usize);
        Ok(Plane {
            id,
            crtc_id: req.crtc_id,
            fb_id: req.fb_id,
            possible_crtcs: req.possible_crtcs,
            formats,
        })
    }
}

/// Property changes batched into one MODE_ATOMIC request
#[derive(Debug, Default, Clone)]
pub struct AtomicRequest {
    items: Vec<(u32, u32, u64)>,
}

impl AtomicRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `property = value` on `object`. Returns the number of queued
    /// changes.
    pub fn add_property(&mut self, object_id: u32, property_id: u32, value: u64) -> usize {
        self.items.push((object_id, property_id, value));
        self.items.len()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Object ids, per-object counts, property ids and values in the kernel's
    /// layout. Changes are grouped by object; a property set twice keeps the
    /// last value.
    fn layout(&self) -> (Vec<u32>, Vec<u32>, Vec<u32>, Vec<u64>) {
        let mut items = self.items.clone();
        items.sort_by_key(|&(obj, prop, _)| (obj, prop));
        let mut merged: Vec<(u32, u32, u64)> = Vec::with_capacity(items.len());
        for (obj, prop, value) in items {
            // Stable sort keeps insertion order within a key, so the last wins
            match merged.last_mut() {
                Some(last) if last.0 == obj && last.1 == prop => last.2 = value,
                _ => merged.push((obj, prop, value)),
            }
        }

        let mut objs: Vec<u32> = Vec::new();
        let mut counts: Vec<u32> = Vec::new();
        for &(obj, _, _) in &merged {
            if objs.last() == Some(&obj) {
                if let Some(count) = counts.last_mut() {
                    *count += 1;
                }
            } else {
                objs.push(obj);
                counts.push(1);
            }
        }
        let props = merged.iter().map(|m| m.1).collect();
        let values = merged.iter().map(|m| m.2).collect();
        (objs, counts, props, values)
    }

    pub fn commit<D: Ioctl + ?Sized>(&self, card: &Card<'_, D>, flags: u32, user_data: u64) -> Result<()> {
        let (mut objs, mut counts, mut props, mut values) = self.layout();
        let mut req = DrmModeAtomic {
            flags,
            count_objs: objs.len() as u32,
            objs_ptr: user_ptr(&mut objs),
            count_props_ptr: user_ptr(&mut counts),
            props_ptr: user_ptr(&mut props),
            prop_values_ptr: user_ptr(&mut values),
            reserved: 0,
            user_data,
        };
        card.call(DRM_IOCTL_MODE_ATOMIC, &mut req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShimConfig;
    use crate::device::{PROP_DPMS, PLANE_FORMATS};
    use crate::registry::{CONNECTOR_ID, CRTC_ID, ENCODER_ID, PLANE_ID};

    fn device() -> Device {
        Device::new(ShimConfig {
            width: 64,
            height: 48,
            heap_threshold: 1 << 30,
            ..ShimConfig::default()
        })
    }

    #[test]
    fn test_enumerate_devices() {
        let nodes = enumerate_devices();
        assert_eq!(nodes.len(), DEVICE_PATHS.len());
        assert_eq!(nodes[0].node_type, NodeType::Primary);
        assert!(nodes.iter().any(|n| n.node_type == NodeType::Render));
        assert!(nodes.iter().any(|n| n.node_type == NodeType::Control));
    }

    #[test]
    fn test_version_strings() {
        let dev = device();
        let version = Card::new(&dev).version().unwrap();
        assert_eq!((version.major, version.minor, version.patchlevel), (1, 0, 0));
        assert_eq!(version.name, "surface-shim");
        assert_eq!(version.date, "20250101");
    }

    #[test]
    fn test_resources_and_pipeline() {
        let dev = device();
        let card = Card::new(&dev);
        let res = card.resources().unwrap();
        assert!(res.framebuffers.is_empty());
        assert_eq!(res.crtcs, vec![CRTC_ID]);
        assert_eq!(res.connectors, vec![CONNECTOR_ID]);
        assert_eq!(res.encoders, vec![ENCODER_ID]);

        let conn = card.connector(CONNECTOR_ID).unwrap();
        assert_eq!(conn.connection, DRM_MODE_CONNECTED);
        assert_eq!(conn.modes, vec![dev.mode()]);
        assert_eq!(conn.encoders, vec![ENCODER_ID]);
        assert!(conn.properties.iter().any(|&(id, _)| id == PROP_DPMS));

        let enc = card.encoder(conn.encoder_id).unwrap();
        assert_eq!(enc.crtc_id, CRTC_ID);
        assert!(card.encoder(99).is_err());

        let crtc = card.crtc(CRTC_ID).unwrap();
        assert_eq!(crtc.mode.map(|m| (m.hdisplay, m.vdisplay)), Some((64, 48)));
    }

    #[test]
    fn test_set_crtc_round_trip() {
        let dev = device();
        let card = Card::new(&dev);
        let buf = card.create_dumb(64, 48, 32).unwrap();
        let fb = card.add_framebuffer(buf.handle, 64, 48, fourcc::XRGB8888, buf.pitch).unwrap();
        let mode = dev.mode();
        card.set_crtc(CRTC_ID, fb, 0, 0, &[CONNECTOR_ID], Some(&mode)).unwrap();
        assert_eq!(card.crtc(CRTC_ID).unwrap().fb_id, fb);
        assert_eq!(card.resources().unwrap().framebuffers, vec![fb]);

        let err = card.set_crtc(CRTC_ID, fb, 0, 0, &[77], Some(&mode)).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);

        card.set_crtc(CRTC_ID, 0, 0, 0, &[], None).unwrap();
        assert_eq!(card.crtc(CRTC_ID).unwrap().mode, None);
    }

    #[test]
    fn test_property_blob_lifecycle() {
        let dev = device();
        let card = Card::new(&dev);
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let id = card.create_property_blob(&data).unwrap();
        assert_eq!(card.property_blob(id).unwrap(), data);
        card.destroy_property_blob(id).unwrap();
        assert_eq!(card.property_blob(id).unwrap_err().errno(), libc::EINVAL);
    }

    #[test]
    fn test_properties_and_planes() {
        let dev = device();
        let card = Card::new(&dev);
        let dpms = card.property(PROP_DPMS).unwrap();
        assert_eq!(dpms.name, "DPMS");
        assert_eq!(dpms.enums.len(), 4);
        assert_eq!(dpms.enums[3], (DRM_MODE_DPMS_OFF, "Off".to_string()));

        card.set_object_property(CONNECTOR_ID, DRM_MODE_OBJECT_CONNECTOR, PROP_DPMS, DRM_MODE_DPMS_OFF)
            .unwrap();
        let props = card.object_properties(CONNECTOR_ID, DRM_MODE_OBJECT_CONNECTOR).unwrap();
        assert!(props.contains(&(PROP_DPMS, DRM_MODE_DPMS_OFF)));

        assert_eq!(card.plane_resources().unwrap(), vec![PLANE_ID]);
        assert_eq!(card.plane(PLANE_ID).unwrap().formats, PLANE_FORMATS.to_vec());
    }

    #[test]
    fn test_caps_and_master() {
        let dev = device();
        let card = Card::new(&dev);
        assert_eq!(card.get_cap(DRM_CAP_DUMB_BUFFER).unwrap(), 1);
        assert_eq!(card.get_cap(DRM_CAP_DUMB_PREFERRED_DEPTH).unwrap(), 24);
        assert_eq!(card.get_cap(0xffff).unwrap(), 0);
        card.set_client_cap(DRM_CLIENT_CAP_ATOMIC, 1).unwrap();

        card.set_master().unwrap();
        assert!(dev.is_master());
        card.drop_master().unwrap();
        assert!(!dev.is_master());
    }

    #[test]
    fn test_atomic_layout_groups_and_dedups() {
        let mut req = AtomicRequest::new();
        req.add_property(PLANE_ID, 3, 10);
        req.add_property(CONNECTOR_ID, 2, 0);
        req.add_property(PLANE_ID, 3, 11);
        assert_eq!(req.add_property(PLANE_ID, 1, 0), 4);

        let (objs, counts, props, values) = req.layout();
        assert_eq!(objs, vec![CONNECTOR_ID, PLANE_ID]);
        assert_eq!(counts, vec![1, 2]);
        assert_eq!(props, vec![2, 1, 3]);
        assert_eq!(values, vec![0, 0, 11]);
    }

    #[test]
    fn test_atomic_commit_queues_event() {
        let dev = device();
        let card = Card::new(&dev);
        card.set_client_cap(DRM_CLIENT_CAP_ATOMIC, 1).unwrap();
        let mut req = AtomicRequest::new();
        req.add_property(CONNECTOR_ID, PROP_DPMS, DRM_MODE_DPMS_ON);

        req.commit(&card, DRM_MODE_ATOMIC_TEST_ONLY, 0).unwrap();
        assert_eq!(dev.pending_events(), 0);
        req.commit(&card, DRM_MODE_PAGE_FLIP_EVENT, 0xabc).unwrap();
        assert_eq!(dev.pending_events(), 1);
    }

    #[test]
    fn test_dumb_flip_draws_buffer() {
        let dev = device();
        let card = Card::new(&dev);
        let buf = card.create_dumb(64, 48, 32).unwrap();
        assert_eq!((buf.pitch, buf.size), (256, 256 * 48));
        let offset = card.map_dumb(buf.handle).unwrap();
        assert!(dev.is_buffer_address(offset));

        let fb = card.add_framebuffer(buf.handle, 64, 48, fourcc::XRGB8888, buf.pitch).unwrap();
        card.page_flip(CRTC_ID, fb, DRM_MODE_PAGE_FLIP_EVENT, 1).unwrap();
        assert_eq!(dev.stats().flips, 1);
        assert_eq!(dev.stats().windows_drawn, 1);

        card.remove_framebuffer(fb).unwrap();
        card.destroy_dumb(buf.handle).unwrap();
        assert_eq!(card.destroy_dumb(buf.handle).unwrap_err().errno(), libc::EINVAL);
    }
}
