//! Decoding raw ioctl requests into typed operations
//!
//! Every supported request code maps to exactly one [`Request`] variant that
//! borrows the caller's argument structure. Anything else is rejected here,
//! before the device state is touched.

use crate::abi::*;
use crate::{Error, Result};
use std::ffi::{c_ulong, c_void};

#[derive(Debug)]
pub enum Request<'a> {
    Version(&'a mut DrmVersion),
    GetCap(&'a mut DrmGetCap),
    SetClientCap(&'a mut DrmSetClientCap),
    SetMaster,
    DropMaster,
    GemClose(&'a mut DrmGemClose),
    GemFlink(&'a mut DrmGemFlink),
    GemOpen(&'a mut DrmGemOpen),
    GetResources(&'a mut DrmModeCardRes),
    GetCrtc(&'a mut DrmModeCrtc),
    SetCrtc(&'a mut DrmModeCrtc),
    Cursor(&'a mut DrmModeCursor),
    GetEncoder(&'a mut DrmModeGetEncoder),
    GetConnector(&'a mut DrmModeGetConnector),
    GetProperty(&'a mut DrmModeGetProperty),
    GetPropBlob(&'a mut DrmModeGetBlob),
    GetFb(&'a mut DrmModeFbCmd),
    AddFb(&'a mut DrmModeFbCmd),
    AddFb2(&'a mut DrmModeFbCmd2),
    RmFb(&'a mut u32),
    PageFlip(&'a mut DrmModeCrtcPageFlip),
    CreateDumb(&'a mut DrmModeCreateDumb),
    MapDumb(&'a mut DrmModeMapDumb),
    DestroyDumb(&'a mut DrmModeDestroyDumb),
    GetPlaneResources(&'a mut DrmModeGetPlaneRes),
    GetPlane(&'a mut DrmModeGetPlane),
    SetPlane(&'a mut DrmModeSetPlane),
    ObjGetProperties(&'a mut DrmModeObjGetProperties),
    ObjSetProperty(&'a mut DrmModeObjSetProperty),
    Atomic(&'a mut DrmModeAtomic),
    CreatePropBlob(&'a mut DrmModeCreateBlob),
    DestroyPropBlob(&'a mut DrmModeDestroyBlob),
}

unsafe fn arg<'a, T>(ptr: *mut c_void) -> Result<&'a mut T> {
    (ptr as *mut T)
        .as_mut()
        .ok_or_else(|| Error::invalid("null ioctl argument"))
}

impl<'a> Request<'a> {
    /// Interpret `arg` according to `cmd`.
    ///
    /// # Safety
    /// A non-null `arg` must point to a live, writable structure of the type
    /// the request code encodes, valid for `'a`.
    pub unsafe fn decode(cmd: c_ulong, ptr: *mut c_void) -> Result<Self> {
        Ok(match cmd {
            DRM_IOCTL_SET_MASTER => Request::SetMaster,
            DRM_IOCTL_DROP_MASTER => Request::DropMaster,
            DRM_IOCTL_VERSION => Request::Version(arg(ptr)?),
            DRM_IOCTL_GET_CAP => Request::GetCap(arg(ptr)?),
            DRM_IOCTL_SET_CLIENT_CAP => Request::SetClientCap(arg(ptr)?),
            DRM_IOCTL_GEM_CLOSE => Request::GemClose(arg(ptr)?),
            DRM_IOCTL_GEM_FLINK => Request::GemFlink(arg(ptr)?),
            DRM_IOCTL_GEM_OPEN => Request::GemOpen(arg(ptr)?),
            DRM_IOCTL_MODE_GETRESOURCES => Request::GetResources(arg(ptr)?),
            DRM_IOCTL_MODE_GETCRTC => Request::GetCrtc(arg(ptr)?),
            DRM_IOCTL_MODE_SETCRTC => Request::SetCrtc(arg(ptr)?),
            DRM_IOCTL_MODE_CURSOR => Request::Cursor(arg(ptr)?),
            DRM_IOCTL_MODE_GETENCODER => Request::GetEncoder(arg(ptr)?),
            DRM_IOCTL_MODE_GETCONNECTOR => Request::GetConnector(arg(ptr)?),
            DRM_IOCTL_MODE_GETPROPERTY => Request::GetProperty(arg(ptr)?),
            DRM_IOCTL_MODE_GETPROPBLOB => Request::GetPropBlob(arg(ptr)?),
            DRM_IOCTL_MODE_GETFB => Request::GetFb(arg(ptr)?),
            DRM_IOCTL_MODE_ADDFB => Request::AddFb(arg(ptr)?),
            DRM_IOCTL_MODE_ADDFB2 => Request::AddFb2(arg(ptr)?),
            DRM_IOCTL_MODE_RMFB => Request::RmFb(arg(ptr)?),
            DRM_IOCTL_MODE_PAGE_FLIP => Request::PageFlip(arg(ptr)?),
            DRM_IOCTL_MODE_CREATE_DUMB => Request::CreateDumb(arg(ptr)?),
            DRM_IOCTL_MODE_MAP_DUMB => Request::MapDumb(arg(ptr)?),
            DRM_IOCTL_MODE_DESTROY_DUMB => Request::DestroyDumb(arg(ptr)?),
            DRM_IOCTL_MODE_GETPLANERESOURCES => Request::GetPlaneResources(arg(ptr)?),
            DRM_IOCTL_MODE_GETPLANE => Request::GetPlane(arg(ptr)?),
            DRM_IOCTL_MODE_SETPLANE => Request::SetPlane(arg(ptr)?),
            DRM_IOCTL_MODE_OBJ_GETPROPERTIES => Request::ObjGetProperties(arg(ptr)?),
            DRM_IOCTL_MODE_OBJ_SETPROPERTY => Request::ObjSetProperty(arg(ptr)?),
            DRM_IOCTL_MODE_ATOMIC => Request::Atomic(arg(ptr)?),
            DRM_IOCTL_MODE_CREATEPROPBLOB => Request::CreatePropBlob(arg(ptr)?),
            DRM_IOCTL_MODE_DESTROYPROPBLOB => Request::DestroyPropBlob(arg(ptr)?),
            other => return Err(Error::Unsupported(other as u64)),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::Version(_) => "VERSION",
            Request::GetCap(_) => "GET_CAP",
            Request::SetClientCap(_) => "SET_CLIENT_CAP",
            Request::SetMaster => "SET_MASTER",
            Request::DropMaster => "DROP_MASTER",
            Request::GemClose(_) => "GEM_CLOSE",
            Request::GemFlink(_) => "GEM_FLINK",
            Request::GemOpen(_) => "GEM_OPEN",
            Request::GetResources(_) => "MODE_GETRESOURCES",
            Request::GetCrtc(_) => "MODE_GETCRTC",
            Request::SetCrtc(_) => "MODE_SETCRTC",
            Request::Cursor(_) => "MODE_CURSOR",
            Request::GetEncoder(_) => "MODE_GETENCODER",
            Request::GetConnector(_) => "MODE_GETCONNECTOR",
            Request::GetProperty(_) => "MODE_GETPROPERTY",
            Request::GetPropBlob(_) => "MODE_GETPROPBLOB",
            Request::GetFb(_) => "MODE_GETFB",
            Request::AddFb(_) => "MODE_ADDFB",
            Request::AddFb2(_) => "MODE_ADDFB2",
            Request::RmFb(_) => "MODE_RMFB",
            Request::PageFlip(_) => "MODE_PAGE_FLIP",
            Request::CreateDumb(_) => "MODE_CREATE_DUMB",
            Request::MapDumb(_) => "MODE_MAP_DUMB",
            Request::DestroyDumb(_) => "MODE_DESTROY_DUMB",
            Request::GetPlaneResources(_) => "MODE_GETPLANERESOURCES",
            Request::GetPlane(_) => "MODE_GETPLANE",
            Request::SetPlane(_) => "MODE_SETPLANE",
            Request::ObjGetProperties(_) => "MODE_OBJ_GETPROPERTIES",
            Request::ObjSetProperty(_) => "MODE_OBJ_SETPROPERTY",
            Request::Atomic(_) => "MODE_ATOMIC",
            Request::CreatePropBlob(_) => "MODE_CREATEPROPBLOB",
            Request::DestroyPropBlob(_) => "MODE_DESTROYPROPBLOB",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_known_request() {
        let mut create = DrmModeCreateDumb {
            width: 64,
            height: 64,
            bpp: 32,
            ..Default::default()
        };
        let req = unsafe {
            Request::decode(DRM_IOCTL_MODE_CREATE_DUMB, &mut create as *mut _ as *mut c_void).unwrap()
        };
        assert_eq!(req.name(), "MODE_CREATE_DUMB");
        match req {
            Request::CreateDumb(c) => assert_eq!(c.width, 64),
            other => panic!("decoded as {}", other.name()),
        }
    }

    #[test]
    fn test_decode_rejects_unknown_and_null() {
        let err = unsafe { Request::decode(0xc0ff_64ff, std::ptr::null_mut()) }.unwrap_err();
        assert!(matches!(err, Error::Unsupported(0xc0ff_64ff)));

        let err = unsafe { Request::decode(DRM_IOCTL_MODE_MAP_DUMB, std::ptr::null_mut()) }.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        assert!(matches!(
            unsafe { Request::decode(DRM_IOCTL_SET_MASTER, std::ptr::null_mut()) },
            Ok(Request::SetMaster)
        ));
    }
}
