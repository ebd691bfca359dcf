//! Userspace DRM/KMS device backed by a platform window surface
//!
//! This library pretends to be `/dev/dri/card0` for programs that only know
//! how to drive a kernel display device. Loaded with `LD_PRELOAD` (feature
//! `preload`), it answers their KMS requests itself and, on every page flip,
//! copies the flipped dumb buffers into one window surface. A window manager
//! can place, stack and destroy the resulting windows through a small C API.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │        Compositor / toolkit using dumb buffers + KMS        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                open / ioctl / mmap / read / close
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     drm-surface-shim                        │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐ │
//! │  │ Interceptor │→ │   Device    │→ │ Compositor (blit)   │ │
//! │  │ (fd routing)│  │ (registry)  │  │ z-ordered windows   │ │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘ │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                     lock / unlock-and-post
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │       Window surface (ANativeWindow, or in-memory)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use drm_surface_shim::abi::fourcc;
//! use drm_surface_shim::registry::CRTC_ID;
//! use drm_surface_shim::{Card, Device, ShimConfig};
//!
//! let device = Device::new(ShimConfig::from_env());
//! let card = Card::new(&device);
//! let buffer = card.create_dumb(640, 480, 32)?;
//! let fb = card.add_framebuffer(buffer.handle, 640, 480, fourcc::XRGB8888, buffer.pitch)?;
//! card.page_flip(CRTC_ID, fb, 0, 0)?;
//! ```

pub mod abi;
pub mod allocator;
pub mod client;
pub mod compositor;
pub mod config;
pub mod device;
pub mod error;
pub mod interceptor;
pub mod logging;
pub mod registry;
pub mod request;
pub mod surface;

#[cfg(all(feature = "preload", not(test)))]
mod preload;

pub use client::{AtomicRequest, Card};
pub use config::ShimConfig;
pub use device::Device;
pub use error::Error;
pub use interceptor::{Interceptor, SyscallBackend};

/// Result type for this crate
pub type Result<T> = std::result::Result<T, Error>;
