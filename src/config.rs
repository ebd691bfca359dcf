//! Runtime configuration read from `DRM_SHIM_*` environment variables

use std::os::unix::io::RawFd;
use std::str::FromStr;
use tracing::warn;

pub const DEFAULT_SYNTHETIC_FD: RawFd = 1000;
pub const DEFAULT_HEAP_THRESHOLD: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct ShimConfig {
    /// Descriptor value handed out for the emulated device
    pub synthetic_fd: RawFd,
    /// Display size reported before a window surface is attached
    pub width: u32,
    pub height: u32,
    pub refresh_rate: u32,
    /// Allocations smaller than this come from the heap
    pub heap_threshold: usize,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            synthetic_fd: DEFAULT_SYNTHETIC_FD,
            width: 1080,
            height: 2340,
            refresh_rate: 60,
            heap_threshold: DEFAULT_HEAP_THRESHOLD,
        }
    }
}

impl ShimConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup; unset or malformed keys keep
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            synthetic_fd: parse_or(&lookup, "DRM_SHIM_FD", defaults.synthetic_fd),
            width: parse_or(&lookup, "DRM_SHIM_WIDTH", defaults.width),
            height: parse_or(&lookup, "DRM_SHIM_HEIGHT", defaults.height),
            refresh_rate: parse_or(&lookup, "DRM_SHIM_REFRESH", defaults.refresh_rate),
            heap_threshold: parse_or(&lookup, "DRM_SHIM_HEAP_THRESHOLD", defaults.heap_threshold),
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!("{}={:?} is not valid, using {}", key, raw, default);
                default
            }
        },
        None => default,
    }
}
