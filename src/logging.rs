//! Tracing setup shared by the preload constructor and the smoke binary

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "DRM_SHIM_LOG";

/// Install a stderr subscriber unless the host process already has one.
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
