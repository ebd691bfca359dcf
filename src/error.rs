//! Error types for the DRM surface shim

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("unsupported request 0x{0:x}")]
    Unsupported(u64),

    #[error("window surface unavailable: {0}")]
    SurfaceUnavailable(String),

    #[error("buffer allocation failed: {0}")]
    Alloc(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn oom(msg: impl Into<String>) -> Self {
        Self::OutOfMemory(msg.into())
    }

    /// The errno a kernel driver would report for this failure.
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::OutOfMemory(_) | Error::Alloc(_) => libc::ENOMEM,
            Error::Unsupported(_) => libc::EOPNOTSUPP,
            Error::SurfaceUnavailable(_) => libc::EIO,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Negative status in the kernel ioctl convention (`-errno`).
    pub fn status(&self) -> i32 {
        -self.errno()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::invalid("x").status(), -libc::EINVAL);
        assert_eq!(Error::oom("x").status(), -libc::ENOMEM);
        assert_eq!(Error::Unsupported(0xdead).status(), -libc::EOPNOTSUPP);
        assert_eq!(Error::SurfaceUnavailable("gone".into()).status(), -libc::EIO);
    }

    #[test]
    fn test_io_error_keeps_os_code() {
        let err = Error::from(std::io::Error::from_raw_os_error(libc::EBADF));
        assert_eq!(err.errno(), libc::EBADF);
    }
}
