//! Operating system services used by an erase session
//!
//! The session only needs four things from the host: pin a memory region,
//! unpin it, tell whether a path is a block device, and report a device's
//! size. They are gathered behind the [`Platform`] trait so tests can record
//! or refuse calls, and so hosts without `mlock` still build.

#![allow(unsafe_code)]

use std::fs::{self, File};
use std::io::{self, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use crate::error::{ErrorCategory, ErrorKind, Result, ShredError};
use crate::memguard::Region;

/// Host services consumed by a session.
pub trait Platform {
    /// Asks the OS to keep `region` resident in RAM.
    fn lock(&self, region: Region) -> Result<()>;

    /// Undoes a successful [`Platform::lock`].
    fn unlock(&self, region: Region) -> Result<()>;

    /// Byte length of the device at `path`.
    fn device_size(&self, path: &Path) -> Result<u64>;

    /// Whether `path` names a block device.
    fn is_block_device(&self, path: &Path) -> Result<bool>;
}

/// The real operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPlatform;

/// Returns the platform implementation for the running host.
pub fn system() -> Arc<dyn Platform> {
    Arc::new(SystemPlatform)
}

impl Platform for SystemPlatform {
    #[cfg(unix)]
    fn lock(&self, region: Region) -> Result<()> {
        // SAFETY: mlock only changes residency of the pages covering the
        // range; it neither reads nor writes through the pointer.
        let rc = unsafe { libc::mlock(region.as_ptr().cast::<libc::c_void>(), region.len()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(pin_error("mlock failed", io::Error::last_os_error()))
        }
    }

    #[cfg(unix)]
    fn unlock(&self, region: Region) -> Result<()> {
        // SAFETY: see `lock`.
        let rc = unsafe { libc::munlock(region.as_ptr().cast::<libc::c_void>(), region.len()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(pin_error("munlock failed", io::Error::last_os_error()))
        }
    }

    #[cfg(not(unix))]
    fn lock(&self, _region: Region) -> Result<()> {
        Err(ShredError::with_kind(
            ErrorCategory::Internal,
            ErrorKind::PlatformPin,
            "memory locking is not supported on this platform",
        ))
    }

    #[cfg(not(unix))]
    fn unlock(&self, _region: Region) -> Result<()> {
        Ok(())
    }

    fn device_size(&self, path: &Path) -> Result<u64> {
        let mut device = File::open(path).map_err(|e| {
            ShredError::with_kind_and_source(
                ErrorCategory::User,
                ErrorKind::Validation,
                format!("failed to open {}", path.display()),
                e,
            )
        })?;
        device.seek(SeekFrom::End(0)).map_err(|e| {
            ShredError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::Io,
                format!("failed to determine size of {}", path.display()),
                e,
            )
        })
    }

    #[cfg(unix)]
    fn is_block_device(&self, path: &Path) -> Result<bool> {
        use std::os::unix::fs::FileTypeExt;

        Ok(stat(path)?.file_type().is_block_device())
    }

    #[cfg(not(unix))]
    fn is_block_device(&self, path: &Path) -> Result<bool> {
        stat(path)?;
        Ok(false)
    }
}

fn stat(path: &Path) -> Result<fs::Metadata> {
    fs::metadata(path).map_err(|e| {
        let category = if e.kind() == io::ErrorKind::NotFound {
            ErrorCategory::User
        } else {
            ErrorCategory::Internal
        };
        ShredError::with_kind_and_source(
            category,
            ErrorKind::Validation,
            format!("cannot access {}", path.display()),
            e,
        )
    })
}

#[cfg(unix)]
fn pin_error(msg: &str, err: io::Error) -> ShredError {
    ShredError::with_kind_and_source(ErrorCategory::Internal, ErrorKind::PlatformPin, msg, err)
}
