//! Free-space and writability checks run before an apply mutates anything.

use std::path::Path;

use crate::error::{Error, Result};
use crate::ops::Patch;

/// Free space probe for the filesystem holding a path.
pub trait DiskSpace {
    fn available_kib(&self, path: &Path) -> Result<u64>;
}

/// Asks the operating system via `statvfs(3)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsSpace;

#[cfg(unix)]
fn c_path(path: &Path) -> Result<std::ffi::CString> {
    use std::os::unix::ffi::OsStrExt;
    std::ffi::CString::new(path.as_os_str().as_bytes()).map_err(|e| {
        Error::io(path, std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
    })
}

#[cfg(unix)]
impl DiskSpace for StatvfsSpace {
    fn available_kib(&self, path: &Path) -> Result<u64> {
        let cpath = c_path(path)?;
        // SAFETY: cpath is NUL-terminated and outlives the call; stat is a
        // plain C struct that statvfs fully initializes on success.
        let stat = unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(cpath.as_ptr(), &mut stat) != 0 {
                return Err(Error::io(path, std::io::Error::last_os_error()));
            }
            stat
        };
        #[allow(clippy::unnecessary_cast)]
        let bytes = (stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64);
        Ok(bytes / 1024)
    }
}

#[cfg(not(unix))]
impl DiskSpace for StatvfsSpace {
    fn available_kib(&self, _path: &Path) -> Result<u64> {
        Ok(u64::MAX)
    }
}

/// A fixed answer, for dry runs and tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedSpace(pub u64);

impl DiskSpace for FixedSpace {
    fn available_kib(&self, _path: &Path) -> Result<u64> {
        Ok(self.0)
    }
}

/// Fail with `NotWritable` unless the current user may create entries in `dir`.
#[cfg(unix)]
pub fn check_writable(dir: &Path) -> Result<()> {
    let cpath = c_path(dir)?;
    // SAFETY: cpath is a valid NUL-terminated string for the duration of the call.
    let rc = unsafe { libc::access(cpath.as_ptr(), libc::W_OK | libc::X_OK) };
    if rc != 0 {
        return Err(Error::NotWritable(dir.to_path_buf()));
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn check_writable(dir: &Path) -> Result<()> {
    let meta = std::fs::metadata(dir).map_err(|e| Error::io(dir, e))?;
    if meta.permissions().readonly() {
        return Err(Error::NotWritable(dir.to_path_buf()));
    }
    Ok(())
}

/// Check the target root is a writable directory with room for the patch.
/// Returns the estimate in KiB, which also drives progress reporting.
pub fn precheck(target: &Path, patch: &Patch, probe: &dyn DiskSpace) -> Result<u64> {
    if !target.is_dir() {
        return Err(Error::NotADirectory(target.to_path_buf()));
    }
    check_writable(target)?;

    let needed_kib = patch.required_kib();
    let available_kib = probe.available_kib(target)?;
    log::debug!("space: need {needed_kib} KiB, {available_kib} KiB available");
    if needed_kib > available_kib {
        return Err(Error::InsufficientSpace {
            needed_kib,
            available_kib,
        });
    }
    Ok(needed_kib)
}
