//! Advisory locking of the index's backing file.
//!
//! A session holds an exclusive advisory lock on the volume file for its
//! whole lifetime, so two processes cannot service the same index. The
//! lock is taken non-blocking: a second opener fails immediately with
//! [`Error::Busy`] rather than waiting for the first to exit.

use std::fs::File;
use std::io;
use std::sync::Arc;

use crate::error::{Error, Result};

/// An exclusive advisory lock on the backing file, released on drop.
pub struct VolumeLock {
    file: Arc<File>,
}

impl VolumeLock {
    pub fn acquire(file: Arc<File>) -> Result<Self> {
        match try_lock(&file) {
            Ok(()) => Ok(VolumeLock { file }),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(Error::Busy),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for VolumeLock {
    fn drop(&mut self) {
        let _ = unlock(&self.file);
    }
}

#[cfg(unix)]
fn try_lock(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(unix)]
fn unlock(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
fn try_lock(file: &File) -> io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    use winapi::um::fileapi::LockFileEx;
    use winapi::um::winnt::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};

    let mut overlapped: winapi::um::minwinbase::OVERLAPPED = unsafe { std::mem::zeroed() };
    let result = unsafe {
        LockFileEx(
            file.as_raw_handle() as *mut _,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            !0,
            !0,
            &mut overlapped,
        )
    };
    if result == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
fn unlock(file: &File) -> io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    use winapi::um::fileapi::UnlockFile;

    let result = unsafe { UnlockFile(file.as_raw_handle() as *mut _, 0, 0, !0, !0) };
    if result == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn try_lock(_file: &File) -> io::Result<()> {
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn unlock(_file: &File) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    #[test]
    fn test_lock_and_release() {
        let file = Arc::new(tempfile().unwrap());
        let lock = VolumeLock::acquire(file.clone()).unwrap();
        drop(lock);
        // Relockable after release.
        let _lock = VolumeLock::acquire(file).unwrap();
    }
}
