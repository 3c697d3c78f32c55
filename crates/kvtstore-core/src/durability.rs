//! Platform durable sync
//!
//! One function mapping to the strongest sync primitive each platform
//! offers. Callers must not hold latches that the sync could deadlock
//! against; the call may block for milliseconds on spinning media.

use std::fs::File;
use std::io;

/// Flush `file` to persistent storage before returning.
///
/// Linux uses fdatasync (data without metadata), macOS needs F_FULLFSYNC to
/// get past the drive's volatile cache, everything else falls back to the
/// stdlib's sync_data.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the fd comes from a live File borrow and stays open for
        // the duration of the call.
        if unsafe { libc::fdatasync(file.as_raw_fd()) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the fd comes from a live File borrow and stays open for
        // the duration of the call.
        if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios")))]
    {
        file.sync_data()
    }
}
