//! Platform-specific durable sync for row files, temp files and their directories
//!
//! Used by the file storage layer after appends and after a temp file has been
//! swapped into place, when `Config::durable_writes` is set.

use std::fs::File;
use std::io;
use std::path::Path;

/// Ensures data is durably written to persistent storage before returning.
///
/// Platform behaviors:
/// - Linux: fdatasync()
/// - macOS/iOS: fcntl(F_FULLFSYNC)
/// - Windows: FlushFileBuffers()
/// - Other: file.sync_data()
///
/// The caller must not hold an in-memory lock that other threads need while
/// this blocks; per-file keyed locks are fine.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fd comes from a live File borrowed for the duration of the call.
        let result = unsafe { libc::fdatasync(fd) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        // Plain fsync() on Apple platforms stops at the drive cache.
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fd comes from a live File borrowed for the duration of the call.
        let result = unsafe { libc::fcntl(fd, libc::F_FULLFSYNC) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        let handle = file.as_raw_handle();
        // SAFETY: handle comes from a live File borrowed for the duration of the call.
        let result = unsafe { FlushFileBuffers(handle as *mut _) };
        if result != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios", target_os = "windows")))]
    {
        file.sync_data()
    }
}

/// Persist a rename or unlink inside `dir`.
///
/// On Windows directories cannot be opened as files; the rename is already
/// durable once MoveFileEx returns, so this is a no-op there.
pub fn sync_directory(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let handle = File::open(dir)?;
        durable_sync(&handle)
    }

    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_durable_sync_success() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"row bytes").unwrap();

        let result = durable_sync(file.as_file());
        assert!(result.is_ok(), "durable_sync failed: {:?}", result.err());
    }

    #[test]
    fn test_sync_directory_success() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(sync_directory(dir.path()).is_ok());
    }
}
