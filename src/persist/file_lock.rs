//! Exclusive lock on a registrar data directory.
//!
//! Only one registrar may own a directory at a time; a second open fails
//! fast instead of interleaving log appends. The holder writes its process
//! ID into the lock file so the refusal can name it.

use std::fs::{self, File, OpenOptions};
use std::io::{Error as IoError, ErrorKind, Result as IoResult, Seek, SeekFrom, Write};
use std::path::Path;

const LOCK_FILE: &str = ".lock";

/// Held for the lifetime of the registrar; released when dropped.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
}

impl FileLock {
    /// Non-blocking exclusive lock on `dir/.lock`.
    ///
    /// # Errors
    /// - `ErrorKind::WouldBlock` if another registrar holds it
    pub fn acquire(dir: &Path) -> IoResult<Self> {
        let path = dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if let Err(e) = try_lock(&file) {
            if e.kind() != ErrorKind::WouldBlock {
                return Err(e);
            }
            let holder = owner_pid(dir).map_or_else(|| "unknown process".to_string(), |pid| format!("pid {pid}"));
            return Err(IoError::new(
                ErrorKind::WouldBlock,
                format!("registrar directory {} is held by {holder}", dir.display()),
            ));
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file })
    }
}

/// Process ID recorded by the current (or last) holder of `dir`.
#[must_use]
pub fn owner_pid(dir: &Path) -> Option<u32> {
    fs::read_to_string(dir.join(LOCK_FILE)).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn try_lock(file: &File) -> IoResult<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor is valid and owned by `file` for the call.
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(());
    }
    let errno = IoError::last_os_error();
    if errno.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Err(IoError::new(ErrorKind::WouldBlock, errno));
    }
    Err(errno)
}

#[cfg(windows)]
fn try_lock(file: &File) -> IoResult<()> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::HANDLE;
    use windows_sys::Win32::Storage::FileSystem::{LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};
    use windows_sys::Win32::System::IO::OVERLAPPED;

    // SAFETY: the handle is valid and owned by `file`; a zeroed OVERLAPPED
    // is what LockFileEx expects for a synchronous call.
    let locked = unsafe {
        let mut overlapped = std::mem::zeroed::<OVERLAPPED>();
        LockFileEx(
            file.as_raw_handle() as HANDLE,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            1,
            0,
            &mut overlapped,
        )
    };
    if locked == 0 {
        return Err(IoError::new(ErrorKind::WouldBlock, IoError::last_os_error()));
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn try_lock(_file: &File) -> IoResult<()> {
    Err(IoError::new(ErrorKind::Unsupported, "file locking not supported on this platform"))
}
