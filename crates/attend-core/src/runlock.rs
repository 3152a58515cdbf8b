//! Advisory lock file marking an active re-embedding run.
//!
//! A run holds `flock(LOCK_EX)` on the file for its whole life, so separate
//! processes sharing one data directory see each other's runs. The kernel
//! drops the lock when the holder exits, whether it finished or crashed.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub struct RunLock {
    path: PathBuf,
}

/// Held lock; released when dropped.
#[derive(Debug)]
pub struct RunLockGuard {
    file: File,
}

impl RunLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the lock without blocking. `Ok(None)` if another holder has it.
    pub fn try_acquire(&self) -> io::Result<Option<RunLockGuard>> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;

        if !sys::try_lock(&file, sys::Mode::Exclusive)? {
            return Ok(None);
        }

        // Holder pid, for whoever inspects the file by hand.
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        tracing::debug!(path = %self.path.display(), "re-embedding lock taken");
        Ok(Some(RunLockGuard { file }))
    }

    /// Whether any holder, this process included, has the lock right now.
    pub fn is_held(&self) -> bool {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return false,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "cannot open re-embedding lock");
                return false;
            }
        };

        match sys::try_lock(&file, sys::Mode::Shared) {
            Ok(acquired) => !acquired,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "cannot inspect re-embedding lock");
                false
            }
        }
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        sys::unlock(&self.file);
    }
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    pub(super) enum Mode {
        Shared,
        Exclusive,
    }

    /// Non-blocking `flock`. `Ok(false)` when someone else holds a
    /// conflicting lock. A shared lock taken here goes away with `file`.
    pub(super) fn try_lock(file: &File, mode: Mode) -> io::Result<bool> {
        let op = match mode {
            Mode::Shared => libc::LOCK_SH,
            Mode::Exclusive => libc::LOCK_EX,
        };
        let result = unsafe { libc::flock(file.as_raw_fd(), op | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Ok(false)
        } else {
            Err(err)
        }
    }

    pub(super) fn unlock(file: &File) {
        unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    }
}

// Without flock only the in-process flag guards runs.
#[cfg(not(unix))]
mod sys {
    use std::fs::File;
    use std::io;

    pub(super) enum Mode {
        Shared,
        Exclusive,
    }

    pub(super) fn try_lock(_file: &File, mode: Mode) -> io::Result<bool> {
        Ok(matches!(mode, Mode::Exclusive))
    }

    pub(super) fn unlock(_file: &File) {}
}
