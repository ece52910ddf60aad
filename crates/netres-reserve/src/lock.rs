//! Cross-process advisory lock guarding the ledger.
//!
//! Uses `flock(2)` on a companion lock file, polled without blocking so the
//! wait can be bounded. When the wait times out the holder is presumed dead:
//! the lock file is deleted and acquisition is retried exactly once. A holder
//! that is merely slow loses its lock in that case.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::error::{ReserveError, Result};

/// Exclusive hold on the lock file. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    /// Release the lock now instead of at drop.
    pub fn release(self) -> Result<()> {
        // SAFETY: the descriptor is owned by `self.file` and open for the call.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        tracing::debug!(path = %self.path.display(), "Lock released");
        Ok(())
    }
}

/// Take the lock, breaking it once if the wait exceeds `timeout`.
pub async fn acquire(path: &Path, timeout: Duration, poll: Duration) -> Result<LockGuard> {
    match try_acquire(path, timeout, poll).await {
        Err(ReserveError::LockTimeout { .. }) => {
            tracing::warn!(
                path = %path.display(),
                timeout_secs = timeout.as_secs_f64(),
                "Lock holder presumed dead, breaking stale lock"
            );
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            try_acquire(path, timeout, poll).await
        }
        other => other,
    }
}

/// Take the lock, giving up with [`ReserveError::LockTimeout`] after `timeout`.
pub async fn try_acquire(path: &Path, timeout: Duration, poll: Duration) -> Result<LockGuard> {
    let deadline = Instant::now() + timeout;

    loop {
        let file = open_lock_file(path)?;

        loop {
            if try_flock(&file)? {
                if same_file(&file, path)? {
                    tracing::debug!(path = %path.display(), "Lock acquired");
                    return Ok(LockGuard {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                // The file was unlinked while we waited on it; locking the
                // orphaned inode would not exclude anyone. Reopen.
                break;
            }

            if Instant::now() >= deadline {
                return Err(ReserveError::LockTimeout {
                    path: path.to_path_buf(),
                    waited_secs: timeout.as_secs(),
                });
            }
            sleep(poll).await;
        }
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

/// Non-blocking exclusive `flock`. `Ok(false)` means someone else holds it.
fn try_flock(file: &File) -> io::Result<bool> {
    // SAFETY: the descriptor is owned by `file` and open for the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => Ok(false),
        _ => Err(err),
    }
}

/// Whether `path` still names the inode behind `file`.
fn same_file(file: &File, path: &Path) -> io::Result<bool> {
    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(current.dev() == held.dev() && current.ino() == held.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
