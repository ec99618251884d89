//! Advisory file locks
//!
//! Two flavours:
//! - the per-tool install lock, taken once with `try_lock` so a second
//!   install of the same tool fails immediately instead of sharing a work dir;
//! - the state lock, retried until a bounded timeout so short read-modify-write
//!   cycles from other processes are waited out but a stuck peer is not.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

/// Poll interval while waiting for the state lock.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

fn open_lock_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

/// Try to take the install lock for one tool.
///
/// Returns `Ok(None)` when another process holds it. The lock file is never
/// removed: unlinking it would let a second process lock a fresh inode while
/// the first still holds the old one. A crashed holder's lock goes away with
/// its process, however old the file is.
pub fn try_install_lock(lock_path: &Path) -> io::Result<Option<InstallLock>> {
    let file = open_lock_file(lock_path)?;
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => Ok(Some(InstallLock { file })),
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
        Err(e) => Err(e),
    }
}

/// RAII guard for an install lock. Releases the lock when dropped.
#[derive(Debug)]
pub struct InstallLock {
    file: File,
}

impl Drop for InstallLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Lock mode for [`FileLock::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Failure to take a file lock within the allowed time.
#[derive(Debug)]
pub enum LockError {
    Timeout { waited: Duration },
    Io(io::Error),
}

/// Guard for a lock taken with a timeout. The lock file itself is left in
/// place; only the advisory lock is released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Take a lock on `path`, retrying until `timeout` elapses.
    pub fn acquire(path: &Path, mode: LockMode, timeout: Duration) -> Result<Self, LockError> {
        let file = open_lock_file(path).map_err(LockError::Io)?;

        let start = Instant::now();
        let mut logged = false;
        loop {
            let attempt = match mode {
                LockMode::Shared => FileExt::try_lock_shared(&file),
                LockMode::Exclusive => FileExt::try_lock_exclusive(&file),
            };
            match attempt {
                Ok(()) => return Ok(Self { file }),
                Err(e) if e.kind() != fs2::lock_contended_error().kind() => {
                    return Err(LockError::Io(e));
                }
                Err(_) => {}
            }

            let waited = start.elapsed();
            if waited >= timeout {
                return Err(LockError::Timeout { waited });
            }
            if !logged {
                tracing::debug!(path = %path.display(), ?mode, "waiting for file lock");
                logged = true;
            }
            std::thread::sleep(LOCK_RETRY_INTERVAL.min(timeout - waited));
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
