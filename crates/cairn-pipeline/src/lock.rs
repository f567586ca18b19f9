//! Cross-process advisory file lock with a bounded wait.
//!
//! Used to serialize read-merge-write cycles on files with many writers
//! (the aggregate metadata document and the run status record). The lock is
//! released when the guard is dropped or the holding process exits.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use cairn_types::{CairnError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Held lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquire an exclusive lock on `path`, waiting at most `timeout`.
    ///
    /// The lock file is created if missing. Exceeding `timeout` yields
    /// [`CairnError::AggregationLockTimeout`]; callers must not retry.
    pub async fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let target = path.to_path_buf();
        let mut file = blocking(move || {
            OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(target)
        })
        .await??;

        let deadline = Instant::now() + timeout;
        loop {
            let (returned, locked) = blocking(move || {
                let locked = try_lock(&file);
                (file, locked)
            })
            .await?;
            file = returned;
            if locked? {
                tracing::debug!(path = %path.display(), "Lock acquired");
                return Ok(Self {
                    file,
                    path: path.to_path_buf(),
                });
            }
            if Instant::now() >= deadline {
                return Err(CairnError::AggregationLockTimeout {
                    path: path.display().to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Run a syscall-bound closure off the async worker threads.
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CairnError::Other(format!("lock task failed: {e}")))
}

impl Drop for FileLock {
    fn drop(&mut self) {
        unlock(&self.file);
    }
}

#[cfg(unix)]
fn try_lock(file: &File) -> Result<bool> {
    use std::os::unix::io::AsRawFd;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EWOULDBLOCK || code == libc::EINTR => Ok(false),
        _ => Err(err.into()),
    }
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;

    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

// TODO: use LockFileEx on Windows; until then non-unix targets get no
// cross-process exclusion.
#[cfg(not(unix))]
fn try_lock(_file: &File) -> Result<bool> {
    Ok(true)
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}
