//! Cross-process mutual exclusion over cache entries.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use self::sys::*;

/// An exclusive file system lock.
///
/// The lock is tied to a lock file created beside the resource it guards and
/// is released when the value is dropped. Two holders of a lock on the same
/// path never run concurrently, whether they live in the same process or in
/// different ones.
#[derive(Debug)]
pub struct FileLock {
    f: Option<File>,
    path: PathBuf,
}

impl FileLock {
    /// Opens exclusive access to the lock file at `path`, blocking until the
    /// lock can be acquired.
    ///
    /// The lock file (including intermediate directories) is created if it
    /// does not already exist. Failure to create it is an error; the caller
    /// never proceeds unlocked, except on file systems that do not support
    /// locking at all.
    pub fn open_rw(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true);

        let f = opts
            .open(&path)
            .or_else(|e| {
                // A missing intermediate directory surfaces as NotFound.
                if e.kind() == io::ErrorKind::NotFound {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    opts.open(&path)
                } else {
                    Err(e)
                }
            })
            .with_context(|| format!("failed to open `{path}`", path = path.display()))?;

        match try_lock_exclusive(&f) {
            Ok(()) => {}
            // Some file systems (notably network mounts) report that locking
            // is unsupported; there is nothing useful to wait on there.
            Err(e) if error_unsupported(&e) => {}
            Err(e) if error_contended(&e) => {
                tracing::debug!("waiting for file lock on `{path}`", path = path.display());
                lock_exclusive(&f).with_context(|| {
                    format!("failed to lock file `{path}`", path = path.display())
                })?;
            }
            Err(e) => {
                return Err(anyhow::Error::from(e).context(format!(
                    "failed to lock file `{path}`",
                    path = path.display()
                )));
            }
        }

        Ok(Self { f: Some(f), path })
    }

    /// Returns the path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            let _ = unlock(&f);
        }
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".lock");
    PathBuf::from(os)
}

/// Runs `fut` while holding the exclusive lock for `path`.
///
/// The lock is taken on a sibling `{path}.lock` file so the guarded path
/// itself can be freely created, replaced, and deleted while locked.
/// Acquisition happens on a blocking thread; the lock is released on every
/// exit path, including when the returned future is dropped mid-flight.
pub async fn with_file_lock<T, Fut>(path: &Path, fut: Fut) -> crate::Result<T>
where
    Fut: Future<Output = crate::Result<T>>,
{
    let lock_file = lock_path(path);
    let lock = tokio::task::spawn_blocking(move || FileLock::open_rw(lock_file))
        .await
        .map_err(|e| crate::Error::Other(anyhow::Error::from(e)))??;

    let result = fut.await;
    drop(lock);
    result
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io::{Error, Result};
    use std::os::unix::io::AsRawFd;

    pub(super) fn lock_exclusive(file: &File) -> Result<()> {
        flock(file, libc::LOCK_EX)
    }

    pub(super) fn try_lock_exclusive(file: &File) -> Result<()> {
        flock(file, libc::LOCK_EX | libc::LOCK_NB)
    }

    pub(super) fn unlock(file: &File) -> Result<()> {
        flock(file, libc::LOCK_UN)
    }

    pub(super) fn error_contended(err: &Error) -> bool {
        err.raw_os_error().map_or(false, |x| x == libc::EWOULDBLOCK)
    }

    pub(super) fn error_unsupported(err: &Error) -> bool {
        match err.raw_os_error() {
            #[allow(unreachable_patterns)]
            Some(libc::ENOTSUP | libc::EOPNOTSUPP) => true,
            Some(libc::ENOSYS) => true,
            _ => false,
        }
    }

    fn flock(file: &File, flag: libc::c_int) -> Result<()> {
        let ret = unsafe { libc::flock(file.as_raw_fd(), flag) };
        if ret < 0 {
            Err(Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

#[cfg(windows)]
mod sys {
    use std::fs::File;
    use std::io::{Error, Result};
    use std::mem;
    use std::os::windows::io::AsRawHandle;

    use windows_sys::Win32::Foundation::HANDLE;
    use windows_sys::Win32::Foundation::{ERROR_INVALID_FUNCTION, ERROR_LOCK_VIOLATION};
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, UnlockFile, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };

    pub(super) fn lock_exclusive(file: &File) -> Result<()> {
        lock_file(file, LOCKFILE_EXCLUSIVE_LOCK)
    }

    pub(super) fn try_lock_exclusive(file: &File) -> Result<()> {
        lock_file(file, LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY)
    }

    pub(super) fn unlock(file: &File) -> Result<()> {
        unsafe {
            let ret = UnlockFile(file.as_raw_handle() as HANDLE, 0, 0, !0, !0);
            if ret == 0 {
                Err(Error::last_os_error())
            } else {
                Ok(())
            }
        }
    }

    pub(super) fn error_contended(err: &Error) -> bool {
        err.raw_os_error()
            .map_or(false, |x| x == ERROR_LOCK_VIOLATION as i32)
    }

    pub(super) fn error_unsupported(err: &Error) -> bool {
        err.raw_os_error()
            .map_or(false, |x| x == ERROR_INVALID_FUNCTION as i32)
    }

    fn lock_file(file: &File, flags: u32) -> Result<()> {
        unsafe {
            let mut overlapped = mem::zeroed();
            let ret = LockFileEx(
                file.as_raw_handle() as HANDLE,
                flags,
                0,
                !0,
                !0,
                &mut overlapped,
            );
            if ret == 0 {
                Err(Error::last_os_error())
            } else {
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c.lock");
        let lock = FileLock::open_rw(&path).unwrap();
        assert!(path.is_file());
        assert_eq!(lock.path(), path);
    }

    #[tokio::test]
    async fn lock_serializes_same_path() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let path = Arc::new(dir.path().join("entry.dat"));
        let active = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let path = path.clone();
            let active = active.clone();
            tasks.push(tokio::spawn(async move {
                with_file_lock(&path, async {
                    let now = active.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(now, 0, "two holders entered the critical section");
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }

        for task in tasks {
            task.await.unwrap().unwrap();
        }
    }
}
