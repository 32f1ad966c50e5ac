//! Advisory library lock
//!
//! A single `.library.lock` file containing the holder's pid guards a data
//! directory against concurrent runs. The lock is advisory: it excludes
//! well-behaved icsync processes, nothing else.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use icsync_core::domain::errors::{AppError, LibraryError, LibraryWarning};
use icsync_core::events::EventSink;

/// Name of the lock file inside the data directory.
pub const LOCK_FILE: &str = ".library.lock";

/// Held process lock on a data directory.
///
/// Acquired before any library mutation and released on every exit path,
/// including interrupts.
#[derive(Debug)]
pub struct LibraryLock {
    path: PathBuf,
    pid: u32,
}

impl LibraryLock {
    /// Acquires the lock for the current process.
    ///
    /// An existing lock naming another live pid fails with
    /// [`LibraryError::Locked`] unless `force` is set. A lock naming a dead
    /// pid is overwritten with a [`LibraryWarning::StaleLock`].
    pub fn acquire(data_dir: &Path, force: bool, events: &EventSink) -> Result<Self, AppError> {
        let path = data_dir.join(LOCK_FILE);
        let pid = std::process::id();

        if let Some(holder) = read_lock_pid(&path) {
            if holder != pid {
                if force {
                    info!(holder, "Overriding existing library lock (--force)");
                } else if process_alive(holder) {
                    return Err(AppError::new(LibraryError::Locked(holder))
                        .with_context("lock_path", path.display().to_string()));
                } else {
                    events.warn(&AppError::new(LibraryWarning::StaleLock(holder)));
                    warn!(holder, "Removing lock left behind by dead process");
                }
            }
        }

        std::fs::create_dir_all(data_dir).map_err(|e| {
            AppError::new(LibraryError::InvalidState(format!(
                "cannot create data dir {}",
                data_dir.display()
            )))
            .with_cause(e)
        })?;
        std::fs::write(&path, pid.to_string()).map_err(|e| {
            AppError::new(LibraryError::InvalidState(format!(
                "cannot write lock file {}",
                path.display()
            )))
            .with_cause(e)
        })?;

        debug!(pid, path = %path.display(), "Library lock acquired");
        Ok(Self { path, pid })
    }

    /// Releases the lock.
    ///
    /// Fails with [`LibraryError::NoLock`] when the file is already gone and
    /// with [`LibraryError::ForeignLock`] when another pid took it over,
    /// unless `force` is set.
    pub fn release(self, force: bool) -> Result<(), AppError> {
        match read_lock_pid(&self.path) {
            None => {
                if force {
                    return Ok(());
                }
                Err(AppError::new(LibraryError::NoLock)
                    .with_context("lock_path", self.path.display().to_string()))
            }
            Some(holder) if holder != self.pid && !force => {
                Err(AppError::new(LibraryError::ForeignLock(holder)))
            }
            Some(_) => {
                std::fs::remove_file(&self.path).map_err(|e| {
                    AppError::new(LibraryError::InvalidState(format!(
                        "cannot remove lock file {}",
                        self.path.display()
                    )))
                    .with_cause(e)
                })?;
                debug!(pid = self.pid, "Library lock released");
                Ok(())
            }
        }
    }

    /// The pid recorded in this lock.
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

/// Reads the pid from an existing lock file; `None` when absent or garbled.
fn read_lock_pid(path: &Path) -> Option<u32> {
    let content = std::fs::read_to_string(path).ok()?;
    content.trim().parse().ok()
}

/// Whether a pid names a live process (procfs probe).
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use icsync_core::domain::errors::ErrorKind;

    #[test]
    fn test_acquire_writes_own_pid() {
        let dir = tempfile::tempdir().unwrap();
        let lock = LibraryLock::acquire(dir.path(), false, &EventSink::disconnected()).unwrap();

        let content = std::fs::read_to_string(dir.path().join(LOCK_FILE)).unwrap();
        assert_eq!(content, std::process::id().to_string());
        lock.release(false).unwrap();
        assert!(!dir.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn test_acquire_fails_when_held_by_live_pid() {
        let dir = tempfile::tempdir().unwrap();
        // pid 1 is always alive
        std::fs::write(dir.path().join(LOCK_FILE), "1").unwrap();

        let err =
            LibraryLock::acquire(dir.path(), false, &EventSink::disconnected()).unwrap_err();
        assert!(matches!(
            err.kind,
            ErrorKind::Library(LibraryError::Locked(1))
        ));
        assert_eq!(err.to_string(), "Locked by PID 1");

        // Lock file untouched
        let content = std::fs::read_to_string(dir.path().join(LOCK_FILE)).unwrap();
        assert_eq!(content, "1");
    }

    #[test]
    fn test_force_overrides_live_lock() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(LOCK_FILE), "1").unwrap();

        let lock = LibraryLock::acquire(dir.path(), true, &EventSink::disconnected()).unwrap();
        let content = std::fs::read_to_string(dir.path().join(LOCK_FILE)).unwrap();
        assert_eq!(content, lock.pid().to_string());
    }

    #[test]
    fn test_stale_lock_is_swept() {
        let dir = tempfile::tempdir().unwrap();
        // Pid from far beyond pid_max; certainly dead
        std::fs::write(dir.path().join(LOCK_FILE), "4194399").unwrap();

        let (events, mut rx) = EventSink::channel();
        let lock = LibraryLock::acquire(dir.path(), false, &events).unwrap();
        assert_eq!(lock.pid(), std::process::id());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_release_without_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let lock = LibraryLock::acquire(dir.path(), false, &EventSink::disconnected()).unwrap();
        std::fs::remove_file(dir.path().join(LOCK_FILE)).unwrap();

        let err = lock.release(false).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Library(LibraryError::NoLock)));
    }

    #[test]
    fn test_release_foreign_lock_requires_force() {
        let dir = tempfile::tempdir().unwrap();
        let lock = LibraryLock::acquire(dir.path(), false, &EventSink::disconnected()).unwrap();
        std::fs::write(dir.path().join(LOCK_FILE), "1").unwrap();

        let err = lock.release(false).unwrap_err();
        assert!(matches!(
            err.kind,
            ErrorKind::Library(LibraryError::ForeignLock(1))
        ));
    }
}
