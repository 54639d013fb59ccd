//! Whole-process advisory exclusive lock, so two invocations never scan
//! or write the cache concurrently.

use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};

use crate::error::RunError;

pub struct Lock {
    file: std::fs::File,
    path: PathBuf,
}

impl Lock {
    /// Acquire an exclusive, non-blocking lock on `path`, creating the
    /// file if necessary. Returns [`RunError::LockHeld`] if another
    /// instance already holds it.
    pub fn acquire(path: &Path) -> Result<Self, RunError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .map_err(|source| RunError::Lock {
                path: path.to_path_buf(),
                source,
            })?;

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => Ok(Lock {
                file,
                path: path.to_path_buf(),
            }),
            Err(Errno::EWOULDBLOCK) => Err(RunError::LockHeld {
                path: path.to_path_buf(),
            }),
            Err(errno) => Err(RunError::Lock {
                path: path.to_path_buf(),
                source: std::io::Error::from(errno),
            }),
        }
    }

    /// Release the lock. Consuming `self` makes an accidental
    /// double-release (or forgetting to release before a long-running
    /// firewall call) a compile-time question rather than a runtime one.
    pub fn release(self) {
        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
        drop(self.file);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_first_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lockfile");
        let first = Lock::acquire(&path).unwrap();
        let err = Lock::acquire(&path).unwrap_err();
        assert!(matches!(err, RunError::LockHeld { .. }));
        first.release();
        // now it should be free again
        let second = Lock::acquire(&path).unwrap();
        second.release();
    }
}
