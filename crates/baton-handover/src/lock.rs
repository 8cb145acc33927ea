//! Exclusive lock file
//!
//! The lock is an `flock(LOCK_EX)` on `<state_dir>/baton.lock`. It belongs to
//! the open file description, not to the process, so passing the descriptor
//! to a successor passes the lock with it.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};

use baton_core::{kdebug, Subsystem};

#[derive(Debug)]
pub struct LockFile {
    file: File,
    path: PathBuf,
}

impl LockFile {
    /// Take the lock without blocking.
    ///
    /// Returns `Ok(None)` when another open file description holds it.
    pub fn try_acquire(path: &Path) -> io::Result<Option<LockFile>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                kdebug!(Subsystem::Handover, "lock {} is held elsewhere", path.display());
                return Ok(None);
            }
            return Err(err);
        }
        kdebug!(Subsystem::Handover, "lock {} acquired", path.display());
        Ok(Some(LockFile { file, path: path.to_path_buf() }))
    }

    /// Wrap a descriptor received from a predecessor; the lock comes with it
    pub fn from_inherited(fd: OwnedFd, path: &Path) -> LockFile {
        LockFile { file: File::from(fd), path: path.to_path_buf() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsFd for LockFile {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl AsRawFd for LockFile {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.file.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("baton.lock");

        let first = LockFile::try_acquire(&path).unwrap().unwrap();
        assert_eq!(first.path(), path.as_path());
        assert!(LockFile::try_acquire(&path).unwrap().is_none());

        drop(first);
        assert!(LockFile::try_acquire(&path).unwrap().is_some());
    }

    #[test]
    fn test_lock_travels_with_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("baton.lock");

        let first = LockFile::try_acquire(&path).unwrap().unwrap();
        let dup = first.as_fd().try_clone_to_owned().unwrap();
        drop(first);

        // The duplicate shares the open file description, so the lock is still held
        let inherited = LockFile::from_inherited(dup, &path);
        assert!(LockFile::try_acquire(&path).unwrap().is_none());
        drop(inherited);
        assert!(LockFile::try_acquire(&path).unwrap().is_some());
    }
}
