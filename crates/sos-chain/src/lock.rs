//! Advisory file locks guarding single-writer chains.

use std::fs::{File, OpenOptions};
use std::path::Path;

use fs2::FileExt;

use crate::ChainError;

/// Exclusive advisory lock held for the lifetime of the guard.
///
/// Writers call [`FileLock::acquire_blocking`]; the pressure-state writer in
/// the governor is the sole user of [`FileLock::try_acquire`] and skips its
/// write when the lock is contended.
#[derive(Debug)]
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Block until the lock at `path` is held.
    pub fn acquire_blocking(path: &Path) -> Result<Self, ChainError> {
        let file = Self::open(path)?;
        file.lock_exclusive().map_err(ChainError::Io)?;
        Ok(Self { file })
    }

    /// Attempt the lock without blocking; `None` when another writer holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, ChainError> {
        let file = Self::open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file })),
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(err) => Err(ChainError::Io(err)),
        }
    }

    fn open(path: &Path) -> Result<File, ChainError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ChainError::Io)?;
        }
        OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(ChainError::Io)
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_acquire_reports_contention() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join(".lock");
        let held = FileLock::acquire_blocking(&lock_path).unwrap();
        let second = FileLock::try_acquire(&lock_path).unwrap();
        assert!(second.is_none());
        drop(held);
        let third = FileLock::try_acquire(&lock_path).unwrap();
        assert!(third.is_some());
    }
}
