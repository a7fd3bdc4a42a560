//! Cross-process single-instance lock using advisory file locking (fs2 flock).
//!
//! Two monitors on one machine would race each other to the kill sequence,
//! so `watch` and `daemon start` hold this lock for as long as they poll.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::paths::Paths;

#[derive(Debug, Clone)]
pub struct InstanceLock {
    path: PathBuf,
}

/// RAII guard that releases the lock on drop.
pub struct InstanceLockGuard {
    file: File,
}

impl Drop for InstanceLockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl InstanceLock {
    /// Lock file in the runtime directory.
    pub fn new(paths: &Paths) -> Result<Self> {
        paths.ensure_runtime_dir()?;
        Ok(Self::at(paths.instance_lock()))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Non-blocking try-acquire; returns `None` if another process holds it.
    pub fn try_acquire(&self) -> Result<Option<InstanceLockGuard>> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open lock file {}", self.path.display()))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                // Holder's pid, for humans only.
                file.set_len(0)?;
                writeln!(file, "{}", std::process::id())?;
                Ok(Some(InstanceLockGuard { file }))
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            #[cfg(unix)]
            Err(ref e) if e.raw_os_error() == Some(35) || e.raw_os_error() == Some(11) => {
                // EAGAIN(11) / EWOULDBLOCK(35 on macOS)
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Acquire or fail with a message naming the lock file.
    pub fn acquire_or_bail(&self) -> Result<InstanceLockGuard> {
        match self.try_acquire()? {
            Some(guard) => Ok(guard),
            None => anyhow::bail!(
                "Another usbkill monitor is already running (lock held on {})",
                self.path.display()
            ),
        }
    }
}
