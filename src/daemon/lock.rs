// src/daemon/lock.rs

//! Exclusive daemon lock
//!
//! The daemon holds this lock for its entire lifetime, ensuring only one
//! instance serves a package store at a time. Clients check it to decide
//! whether a daemon is up before connecting.
//!
//! The lock is an `flock(LOCK_EX)` on a well-known file and releases
//! automatically when the process exits, so a crashed daemon never leaves a
//! stale lock behind.

use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Process-lifetime exclusive lock on the daemon's package store
pub struct DaemonLock {
    /// Kept open to maintain the flock
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
}

impl DaemonLock {
    /// Default lock path for the daemon
    pub const DEFAULT_PATH: &'static str = "/var/lib/pakd/daemon.lock";

    /// Acquire the lock, blocking until it is available
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(&path)?;
        file.lock_exclusive()?;
        info!(path = %path.display(), "acquired daemon lock");
        Ok(Self { file, path })
    }

    /// Try to acquire the lock without blocking
    ///
    /// Returns `Err(Error::LockHeld)` when another process holds it.
    pub fn try_acquire<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                info!(path = %path.display(), "acquired daemon lock");
                Ok(Self { file, path })
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                debug!(path = %path.display(), "daemon lock already held");
                Err(Error::LockHeld)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Whether any process currently holds the lock
    ///
    /// Non-destructive: briefly takes and releases the lock when free.
    pub fn is_held<P: AsRef<Path>>(path: P) -> bool {
        let path = path.as_ref();
        if !path.exists() {
            return false;
        }
        let Ok(file) = File::open(path) else {
            return false;
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                false
            }
            Err(_) => true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// PID of the lock holder, read from the sibling .pid file
    pub fn holder_pid<P: AsRef<Path>>(lock_path: P) -> Option<u32> {
        let pid_path = lock_path.as_ref().with_extension("pid");
        fs::read_to_string(pid_path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    /// Record our PID next to the lock so clients can identify the holder
    pub fn write_pid(&self) -> Result<()> {
        let pid_path = self.path.with_extension("pid");
        fs::write(pid_path, std::process::id().to_string())?;
        Ok(())
    }

    fn remove_pid(&self) {
        let _ = fs::remove_file(self.path.with_extension("pid"));
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        self.remove_pid();
        // The flock releases when the file handle closes.
        info!(path = %self.path.display(), "released daemon lock");
    }
}
