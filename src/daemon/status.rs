// src/daemon/status.rs

//! Process-wide readiness signals
//!
//! Clients on the same host decide whether to connect (or wait) by reading
//! the daemon's readiness flags: starting-up, available, shutting-down,
//! shutdown-requested, and startup percent. The flags live in atomics for
//! in-process readers and are mirrored to a JSON status file (written to a
//! temp file and renamed, so readers never see a partial write) for everyone
//! else.

use crate::error::Result;
use crate::orchestrator::ServiceControl;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tracing::{info, warn};

/// Snapshot of the daemon's readiness flags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub starting_up: bool,
    pub available: bool,
    pub shutting_down: bool,
    pub shutdown_requested: bool,
    pub restart_pending: bool,
    pub startup_percent: u8,
    pub pid: u32,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Shared daemon status, mirrored to disk on every change
pub struct DaemonStatus {
    starting_up: AtomicBool,
    available: AtomicBool,
    shutting_down: AtomicBool,
    shutdown_requested: AtomicBool,
    restart_pending: AtomicBool,
    startup_percent: AtomicU8,
    status_path: PathBuf,
}

impl DaemonStatus {
    /// Default status file path
    pub const DEFAULT_PATH: &'static str = "/var/lib/pakd/status.json";

    pub fn new(status_path: impl Into<PathBuf>) -> Self {
        Self {
            starting_up: AtomicBool::new(true),
            available: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            restart_pending: AtomicBool::new(false),
            startup_percent: AtomicU8::new(0),
            status_path: status_path.into(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn is_restart_pending(&self) -> bool {
        self.restart_pending.load(Ordering::SeqCst)
    }

    /// Advance the startup percent (monotonic)
    pub fn set_startup_percent(&self, percent: u8) {
        let current = self.startup_percent.load(Ordering::SeqCst);
        if percent > current {
            self.startup_percent.store(percent.min(100), Ordering::SeqCst);
            self.mirror();
        }
    }

    /// Startup finished; the daemon accepts connections
    pub fn set_available(&self) {
        self.starting_up.store(false, Ordering::SeqCst);
        self.startup_percent.store(100, Ordering::SeqCst);
        self.available.store(true, Ordering::SeqCst);
        info!("daemon available");
        self.mirror();
    }

    /// Ask the daemon to wind down at the next opportunity
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.mirror();
    }

    /// Shutdown has begun; no new sessions are accepted
    pub fn set_shutting_down(&self) {
        self.available.store(false, Ordering::SeqCst);
        self.shutting_down.store(true, Ordering::SeqCst);
        info!("daemon shutting down");
        self.mirror();
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            starting_up: self.starting_up.load(Ordering::SeqCst),
            available: self.available.load(Ordering::SeqCst),
            shutting_down: self.shutting_down.load(Ordering::SeqCst),
            shutdown_requested: self.shutdown_requested.load(Ordering::SeqCst),
            restart_pending: self.restart_pending.load(Ordering::SeqCst),
            startup_percent: self.startup_percent.load(Ordering::SeqCst),
            pid: std::process::id(),
            updated_at: chrono::Utc::now(),
        }
    }

    /// Write the snapshot to the status file via temp-file-and-rename
    fn mirror(&self) {
        if let Err(err) = self.try_mirror() {
            warn!(path = %self.status_path.display(), error = %err, "failed to write status file");
        }
    }

    fn try_mirror(&self) -> Result<()> {
        if let Some(parent) = self.status_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        let tmp = self.status_path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.status_path)?;
        Ok(())
    }

    /// Force a mirror write (e.g. right after startup)
    pub fn publish(&self) {
        self.mirror();
    }
}

impl ServiceControl for DaemonStatus {
    /// Schedule a restart: the accept loop winds down and the supervisor
    /// (or init system) brings the new binary up
    fn schedule_restart(&self) {
        self.restart_pending.store(true, Ordering::SeqCst);
        self.shutdown_requested.store(true, Ordering::SeqCst);
        info!("daemon restart scheduled");
        self.mirror();
    }
}

/// Read another process's status file
pub fn read_status(path: impl AsRef<Path>) -> Result<StatusSnapshot> {
    let content = fs::read_to_string(path.as_ref())?;
    Ok(serde_json::from_str(&content)?)
}
