// src/error.rs

//! Crate-wide error type and result alias
//!
//! Errors fall into a small taxonomy: resolution failures (`Unsatisfiable`),
//! cooperative cancellation (`Canceled`), transient I/O, policy denials, and
//! dispatch/contract violations. Resolution failures bubble as errors
//! internally and are translated to notification events at the orchestration
//! boundary; they never cross to the client as raw errors.

use thiserror::Error;

/// Errors produced by the resolver, orchestrator, and session layers
#[derive(Debug, Error)]
pub enum Error {
    /// Resolution cannot produce a valid install graph for this package.
    ///
    /// The diagnostic detail has already been emitted as notification events
    /// on the owning request context by the time this is raised.
    #[error("unable to resolve '{0}'")]
    Unsatisfiable(String),

    /// The operation observed its cancellation signal and unwound.
    ///
    /// Distinguished from failure so clients do not treat a user-initiated
    /// cancel as an error.
    #[error("operation canceled")]
    Canceled,

    /// A permission check rejected the request.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Transport or filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A canonical identity string could not be parsed.
    #[error("invalid package identity '{identity}': {reason}")]
    InvalidIdentity { identity: String, reason: String },

    /// A version string could not be parsed.
    #[error("invalid version '{0}'")]
    InvalidVersion(String),

    /// An inbound request failed inside its handler.
    ///
    /// Caught at the dispatch boundary and reported back to the client as an
    /// unexpected-failure event; the session continues.
    #[error("dispatch failure: {0}")]
    Dispatch(String),

    /// Message encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Another daemon instance already holds the singleton lock.
    #[error("daemon lock is held by another process")]
    LockHeld,

    /// A download could not be completed from any known location.
    #[error("download failed for '{0}'")]
    DownloadFailed(String),

    /// Physical installation of a package file failed.
    #[error("install failed for '{package}': {reason}")]
    InstallFailed { package: String, reason: String },
}

impl Error {
    /// True if this error represents cooperative cancellation rather than
    /// a genuine failure.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }
}

/// Result type for pakd operations
pub type Result<T> = std::result::Result<T, Error>;
