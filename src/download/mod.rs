// src/download/mod.rs

//! Download capability and world-change signaling
//!
//! Physical acquisition is an external collaborator behind the `Downloader`
//! trait. The orchestrator hands outstanding downloads to a `DownloadTracker`
//! so that every completion or failure, either way, raises the request's
//! "world changed" signal and wakes the retry wait early. Byte-level progress
//! flows through a callback into the request's per-package counters, where
//! the orchestration loop folds it into overall progress while blocked.

use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::identity::CanonicalIdentity;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};
use url::Url;

/// Byte-level progress callback: (bytes received, total bytes when known)
pub type DownloadProgressFn = Box<dyn Fn(u64, u64) + Send + Sync>;

/// Capability that acquires a package file from remote locations
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Try the given locations in order and place the file at `destination`.
    /// Resolves to the local path on success. Implementations should invoke
    /// `progress` as bytes arrive.
    async fn download(
        &self,
        package: &CanonicalIdentity,
        locations: &[Url],
        destination: &Path,
        progress: DownloadProgressFn,
    ) -> Result<PathBuf>;
}

/// Tracks outstanding downloads for one install request
///
/// The tracker owns the request's world-change signal: any download finishing
/// (success or failure) notifies it, as does any other state change a caller
/// wants the orchestration loop to observe promptly. The signal is
/// permit-based, so a change that lands while the loop is installing is
/// observed by the next wait instead of being lost.
pub struct DownloadTracker {
    world_changed: Notify,
    outstanding: Mutex<HashSet<CanonicalIdentity>>,
}

impl DownloadTracker {
    pub fn new() -> Self {
        Self {
            world_changed: Notify::new(),
            outstanding: Mutex::new(HashSet::new()),
        }
    }

    /// Claim a download slot for a package. Returns false if a download for
    /// this package is already in flight.
    pub fn begin(&self, identity: &CanonicalIdentity) -> bool {
        self.outstanding.lock().insert(identity.clone())
    }

    pub fn is_outstanding(&self, identity: &CanonicalIdentity) -> bool {
        self.outstanding.lock().contains(identity)
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.lock().len()
    }

    /// Release a package's download slot and raise the world-change signal
    pub fn finish(&self, identity: &CanonicalIdentity) {
        self.outstanding.lock().remove(identity);
        self.world_changed.notify_one();
    }

    /// Raise the world-change signal without touching the outstanding set
    pub fn signal(&self) {
        self.world_changed.notify_one();
    }

    /// Wait for the next world change
    pub async fn changed(&self) {
        self.world_changed.notified().await;
    }
}

impl Default for DownloadTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a download for a package and record the outcome in the request's
/// session data
///
/// The spawned task streams byte progress into the package's session-data
/// counters, records the local location on success, sets
/// `could_not_download` on failure, and always releases the tracker slot so
/// the orchestration loop wakes either way.
pub fn spawn_download(
    ctx: &RequestContext,
    tracker: Arc<DownloadTracker>,
    downloader: Arc<dyn Downloader>,
    package: Arc<crate::package::Package>,
    destination: PathBuf,
) {
    let identity = package.identity().clone();
    if !tracker.begin(&identity) {
        return;
    }

    let locations = package.remote_locations();
    let session_data = ctx.session_data_arc();
    let progress_data = ctx.session_data_arc();
    let progress_identity = identity.clone();
    let on_progress: DownloadProgressFn = Box::new(move |received, total| {
        progress_data.update(&progress_identity, |d| {
            d.download_received = received;
            d.download_total = total;
        });
    });

    tokio::spawn(async move {
        let result = downloader
            .download(&identity, &locations, &destination, on_progress)
            .await;
        match result {
            Ok(path) => {
                debug!(package = %identity, path = %path.display(), "download complete");
                package.add_local_location(path);
            }
            Err(err) => {
                warn!(package = %identity, error = %err, "download failed");
                session_data.update(&identity, |d| d.could_not_download = true);
            }
        }
        tracker.finish(&identity);
    });
}

/// A downloader that always fails; used when no acquisition capability is
/// configured (client-delivered files only)
pub struct NoDownloader;

#[async_trait]
impl Downloader for NoDownloader {
    async fn download(
        &self,
        package: &CanonicalIdentity,
        _locations: &[Url],
        _destination: &Path,
        _progress: DownloadProgressFn,
    ) -> Result<PathBuf> {
        Err(Error::DownloadFailed(package.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CancelToken;
    use crate::identity::Architecture;
    use crate::version::PackageVersion;
    use std::time::Duration;

    fn identity(name: &str) -> CanonicalIdentity {
        CanonicalIdentity::new(
            name,
            PackageVersion::parse("1.0").unwrap(),
            Architecture::X86,
            "aa",
        )
    }

    #[test]
    fn test_begin_claims_slot_once() {
        let tracker = DownloadTracker::new();
        assert!(tracker.begin(&identity("a")));
        assert!(!tracker.begin(&identity("a")));
        assert!(tracker.is_outstanding(&identity("a")));
        tracker.finish(&identity("a"));
        assert!(!tracker.is_outstanding(&identity("a")));
    }

    #[tokio::test]
    async fn test_finish_wakes_waiter() {
        let tracker = Arc::new(DownloadTracker::new());
        tracker.begin(&identity("a"));

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker.changed().await;
            })
        };
        // Give the waiter a chance to park.
        tokio::time::sleep(Duration::from_millis(10)).await;
        tracker.finish(&identity("a"));

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_signal_is_not_lost_without_waiter() {
        let tracker = DownloadTracker::new();
        tracker.signal();
        // The permit from the earlier signal satisfies this wait immediately.
        tokio::time::timeout(Duration::from_millis(100), tracker.changed())
            .await
            .expect("stored permit should satisfy the wait");
    }

    #[tokio::test]
    async fn test_failed_download_marks_session_data() {
        let (ctx, _rx) = RequestContext::detached(CancelToken::new());
        let tracker = Arc::new(DownloadTracker::new());
        let package = Arc::new(crate::package::Package::new(identity("a")));

        spawn_download(
            &ctx,
            tracker.clone(),
            Arc::new(NoDownloader),
            package,
            PathBuf::from("/nonexistent/a.pkg"),
        );

        // Wait for the spawned task to drain.
        for _ in 0..50 {
            if tracker.outstanding_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ctx.session_data().read(&identity("a")).could_not_download);
    }
}
