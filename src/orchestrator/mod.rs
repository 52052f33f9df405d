// src/orchestrator/mod.rs

//! Install orchestration
//!
//! One `Orchestrator::install` call owns the retry/acquire/install state
//! machine for a single install request: it repeatedly resolves the install
//! graph, requests whatever downloads are missing, installs what is ready in
//! strict graph order, and blocks on the world-change signal (or a short
//! poll interval) until the picture changes. The plan may shrink or grow
//! between iterations; progress accounting stays monotonic throughout.
//!
//! Installs that touch the physical package store are serialized through a
//! coarse store lock shared by all concurrent requests, so two orchestration
//! runs never write the same on-disk state at once.

pub mod progress;

pub use progress::InstallProgress;

use crate::context::RequestContext;
use crate::download::{DownloadTracker, Downloader, spawn_download};
use crate::error::{Error, Result};
use crate::identity::CanonicalIdentity;
use crate::package::Package;
use crate::registry::PackageRegistry;
use crate::resolver::{InstallGraph, Resolver};
use crate::session::message::Event;
use crate::signature::{SignatureVerifier, validated_local_path};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Capability that performs the physical install of one validated package
/// file into the local store
#[async_trait]
pub trait Installer: Send + Sync {
    async fn install_package(&self, identity: &CanonicalIdentity, path: &Path) -> Result<()>;
}

/// Capability for scheduling a restart of the daemon itself
pub trait ServiceControl: Send + Sync {
    fn schedule_restart(&self);
}

/// One client install request
#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub identity: CanonicalIdentity,
    /// The client consents to upgrades chosen during resolution
    pub auto_upgrade: bool,
    /// Install exactly this version; never substitute
    pub exact: bool,
    /// Acquire all files but perform no installation
    pub download_only: bool,
    /// Plan only: report what would happen, change nothing
    pub pretend: bool,
}

impl InstallRequest {
    pub fn new(identity: CanonicalIdentity) -> Self {
        Self {
            identity,
            auto_upgrade: false,
            exact: false,
            download_only: false,
            pretend: false,
        }
    }
}

/// Terminal state of an orchestration run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completed {
    Success,
    Canceled,
    Failed,
    /// The daemon's own binary was superseded; a restart has been scheduled
    /// instead of declaring plain success
    RestartRequired,
}

/// Drives install requests against the resolver and the package store
pub struct Orchestrator {
    registry: Arc<PackageRegistry>,
    resolver: Arc<Resolver>,
    verifier: Arc<dyn SignatureVerifier>,
    downloader: Arc<dyn Downloader>,
    installer: Arc<dyn Installer>,
    /// Coarse serialization of physical store writes across requests
    store_lock: Arc<Mutex<()>>,
    download_dir: PathBuf,
    poll_interval: Duration,
    own_identity: Option<CanonicalIdentity>,
    service_control: Option<Arc<dyn ServiceControl>>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<PackageRegistry>,
        resolver: Arc<Resolver>,
        verifier: Arc<dyn SignatureVerifier>,
        downloader: Arc<dyn Downloader>,
        installer: Arc<dyn Installer>,
        download_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            resolver,
            verifier,
            downloader,
            installer,
            store_lock: Arc::new(Mutex::new(())),
            download_dir: download_dir.into(),
            poll_interval: Duration::from_secs(5),
            own_identity: None,
            service_control: None,
        }
    }

    /// Set the retry poll interval (the upper bound on how long the loop
    /// sleeps when no world-change signal arrives)
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Identify the daemon's own package family, enabling the self-restart
    /// check after successful installs
    pub fn with_own_identity(mut self, identity: CanonicalIdentity) -> Self {
        self.own_identity = Some(identity);
        self
    }

    pub fn with_service_control(mut self, control: Arc<dyn ServiceControl>) -> Self {
        self.service_control = Some(control);
        self
    }

    /// Share one store lock between several orchestrators
    pub fn with_store_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.store_lock = lock;
        self
    }

    /// Run one install request to a terminal state
    ///
    /// Progress and diagnostic events flow out through the request context;
    /// the return value is the terminal classification only.
    pub async fn install(&self, ctx: &RequestContext, request: InstallRequest) -> Completed {
        info!(package = %request.identity, auto_upgrade = request.auto_upgrade,
              exact = request.exact, pretend = request.pretend, "install request");

        let root = self.registry.get_or_add(request.identity.clone());
        root.set_wanted(true);
        ctx.session_data().update(&request.identity, |d| {
            d.client_specified = true;
            d.do_not_supersede = request.exact;
            d.upgrade_as_needed = request.auto_upgrade;
        });

        let tracker = Arc::new(DownloadTracker::new());
        let mut progress = InstallProgress::new();
        let mut last_shape: Option<(usize, usize)> = None;

        loop {
            if ctx.check_canceled().is_err() {
                ctx.emit(Event::OperationCanceled);
                return Completed::Canceled;
            }

            let graph = match self.resolver.resolve(ctx, &root).await {
                Ok(graph) => graph,
                Err(Error::Canceled) => {
                    ctx.emit(Event::OperationCanceled);
                    return Completed::Canceled;
                }
                Err(err) => {
                    // Diagnostics were emitted during resolution.
                    warn!(package = %request.identity, error = %err, "resolution failed");
                    return Completed::Failed;
                }
            };

            if graph.is_empty() {
                // Nothing to install: the request is already satisfied.
                return self.finish_success(ctx);
            }

            let (ready, missing) =
                graph.partition_missing(ctx.session_data(), self.verifier.as_ref());

            // Re-weight whenever the plan changed shape since last iteration.
            let shape = (graph.len(), missing.len());
            if last_shape != Some(shape) {
                progress.rescale(graph.len(), missing.len());
                last_shape = Some(shape);
            }

            if (request.pretend || request.download_only) && missing.is_empty() {
                self.emit_plan(ctx, &graph);
                return Completed::Success;
            }

            if !missing.is_empty() {
                // Tell the client which files are needed (idempotent per
                // package per request) and kick off acquisition; install
                // nothing this iteration.
                for package in &missing {
                    let destination = self.download_dir.join(package.canonical_file_name());
                    ctx.notify_remote_file_required(
                        package.identity(),
                        package.remote_locations(),
                        destination.display().to_string(),
                    );
                    if package.has_remote_locations() {
                        spawn_download(
                            ctx,
                            tracker.clone(),
                            self.downloader.clone(),
                            package.clone(),
                            destination,
                        );
                    }
                }
            } else {
                debug_assert_eq!(ready.len(), graph.len());
                match self.install_ready(ctx, &graph, &mut progress).await {
                    InstallPass::Done => return self.finish_success(ctx),
                    InstallPass::Fatal => return Completed::Failed,
                    InstallPass::Canceled => {
                        ctx.emit(Event::OperationCanceled);
                        return Completed::Canceled;
                    }
                    // A non-fatal failure: re-resolve, the plan may change.
                    InstallPass::Retry => {}
                }
            }

            self.wait_for_world_change(ctx, &tracker, &missing, &mut progress)
                .await;
        }
    }

    /// Install every plan package in graph order. Stops at the first
    /// failure: fatally when the package was pinned by the client, otherwise
    /// leaving the remaining siblings for the next resolution pass.
    async fn install_ready(
        &self,
        ctx: &RequestContext,
        graph: &InstallGraph,
        progress: &mut InstallProgress,
    ) -> InstallPass {
        // Installs touching the shared store run one request at a time.
        let _store_guard = self.store_lock.lock().await;

        for package in graph.iter() {
            if ctx.check_canceled().is_err() {
                return InstallPass::Canceled;
            }
            let identity = package.identity().clone();

            if self.registry.is_installed(package) {
                debug!(package = %identity, "already installed, skipping");
                progress.package_installed();
                continue;
            }

            let Some(path) =
                validated_local_path(package, ctx.session_data(), self.verifier.as_ref())
            else {
                // The file vanished since partitioning; re-resolve.
                warn!(package = %identity, "validated file disappeared before install");
                return InstallPass::Retry;
            };

            ctx.emit(Event::InstallingProgress {
                package: identity.clone(),
                percent: 0,
                overall_percent: progress.overall_percent(),
            });

            match self.installer.install_package(&identity, &path).await {
                Ok(()) => {
                    self.registry.mark_installed(package);
                    progress.package_installed();
                    ctx.emit(Event::InstallingProgress {
                        package: identity.clone(),
                        percent: 100,
                        overall_percent: progress.overall_percent(),
                    });
                    ctx.emit(Event::Installed { package: identity });
                }
                Err(err) => {
                    warn!(package = %identity, error = %err, "install failed");
                    ctx.emit(Event::FailedInstall {
                        package: identity.clone(),
                        reason: err.to_string(),
                    });
                    ctx.session_data().update(&identity, |d| d.failed_install = true);

                    // A pinned package failing is fatal for the whole
                    // request; anything else retries via re-resolution.
                    let data = ctx.session_data().read(&identity);
                    let physically_installable =
                        package.local_location().is_some() || package.has_remote_locations();
                    if !data.allowed_to_supersede(package.is_wanted(), physically_installable) {
                        ctx.record_failure(format!(
                            "{}: install failed and substitution is not permitted",
                            identity
                        ));
                        return InstallPass::Fatal;
                    }
                    return InstallPass::Retry;
                }
            }
        }

        InstallPass::Done
    }

    /// Success bookkeeping: superseded packages lose their client-requested
    /// mark, then the daemon checks whether it superseded itself
    fn finish_success(&self, ctx: &RequestContext) -> Completed {
        for identity in ctx.session_data().superseded_identities() {
            if let Some(package) = self.registry.get(&identity) {
                package.set_wanted(false);
            }
        }

        if let Some(active) = self.newer_self_version() {
            info!(active = %active, "daemon binary superseded, scheduling restart");
            ctx.emit(Event::RestartRequired {
                active_version: active,
            });
            if let Some(ref control) = self.service_control {
                control.schedule_restart();
            }
            return Completed::RestartRequired;
        }

        Completed::Success
    }

    /// A newer installed version of the daemon's own package, if any
    fn newer_self_version(&self) -> Option<CanonicalIdentity> {
        let own = self.own_identity.as_ref()?;
        self.registry
            .installed_in_family(own)
            .into_iter()
            .map(|p| p.identity().clone())
            .find(|identity| identity.version > own.version)
    }

    /// Emit the resolved plan as informational events (dry-run output)
    fn emit_plan(&self, ctx: &RequestContext, graph: &InstallGraph) {
        for package in graph.iter() {
            ctx.emit(Event::PackageFound {
                package: package.identity().clone(),
                installed: package.is_installed(),
                local_location: package
                    .local_location()
                    .map(|p| p.display().to_string()),
            });
        }
    }

    /// Block until the world changes or the poll interval elapses, folding
    /// download progress into the overall accounting on the way out
    async fn wait_for_world_change(
        &self,
        ctx: &RequestContext,
        tracker: &DownloadTracker,
        missing: &[Arc<Package>],
        progress: &mut InstallProgress,
    ) {
        tokio::select! {
            _ = tracker.changed() => {}
            _ = tokio::time::sleep(self.poll_interval) => {}
            _ = ctx.cancel_token().notified() => {}
        }

        let mut units = 0u64;
        for package in missing {
            let data = ctx.session_data().read(package.identity());
            if data.download_total > 0 {
                units += InstallProgress::download_units_per_package()
                    * data.download_received.min(data.download_total)
                    / data.download_total;
            }
        }
        progress.set_download_units(units);
    }
}

/// Outcome of one pass over the ready-to-install packages
enum InstallPass {
    Done,
    Retry,
    Fatal,
    Canceled,
}
