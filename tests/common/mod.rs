// tests/common/mod.rs

//! Shared test fixtures for integration tests.
//!
//! External collaborators (feeds, installed-state probe, signature verifier,
//! downloader, installer) are replaced here with scriptable in-memory
//! doubles so the resolver, orchestrator, and session layers can be driven
//! end to end without a real package store.

#![allow(dead_code)]

use async_trait::async_trait;
use pakd::context::{CancelToken, RequestContext};
use pakd::download::{DownloadProgressFn, Downloader};
use pakd::feed::{FeedRegistry, IdentityQuery, PackageFeed};
use pakd::identity::{Architecture, CanonicalIdentity};
use pakd::orchestrator::{Installer, Orchestrator, ServiceControl};
use pakd::package::{InstalledProbe, Package};
use pakd::registry::PackageRegistry;
use pakd::resolver::Resolver;
use pakd::session::Dispatcher;
use pakd::session::message::{Event, OutboundMessage};
use pakd::signature::SignatureVerifier;
use pakd::version::{BindingPolicy, PackageVersion};
use pakd::{Error, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use url::Url;

pub const KEY_TOKEN: &str = "1e373a58e25250cb";

/// Build a canonical identity in the test key space
pub fn ident(name: &str, version: &str) -> CanonicalIdentity {
    CanonicalIdentity::new(
        name,
        PackageVersion::parse(version).unwrap(),
        Architecture::X86,
        KEY_TOKEN,
    )
}

pub fn policy(min: &str, max: &str) -> BindingPolicy {
    BindingPolicy::new(
        PackageVersion::parse(min).unwrap(),
        PackageVersion::parse(max).unwrap(),
    )
}

/// Installed-state probe over a mutable identity set
pub struct SetProbe {
    installed: Mutex<HashSet<CanonicalIdentity>>,
}

impl SetProbe {
    pub fn empty() -> Arc<Self> {
        Self::of(&[])
    }

    pub fn of(identities: &[CanonicalIdentity]) -> Arc<Self> {
        Arc::new(Self {
            installed: Mutex::new(identities.iter().cloned().collect()),
        })
    }

    pub fn add(&self, identity: CanonicalIdentity) {
        self.installed.lock().unwrap().insert(identity);
    }
}

impl InstalledProbe for SetProbe {
    fn probe_installed(&self, identity: &CanonicalIdentity) -> bool {
        self.installed.lock().unwrap().contains(identity)
    }
}

/// Verifier that accepts any existing file
pub struct AcceptAll;

impl SignatureVerifier for AcceptAll {
    fn has_valid_signature(&self, path: &Path) -> bool {
        path.exists()
    }

    fn publisher_name(&self, _path: &Path) -> Option<String> {
        Some("Test Publisher".to_string())
    }
}

/// Feed that materializes a fixed identity list through the shared registry
pub struct MemoryFeed {
    location: String,
    identities: Vec<CanonicalIdentity>,
    registry: Arc<PackageRegistry>,
    stale: AtomicBool,
}

impl MemoryFeed {
    pub fn new(
        location: &str,
        identities: Vec<CanonicalIdentity>,
        registry: Arc<PackageRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            location: location.to_string(),
            identities,
            registry,
            stale: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl PackageFeed for MemoryFeed {
    async fn find_packages(&self, query: &IdentityQuery) -> Result<Vec<Arc<Package>>> {
        self.stale.store(false, Ordering::SeqCst);
        Ok(self
            .identities
            .iter()
            .filter(|identity| query.matches(identity))
            .map(|identity| self.registry.get_or_add(identity.clone()))
            .collect())
    }

    fn is_location_match(&self, location: &str) -> bool {
        self.location == location
    }

    fn location(&self) -> &str {
        &self.location
    }

    fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    fn set_stale(&self, stale: bool) {
        self.stale.store(stale, Ordering::SeqCst);
    }
}

/// Downloader that writes a payload file for every identity not in its
/// failure set
pub struct ScriptedDownloader {
    fail: HashSet<CanonicalIdentity>,
}

impl ScriptedDownloader {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            fail: HashSet::new(),
        })
    }

    pub fn failing_for(identities: &[CanonicalIdentity]) -> Arc<Self> {
        Arc::new(Self {
            fail: identities.iter().cloned().collect(),
        })
    }
}

#[async_trait]
impl Downloader for ScriptedDownloader {
    async fn download(
        &self,
        package: &CanonicalIdentity,
        _locations: &[Url],
        destination: &Path,
        progress: DownloadProgressFn,
    ) -> Result<PathBuf> {
        if self.fail.contains(package) {
            return Err(Error::DownloadFailed(package.to_string()));
        }
        progress(512, 1024);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(destination, b"payload").await?;
        progress(1024, 1024);
        Ok(destination.to_path_buf())
    }
}

/// Installer that records install order and fails on request
pub struct ScriptedInstaller {
    pub installed: Mutex<Vec<CanonicalIdentity>>,
    fail: HashSet<CanonicalIdentity>,
}

impl ScriptedInstaller {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            installed: Mutex::new(Vec::new()),
            fail: HashSet::new(),
        })
    }

    pub fn failing_for(identities: &[CanonicalIdentity]) -> Arc<Self> {
        Arc::new(Self {
            installed: Mutex::new(Vec::new()),
            fail: identities.iter().cloned().collect(),
        })
    }

    pub fn install_order(&self) -> Vec<CanonicalIdentity> {
        self.installed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Installer for ScriptedInstaller {
    async fn install_package(&self, identity: &CanonicalIdentity, _path: &Path) -> Result<()> {
        if self.fail.contains(identity) {
            return Err(Error::InstallFailed {
                package: identity.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        self.installed.lock().unwrap().push(identity.clone());
        Ok(())
    }
}

/// Restart scheduler that records whether it fired
#[derive(Default)]
pub struct RecordingServiceControl {
    pub restart_scheduled: AtomicBool,
}

impl ServiceControl for RecordingServiceControl {
    fn schedule_restart(&self) {
        self.restart_scheduled.store(true, Ordering::SeqCst);
    }
}

/// Everything a resolver/orchestrator test needs, wired together
pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub probe: Arc<SetProbe>,
    pub registry: Arc<PackageRegistry>,
    pub feeds: Arc<FeedRegistry>,
    pub resolver: Arc<Resolver>,
    pub installer: Arc<ScriptedInstaller>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_installer(ScriptedInstaller::succeeding())
    }

    pub fn with_installer(installer: Arc<ScriptedInstaller>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let probe = SetProbe::empty();
        let registry = Arc::new(PackageRegistry::new(probe.clone()));
        let feeds = Arc::new(FeedRegistry::new());
        let resolver = Arc::new(Resolver::new(
            registry.clone(),
            feeds.clone(),
            Arc::new(AcceptAll),
        ));
        Self {
            dir,
            probe,
            registry,
            feeds,
            resolver,
            installer,
        }
    }

    /// A package known to the registry with a validated local file
    pub fn package_with_file(&self, identity: CanonicalIdentity) -> Arc<Package> {
        let package = self.registry.get_or_add(identity);
        let path = self
            .dir
            .path()
            .join(format!("{}.pkg", package.identity()));
        std::fs::write(&path, b"payload").unwrap();
        package.add_local_location(path);
        package
    }

    /// A package known to the registry with only a remote location
    pub fn package_with_remote(&self, identity: CanonicalIdentity) -> Arc<Package> {
        let package = self.registry.get_or_add(identity);
        let url = format!("https://packages.example/{}.pkg", package.identity());
        package.add_remote_location(Url::parse(&url).unwrap());
        package
    }

    /// Mark a package installed at the probe level
    pub fn mark_installed(&self, identity: &CanonicalIdentity) {
        self.probe.add(identity.clone());
    }

    /// An orchestrator over this fixture with a fast poll interval
    pub fn orchestrator(&self, downloader: Arc<dyn Downloader>) -> Orchestrator {
        Orchestrator::new(
            self.registry.clone(),
            self.resolver.clone(),
            Arc::new(AcceptAll),
            downloader,
            self.installer.clone(),
            self.dir.path().join("downloads"),
        )
        .with_poll_interval(Duration::from_millis(20))
    }

    /// A dispatcher over this fixture, permitting everything
    pub fn dispatcher(&self, downloader: Arc<dyn Downloader>) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            self.registry.clone(),
            self.feeds.clone(),
            Arc::new(self.orchestrator(downloader)),
            Arc::new(pakd::session::dispatch::AllowAll),
        ))
    }
}

/// A detached request context plus its event receiver
pub fn request_context() -> (RequestContext, UnboundedReceiver<OutboundMessage>) {
    RequestContext::detached(CancelToken::new())
}

/// Drain every event currently queued on a receiver
pub fn drain_events(rx: &mut UnboundedReceiver<OutboundMessage>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(message) = rx.try_recv() {
        events.push(message.event);
    }
    events
}
