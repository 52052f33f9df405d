// src/package/mod.rs

//! Package entities
//!
//! A `Package` is the process-wide record for one canonical identity: its
//! binding policy, installed state, request flags, dependency edges, and
//! known locations. Instances are created only through the registry
//! (`PackageRegistry::get_or_add`) so that at most one exists per identity
//! and reference equality implies identity equality.
//!
//! Dependencies are stored as canonical identities rather than references to
//! other `Package` instances. Malformed metadata can declare cycles; edges by
//! identity keep the graph representable and let the resolver detect cycles
//! with a visited set instead of recursing forever.

pub mod session_data;

pub use session_data::{PackageSessionData, SessionDataMap};

use crate::identity::CanonicalIdentity;
use crate::version::{BindingPolicy, PackageVersion};
use parking_lot::RwLock;
use std::path::PathBuf;
use url::Url;

/// Cached installed status of a package
///
/// `Unknown` means the handler capability has not been consulted yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstalledState {
    #[default]
    Unknown,
    Yes,
    No,
}

impl InstalledState {
    pub fn is_installed(self) -> bool {
        self == InstalledState::Yes
    }
}

/// Capability that answers whether a package is physically present in the
/// local package store
pub trait InstalledProbe: Send + Sync {
    fn probe_installed(&self, identity: &CanonicalIdentity) -> bool;
}

/// Mutable package state, guarded by the package's lock
#[derive(Debug, Default)]
struct PackageState {
    binding_policy: Option<BindingPolicy>,
    installed: InstalledState,
    /// Explicitly requested by a client
    wanted: bool,
    /// Pulled in as a dependency of something else
    is_dependency: bool,
    blocked: bool,
    do_not_update: bool,
    do_not_upgrade: bool,
    dependencies: Vec<CanonicalIdentity>,
    remote_locations: Vec<Url>,
    local_locations: Vec<PathBuf>,
    feed_locations: Vec<String>,
    /// Chosen on write, revalidated lazily on read
    primary_local: Option<PathBuf>,
}

/// A known package, shared process-wide through the registry
#[derive(Debug)]
pub struct Package {
    identity: CanonicalIdentity,
    state: RwLock<PackageState>,
}

impl Package {
    /// Create a package record. Only the registry should call this.
    pub(crate) fn new(identity: CanonicalIdentity) -> Self {
        Self {
            identity,
            state: RwLock::new(PackageState::default()),
        }
    }

    pub fn identity(&self) -> &CanonicalIdentity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn version(&self) -> PackageVersion {
        self.identity.version
    }

    /// The declared binary-compatibility range, if any
    pub fn binding_policy(&self) -> Option<BindingPolicy> {
        self.state.read().binding_policy
    }

    /// Record the binding policy from package metadata
    ///
    /// The policy is set once; later calls against an already-populated
    /// policy are ignored.
    pub fn set_binding_policy(&self, policy: BindingPolicy) {
        let mut state = self.state.write();
        if state.binding_policy.is_none() {
            state.binding_policy = Some(policy);
        }
    }

    /// Read the cached installed state without consulting the probe
    pub fn installed_state(&self) -> InstalledState {
        self.state.read().installed
    }

    pub fn is_installed(&self) -> bool {
        self.installed_state().is_installed()
    }

    /// Resolve and cache the installed state through the probe capability
    ///
    /// Returns the resolved state and whether this call transitioned the
    /// package to installed. The caller (the registry) is responsible for
    /// publishing the transition to interested parties.
    pub fn refresh_installed(&self, probe: &dyn InstalledProbe) -> (InstalledState, bool) {
        {
            let state = self.state.read();
            if state.installed != InstalledState::Unknown {
                return (state.installed, false);
            }
        }

        let present = probe.probe_installed(&self.identity);
        let mut state = self.state.write();
        // Another caller may have raced us past the probe.
        if state.installed == InstalledState::Unknown {
            state.installed = if present {
                InstalledState::Yes
            } else {
                InstalledState::No
            };
        }
        (state.installed, present && state.installed == InstalledState::Yes)
    }

    /// Force the installed flag to `Yes`, returning true if that was a change
    ///
    /// Used by the orchestrator after a successful install. The registry
    /// publishes the transition.
    pub fn mark_installed(&self) -> bool {
        let mut state = self.state.write();
        let changed = state.installed != InstalledState::Yes;
        state.installed = InstalledState::Yes;
        changed
    }

    /// Drop a cached installed determination so the next read re-probes
    pub fn invalidate_installed(&self) {
        self.state.write().installed = InstalledState::Unknown;
    }

    pub fn is_wanted(&self) -> bool {
        self.state.read().wanted
    }

    pub fn set_wanted(&self, wanted: bool) {
        self.state.write().wanted = wanted;
    }

    pub fn is_dependency(&self) -> bool {
        self.state.read().is_dependency
    }

    pub fn set_is_dependency(&self, value: bool) {
        self.state.write().is_dependency = value;
    }

    /// Required means a client asked for it or something depends on it
    pub fn is_required(&self) -> bool {
        let state = self.state.read();
        state.wanted || state.is_dependency
    }

    pub fn is_blocked(&self) -> bool {
        self.state.read().blocked
    }

    pub fn set_blocked(&self, blocked: bool) {
        self.state.write().blocked = blocked;
    }

    pub fn do_not_update(&self) -> bool {
        self.state.read().do_not_update
    }

    pub fn set_do_not_update(&self, value: bool) {
        self.state.write().do_not_update = value;
    }

    pub fn do_not_upgrade(&self) -> bool {
        self.state.read().do_not_upgrade
    }

    pub fn set_do_not_upgrade(&self, value: bool) {
        self.state.write().do_not_upgrade = value;
    }

    /// Declared dependencies, as identity edges
    pub fn dependencies(&self) -> Vec<CanonicalIdentity> {
        self.state.read().dependencies.clone()
    }

    pub fn add_dependency(&self, identity: CanonicalIdentity) {
        let mut state = self.state.write();
        if !state.dependencies.contains(&identity) {
            state.dependencies.push(identity);
        }
    }

    /// Remote locations this package can be acquired from
    pub fn remote_locations(&self) -> Vec<Url> {
        self.state.read().remote_locations.clone()
    }

    pub fn add_remote_location(&self, url: Url) {
        let mut state = self.state.write();
        if !state.remote_locations.contains(&url) {
            state.remote_locations.push(url);
        }
    }

    pub fn has_remote_locations(&self) -> bool {
        !self.state.read().remote_locations.is_empty()
    }

    /// Record a local copy of the package file and make it primary
    pub fn add_local_location(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let mut state = self.state.write();
        if !state.local_locations.contains(&path) {
            state.local_locations.push(path.clone());
        }
        state.primary_local = Some(path);
    }

    /// The primary local package file, revalidated on read
    ///
    /// If the primary no longer exists on disk it is dropped and the first
    /// still-existing local location takes its place.
    pub fn local_location(&self) -> Option<PathBuf> {
        {
            let state = self.state.read();
            if let Some(ref primary) = state.primary_local {
                if primary.exists() {
                    return Some(primary.clone());
                }
            } else if state.local_locations.is_empty() {
                return None;
            }
        }

        let mut state = self.state.write();
        state.local_locations.retain(|p| p.exists());
        state.primary_local = state.local_locations.first().cloned();
        state.primary_local.clone()
    }

    /// Feed locations that have offered this package
    pub fn feed_locations(&self) -> Vec<String> {
        self.state.read().feed_locations.clone()
    }

    pub fn add_feed_location(&self, location: impl Into<String>) {
        let location = location.into();
        let mut state = self.state.write();
        if !state.feed_locations.contains(&location) {
            state.feed_locations.push(location);
        }
    }

    /// A default filename for the package file in the local store
    pub fn canonical_file_name(&self) -> String {
        format!("{}.pkg", self.identity)
    }
}
