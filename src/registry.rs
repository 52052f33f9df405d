// src/registry.rs

//! Process-wide package registry
//!
//! One identity-deduplicated table of every `Package` the daemon knows about,
//! shared across all sessions and requests. `get_or_add` is the only way a
//! `Package` comes into existence, which guarantees at most one instance per
//! canonical identity for the life of the process.
//!
//! Mutations (insertion, installed-flag transitions) take the fine-grained
//! per-entry lock; resolution and supersedence comparisons read
//! already-published state lock-free.

use crate::identity::CanonicalIdentity;
use crate::package::{InstalledProbe, InstalledState, Package};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Events published when registry state changes
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A package transitioned to installed. Feeds subscribe to this to mark
    /// themselves stale.
    Installed { identity: CanonicalIdentity },
}

/// The shared package table
pub struct PackageRegistry {
    packages: DashMap<CanonicalIdentity, Arc<Package>>,
    probe: Arc<dyn InstalledProbe>,
    events: broadcast::Sender<RegistryEvent>,
}

impl PackageRegistry {
    /// Create a registry backed by the given installed-state probe
    pub fn new(probe: Arc<dyn InstalledProbe>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            packages: DashMap::new(),
            probe,
            events,
        }
    }

    /// Look up or create the unique `Package` for an identity
    pub fn get_or_add(&self, identity: CanonicalIdentity) -> Arc<Package> {
        self.packages
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(Package::new(identity)))
            .value()
            .clone()
    }

    /// Look up a package without creating it
    pub fn get(&self, identity: &CanonicalIdentity) -> Option<Arc<Package>> {
        self.packages.get(identity).map(|entry| entry.value().clone())
    }

    /// Whether the package is installed, resolving a cached `Unknown` through
    /// the probe capability
    ///
    /// Side effect: a probe that discovers the package is already present
    /// publishes `RegistryEvent::Installed`, exactly once per transition.
    pub fn is_installed(&self, package: &Package) -> bool {
        if package.installed_state() != InstalledState::Unknown {
            return package.is_installed();
        }
        let (state, transitioned) = package.refresh_installed(self.probe.as_ref());
        if transitioned {
            self.publish_installed(package.identity());
        }
        state.is_installed()
    }

    /// Record a successful install and publish the transition
    pub fn mark_installed(&self, package: &Package) {
        if package.mark_installed() {
            self.publish_installed(package.identity());
        }
    }

    fn publish_installed(&self, identity: &CanonicalIdentity) {
        debug!(package = %identity, "package transitioned to installed");
        // No subscribers is fine.
        let _ = self.events.send(RegistryEvent::Installed {
            identity: identity.clone(),
        });
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// All known versions of a package family, newest first
    pub fn family_members(&self, of: &CanonicalIdentity) -> Vec<Arc<Package>> {
        let mut members: Vec<Arc<Package>> = self
            .packages
            .iter()
            .filter(|entry| entry.key().is_same_family(of))
            .map(|entry| entry.value().clone())
            .collect();
        members.sort_by(|a, b| b.version().cmp(&a.version()));
        members
    }

    /// Installed members of a family, newest first
    ///
    /// Resolves cached `Unknown` states through the probe on the way.
    pub fn installed_in_family(&self, of: &CanonicalIdentity) -> Vec<Arc<Package>> {
        self.family_members(of)
            .into_iter()
            .filter(|p| self.is_installed(p))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}
