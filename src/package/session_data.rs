// src/package/session_data.rs

//! Request-scoped package state
//!
//! `PackageSessionData` is the mutable state an install request accumulates
//! against a package while it runs: supersedence intent, download and install
//! failures, progress counters, and the signature-validated local path. It is
//! deliberately kept out of `Package` itself; each request carries its own
//! `SessionDataMap` so none of this leaks across unrelated install requests.

use crate::identity::CanonicalIdentity;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;

/// Per-request mutable state for one package
#[derive(Debug, Clone, Default)]
pub struct PackageSessionData {
    /// The client asked for this exact package; do not substitute it
    pub do_not_supersede: bool,
    /// The client consented to upgrades during this request
    pub upgrade_as_needed: bool,
    /// Named directly by the client rather than pulled in as a dependency
    pub client_specified: bool,
    /// A download attempt for this package failed during this request
    pub could_not_download: bool,
    /// An install attempt for this package failed during this request
    pub failed_install: bool,
    /// The package chosen to supersede this one, if any
    pub supersedent: Option<CanonicalIdentity>,
    /// Expected download size in bytes, when known
    pub download_total: u64,
    /// Bytes received so far
    pub download_received: u64,
    /// Local file that has passed signature verification
    validated_path: Option<PathBuf>,
}

impl PackageSessionData {
    /// Whether the resolver may substitute a different package for this one
    ///
    /// True iff the client consented to upgrades, or the package was not
    /// directly wanted, is not pinned, and could still be installed some way.
    pub fn allowed_to_supersede(&self, wanted: bool, potentially_installable: bool) -> bool {
        self.upgrade_as_needed
            || (!wanted && !self.do_not_supersede && potentially_installable)
    }

    /// The cached signature-validated local file, if one was recorded
    pub fn validated_path(&self) -> Option<&PathBuf> {
        self.validated_path.as_ref()
    }

    /// Record a local file that passed signature verification
    pub fn set_validated_path(&mut self, path: PathBuf) {
        self.validated_path = Some(path);
    }

    /// Forget the validated file (e.g. it disappeared from disk)
    pub fn clear_validated_path(&mut self) {
        self.validated_path = None;
    }
}

/// All per-request package state for one install request
///
/// Lives inside the request context and is dropped with it; packages
/// themselves never hold request state.
#[derive(Debug, Default)]
pub struct SessionDataMap {
    inner: Mutex<HashMap<CanonicalIdentity, PackageSessionData>>,
}

impl SessionDataMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the session data for a package (default if none recorded)
    pub fn read(&self, identity: &CanonicalIdentity) -> PackageSessionData {
        self.inner.lock().get(identity).cloned().unwrap_or_default()
    }

    /// Mutate the session data for a package in place
    pub fn update<R>(
        &self,
        identity: &CanonicalIdentity,
        f: impl FnOnce(&mut PackageSessionData) -> R,
    ) -> R {
        let mut inner = self.inner.lock();
        f(inner.entry(identity.clone()).or_default())
    }

    /// Identities of all packages this request superseded
    pub fn superseded_identities(&self) -> Vec<CanonicalIdentity> {
        self.inner
            .lock()
            .iter()
            .filter(|(_, data)| data.supersedent.is_some())
            .map(|(identity, _)| identity.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}
