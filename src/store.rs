// src/store.rs

//! Local package store
//!
//! A minimal on-disk store backing the daemon's installed-state probe and
//! install capability: package files land under `files/`, and a marker under
//! `installed/` records each completed install. Real package composition
//! (unpacking, links, registry writes) belongs to platform collaborators;
//! this store only tracks what has been installed.

use crate::error::{Error, Result};
use crate::identity::CanonicalIdentity;
use crate::orchestrator::Installer;
use crate::package::InstalledProbe;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Marker-file package store rooted at one directory
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory downloaded package files land in
    pub fn files_dir(&self) -> PathBuf {
        self.root.join("files")
    }

    fn installed_dir(&self) -> PathBuf {
        self.root.join("installed")
    }

    fn marker_path(&self, identity: &CanonicalIdentity) -> PathBuf {
        self.installed_dir().join(identity.to_string())
    }

    /// Create the store layout if it does not exist
    pub fn ensure_layout(&self) -> Result<()> {
        std::fs::create_dir_all(self.files_dir())?;
        std::fs::create_dir_all(self.installed_dir())?;
        Ok(())
    }

    /// Identities of everything recorded as installed
    pub fn installed_identities(&self) -> Result<Vec<CanonicalIdentity>> {
        let mut identities = Vec::new();
        let dir = self.installed_dir();
        if !dir.exists() {
            return Ok(identities);
        }
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(identity) = CanonicalIdentity::parse(name) {
                    identities.push(identity);
                }
            }
        }
        Ok(identities)
    }
}

impl InstalledProbe for LocalStore {
    fn probe_installed(&self, identity: &CanonicalIdentity) -> bool {
        self.marker_path(identity).exists()
    }
}

#[async_trait]
impl Installer for LocalStore {
    /// Copy the validated file into the store and record the install marker
    async fn install_package(&self, identity: &CanonicalIdentity, path: &Path) -> Result<()> {
        self.ensure_layout()?;
        let destination = self.files_dir().join(format!("{}.pkg", identity));
        if path != destination {
            tokio::fs::copy(path, &destination).await.map_err(|err| {
                Error::InstallFailed {
                    package: identity.to_string(),
                    reason: format!("copy into store failed: {}", err),
                }
            })?;
        }
        tokio::fs::write(self.marker_path(identity), b"")
            .await
            .map_err(|err| Error::InstallFailed {
                package: identity.to_string(),
                reason: format!("marker write failed: {}", err),
            })?;
        info!(package = %identity, "installed into local store");
        Ok(())
    }
}

/// Remove an install marker (used by removal flows and tests)
pub fn remove_marker(store: &LocalStore, identity: &CanonicalIdentity) -> Result<()> {
    let marker = store.marker_path(identity);
    if marker.exists() {
        std::fs::remove_file(marker)?;
        debug!(package = %identity, "removed install marker");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Architecture;
    use crate::version::PackageVersion;
    use tempfile::TempDir;

    fn identity(name: &str) -> CanonicalIdentity {
        CanonicalIdentity::new(
            name,
            PackageVersion::parse("1.0").unwrap(),
            Architecture::X86,
            "aa",
        )
    }

    #[tokio::test]
    async fn test_install_records_marker() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());
        store.ensure_layout().unwrap();

        let source = dir.path().join("app.pkg");
        std::fs::write(&source, b"payload").unwrap();

        let id = identity("app");
        assert!(!store.probe_installed(&id));
        store.install_package(&id, &source).await.unwrap();
        assert!(store.probe_installed(&id));
        assert!(store.files_dir().join(format!("{}.pkg", id)).exists());
    }

    #[tokio::test]
    async fn test_installed_identities_listing() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());
        store.ensure_layout().unwrap();

        let source = dir.path().join("app.pkg");
        std::fs::write(&source, b"payload").unwrap();
        store.install_package(&identity("app"), &source).await.unwrap();
        store.install_package(&identity("lib"), &source).await.unwrap();

        let mut names: Vec<String> = store
            .installed_identities()
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["app", "lib"]);
    }

    #[tokio::test]
    async fn test_remove_marker() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());
        store.ensure_layout().unwrap();

        let source = dir.path().join("app.pkg");
        std::fs::write(&source, b"payload").unwrap();
        let id = identity("app");
        store.install_package(&id, &source).await.unwrap();

        remove_marker(&store, &id).unwrap();
        assert!(!store.probe_installed(&id));
    }
}
