// src/resolver/plan.rs

//! Resolved install plans
//!
//! An `InstallGraph` is the ordered, identity-deduplicated sequence of
//! packages one resolution produced: dependencies before dependents. Plans
//! are computed fresh on every resolution attempt and never persisted.

use crate::identity::CanonicalIdentity;
use crate::package::{Package, SessionDataMap};
use crate::signature::{SignatureVerifier, validated_local_path};
use std::collections::HashSet;
use std::sync::Arc;

/// The ordered set of packages one install request must install
#[derive(Debug, Clone, Default)]
pub struct InstallGraph {
    packages: Vec<Arc<Package>>,
}

impl InstallGraph {
    /// Build a plan from a resolution sequence, dropping duplicate
    /// identities while keeping the first (deepest-dependency) occurrence
    pub fn from_sequence(sequence: Vec<Arc<Package>>) -> Self {
        let mut seen: HashSet<CanonicalIdentity> = HashSet::new();
        let mut packages = Vec::with_capacity(sequence.len());
        for package in sequence {
            if seen.insert(package.identity().clone()) {
                packages.push(package);
            }
        }
        Self { packages }
    }

    pub fn packages(&self) -> &[Arc<Package>] {
        &self.packages
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Package>> {
        self.packages.iter()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn identities(&self) -> Vec<CanonicalIdentity> {
        self.packages
            .iter()
            .map(|p| p.identity().clone())
            .collect()
    }

    /// Split the plan into packages with a signature-validated local file
    /// and packages still missing one
    pub fn partition_missing(
        &self,
        session_data: &SessionDataMap,
        verifier: &dyn SignatureVerifier,
    ) -> (Vec<Arc<Package>>, Vec<Arc<Package>>) {
        let mut ready = Vec::new();
        let mut missing = Vec::new();
        for package in &self.packages {
            if validated_local_path(package, session_data, verifier).is_some() {
                ready.push(package.clone());
            } else {
                missing.push(package.clone());
            }
        }
        (ready, missing)
    }
}

impl IntoIterator for InstallGraph {
    type Item = Arc<Package>;
    type IntoIter = std::vec::IntoIter<Arc<Package>>;

    fn into_iter(self) -> Self::IntoIter {
        self.packages.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Architecture;
    use crate::version::PackageVersion;

    fn package(name: &str) -> Arc<Package> {
        Arc::new(Package::new(CanonicalIdentity::new(
            name,
            PackageVersion::parse("1.0").unwrap(),
            Architecture::X86,
            "aa",
        )))
    }

    #[test]
    fn test_dedup_keeps_first_occurrence() {
        let lib = package("lib");
        let app = package("app");
        let graph =
            InstallGraph::from_sequence(vec![lib.clone(), app.clone(), lib.clone()]);

        assert_eq!(graph.len(), 2);
        assert_eq!(graph.packages()[0].name(), "lib");
        assert_eq!(graph.packages()[1].name(), "app");
    }

    #[test]
    fn test_partition_missing() {
        struct AcceptAll;
        impl SignatureVerifier for AcceptAll {
            fn has_valid_signature(&self, _path: &std::path::Path) -> bool {
                true
            }
            fn publisher_name(&self, _path: &std::path::Path) -> Option<String> {
                None
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let present = package("present");
        let file = dir.path().join("present.pkg");
        std::fs::write(&file, b"pkg").unwrap();
        present.add_local_location(file);
        let absent = package("absent");

        let graph = InstallGraph::from_sequence(vec![present, absent]);
        let data = SessionDataMap::new();
        let (ready, missing) = graph.partition_missing(&data, &AcceptAll);

        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].name(), "present");
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].name(), "absent");
    }
}
