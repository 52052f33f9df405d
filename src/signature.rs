// src/signature.rs

//! Signature verification capability
//!
//! Physical verification is an external collaborator; the core only consumes
//! the `SignatureVerifier` trait. The helper here ties verification to the
//! per-request validated-path cache so each file is checked at most once per
//! install request.

use crate::package::{Package, SessionDataMap};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Capability that can vouch for a package file on disk
pub trait SignatureVerifier: Send + Sync {
    /// Whether the file carries a valid publisher signature
    fn has_valid_signature(&self, path: &Path) -> bool;

    /// The publisher name embedded in the signature, if readable
    fn publisher_name(&self, path: &Path) -> Option<String>;
}

/// The signature-validated local file for a package, if one exists
///
/// Consults the request's cached validated path first; a cached file that has
/// disappeared from disk is forgotten. On a cache miss the package's primary
/// local location is verified and, when it passes, recorded for the rest of
/// the request.
pub fn validated_local_path(
    package: &Package,
    session_data: &SessionDataMap,
    verifier: &dyn SignatureVerifier,
) -> Option<PathBuf> {
    let identity = package.identity();

    let cached = session_data.read(identity).validated_path().cloned();
    if let Some(path) = cached {
        if path.exists() {
            return Some(path);
        }
        session_data.update(identity, |d| d.clear_validated_path());
    }

    let candidate = package.local_location()?;
    if verifier.has_valid_signature(&candidate) {
        session_data.update(identity, |d| d.set_validated_path(candidate.clone()));
        Some(candidate)
    } else {
        debug!(package = %identity, path = %candidate.display(), "signature check failed");
        None
    }
}

/// Verifier that accepts any file that exists
///
/// Stands in where a deployment has not plugged a platform signature
/// verifier; the capability seam stays in place either way.
pub struct PermissiveVerifier;

impl SignatureVerifier for PermissiveVerifier {
    fn has_valid_signature(&self, path: &Path) -> bool {
        path.exists()
    }

    fn publisher_name(&self, _path: &Path) -> Option<String> {
        None
    }
}

/// SHA-256 digest of a file, hex encoded
pub fn file_digest(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Architecture, CanonicalIdentity};
    use crate::version::PackageVersion;

    /// Verifier that accepts everything
    struct AcceptAll;

    impl SignatureVerifier for AcceptAll {
        fn has_valid_signature(&self, _path: &Path) -> bool {
            true
        }

        fn publisher_name(&self, _path: &Path) -> Option<String> {
            Some("Test Publisher".to_string())
        }
    }

    struct RejectAll;

    impl SignatureVerifier for RejectAll {
        fn has_valid_signature(&self, _path: &Path) -> bool {
            false
        }

        fn publisher_name(&self, _path: &Path) -> Option<String> {
            None
        }
    }

    fn package_with_file(dir: &Path) -> Package {
        let identity = CanonicalIdentity::new(
            "app",
            PackageVersion::parse("1.0").unwrap(),
            Architecture::X86,
            "aa",
        );
        let package = Package::new(identity);
        let path = dir.join("app.pkg");
        std::fs::write(&path, b"payload").unwrap();
        package.add_local_location(path);
        package
    }

    #[test]
    fn test_validated_path_cached_per_request() {
        let dir = tempfile::tempdir().unwrap();
        let package = package_with_file(dir.path());
        let data = SessionDataMap::new();

        let first = validated_local_path(&package, &data, &AcceptAll).unwrap();
        // Second lookup comes from the cache even with a rejecting verifier.
        let second = validated_local_path(&package, &data, &RejectAll).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_rejected_signature_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let package = package_with_file(dir.path());
        let data = SessionDataMap::new();

        assert!(validated_local_path(&package, &data, &RejectAll).is_none());
    }

    #[test]
    fn test_stale_cache_entry_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let package = package_with_file(dir.path());
        let data = SessionDataMap::new();

        let path = validated_local_path(&package, &data, &AcceptAll).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert!(validated_local_path(&package, &data, &RejectAll).is_none());
    }

    #[test]
    fn test_file_digest_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"abc").unwrap();
        let digest = file_digest(&path).unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
