// src/identity.rs

//! Canonical package identity
//!
//! A package is identified by the quadruple name, four-part version, target
//! architecture, and publisher key token. Identities are immutable once
//! constructed and serve as the process-wide registry key. Two identities
//! belong to the same *family* when every field but the version matches;
//! supersedence is only ever decided within a family.

use crate::error::{Error, Result};
use crate::version::PackageVersion;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Target architecture of a package
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Architecture {
    X86,
    X64,
    Arm64,
    /// Architecture-neutral package
    Any,
    /// An architecture string this build does not recognize
    Other(String),
}

impl Architecture {
    /// Parse an architecture token
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "x86" => Architecture::X86,
            "x64" | "amd64" => Architecture::X64,
            "arm64" | "aarch64" => Architecture::Arm64,
            "any" | "noarch" => Architecture::Any,
            other => Architecture::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Architecture::X86 => "x86",
            Architecture::X64 => "x64",
            Architecture::Arm64 => "arm64",
            Architecture::Any => "any",
            Architecture::Other(s) => s,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The immutable canonical identity of a package
///
/// Rendered as `name-version-architecture-publickeytoken`, for example
/// `app-1.0.0.0-x86-1e373a58e25250cb`. The name itself may contain dashes;
/// parsing splits the three trailing fields off the right-hand side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalIdentity {
    pub name: String,
    pub version: PackageVersion,
    pub architecture: Architecture,
    pub public_key_token: String,
}

impl CanonicalIdentity {
    pub fn new(
        name: impl Into<String>,
        version: PackageVersion,
        architecture: Architecture,
        public_key_token: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version,
            architecture,
            public_key_token: public_key_token.into(),
        }
    }

    /// Parse a canonical identity string
    ///
    /// The last three dash-separated fields are the key token, architecture,
    /// and version; everything before them is the (possibly dashed) name.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidIdentity {
            identity: s.to_string(),
            reason: reason.to_string(),
        };

        let (rest, token) = s.rsplit_once('-').ok_or_else(|| invalid("missing key token"))?;
        let (rest, arch) = rest
            .rsplit_once('-')
            .ok_or_else(|| invalid("missing architecture"))?;
        let (name, version) = rest
            .rsplit_once('-')
            .ok_or_else(|| invalid("missing version"))?;

        if name.is_empty() {
            return Err(invalid("empty name"));
        }
        if token.is_empty() {
            return Err(invalid("empty key token"));
        }

        let version = PackageVersion::parse(version)
            .map_err(|_| invalid("unparsable version field"))?;

        Ok(Self {
            name: name.to_string(),
            version,
            architecture: Architecture::parse(arch),
            public_key_token: token.to_string(),
        })
    }

    /// True when `other` is another version of this same package: name,
    /// architecture, and publisher key token all match
    pub fn is_same_family(&self, other: &CanonicalIdentity) -> bool {
        self.name == other.name
            && self.architecture == other.architecture
            && self.public_key_token == other.public_key_token
    }

}

impl fmt::Display for CanonicalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.name, self.version, self.architecture, self.public_key_token
        )
    }
}

impl FromStr for CanonicalIdentity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Ord for CanonicalIdentity {
    /// Identities sort by family first, then by version, so a sorted family
    /// slice runs oldest to newest
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.architecture.cmp(&other.architecture))
            .then_with(|| self.public_key_token.cmp(&other.public_key_token))
            .then_with(|| self.version.cmp(&other.version))
    }
}

impl PartialOrd for CanonicalIdentity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for CanonicalIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CanonicalIdentity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct IdentityVisitor;

        impl Visitor<'_> for IdentityVisitor {
            type Value = CanonicalIdentity;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a canonical identity string (name-version-arch-token)")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
                CanonicalIdentity::parse(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(IdentityVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple() {
        let id = CanonicalIdentity::parse("app-1.0.0.0-x86-1e373a58e25250cb").unwrap();
        assert_eq!(id.name, "app");
        assert_eq!(id.version, PackageVersion::new(1, 0, 0, 0));
        assert_eq!(id.architecture, Architecture::X86);
        assert_eq!(id.public_key_token, "1e373a58e25250cb");
    }

    #[test]
    fn test_parse_dashed_name() {
        let id = CanonicalIdentity::parse("my-cool-lib-2.5.0.0-x64-abcdef0123456789").unwrap();
        assert_eq!(id.name, "my-cool-lib");
        assert_eq!(id.version, PackageVersion::new(2, 5, 0, 0));
        assert_eq!(id.architecture, Architecture::X64);
    }

    #[test]
    fn test_parse_rejects_short_forms() {
        assert!(CanonicalIdentity::parse("app").is_err());
        assert!(CanonicalIdentity::parse("app-1.0").is_err());
        assert!(CanonicalIdentity::parse("app-1.0-x86").is_err());
        assert!(CanonicalIdentity::parse("-1.0-x86-abc").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        let s = "app-1.2.3.4-arm64-0011223344556677";
        let id = CanonicalIdentity::parse(s).unwrap();
        assert_eq!(id.to_string(), s);
    }

    #[test]
    fn test_same_family() {
        let a = CanonicalIdentity::parse("lib-1.0.0.0-x86-aa").unwrap();
        let b = CanonicalIdentity::parse("lib-2.0.0.0-x86-aa").unwrap();
        let c = CanonicalIdentity::parse("lib-1.0.0.0-x64-aa").unwrap();
        let d = CanonicalIdentity::parse("lib-1.0.0.0-x86-bb").unwrap();

        assert!(a.is_same_family(&b));
        assert!(!a.is_same_family(&c));
        assert!(!a.is_same_family(&d));
    }

    #[test]
    fn test_family_ordering_by_version() {
        let mut family = vec![
            CanonicalIdentity::parse("lib-2.0.0.0-x86-aa").unwrap(),
            CanonicalIdentity::parse("lib-1.0.0.0-x86-aa").unwrap(),
            CanonicalIdentity::parse("lib-1.5.0.0-x86-aa").unwrap(),
        ];
        family.sort();
        let versions: Vec<String> = family.iter().map(|i| i.version.to_string()).collect();
        assert_eq!(versions, vec!["1.0.0.0", "1.5.0.0", "2.0.0.0"]);
    }

    #[test]
    fn test_architecture_aliases() {
        assert_eq!(Architecture::parse("amd64"), Architecture::X64);
        assert_eq!(Architecture::parse("AARCH64"), Architecture::Arm64);
        assert_eq!(Architecture::parse("noarch"), Architecture::Any);
        assert_eq!(
            Architecture::parse("mips"),
            Architecture::Other("mips".to_string())
        );
    }
}
