// src/version.rs

//! Four-part package versions and binding policy ranges
//!
//! Versions are ordered quadruples (`major.minor.build.revision`). A package
//! may additionally carry a `BindingPolicy`: the version range for which it is
//! considered binary-compatible with earlier releases. The supersedence rules
//! in the resolver are defined entirely in terms of these two types.

use crate::error::{Error, Result};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A four-part package version
///
/// Missing trailing parts parse as zero, so "1.2" == "1.2.0.0".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PackageVersion {
    pub major: u16,
    pub minor: u16,
    pub build: u16,
    pub revision: u16,
}

impl PackageVersion {
    /// Create a version from its four components
    pub fn new(major: u16, minor: u16, build: u16, revision: u16) -> Self {
        Self {
            major,
            minor,
            build,
            revision,
        }
    }

    /// Parse a version string
    ///
    /// Accepts one to four dot-separated numeric parts:
    /// - "2" → 2.0.0.0
    /// - "1.5" → 1.5.0.0
    /// - "1.2.3.4" → 1.2.3.4
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidVersion(s.to_string()));
        }

        let mut parts = [0u16; 4];
        let mut count = 0;
        for piece in s.split('.') {
            if count == 4 {
                return Err(Error::InvalidVersion(s.to_string()));
            }
            parts[count] = piece
                .parse::<u16>()
                .map_err(|_| Error::InvalidVersion(s.to_string()))?;
            count += 1;
        }

        Ok(Self {
            major: parts[0],
            minor: parts[1],
            build: parts[2],
            revision: parts[3],
        })
    }

    /// The zero version, ordered before every other version
    pub const ZERO: PackageVersion = PackageVersion {
        major: 0,
        minor: 0,
        build: 0,
        revision: 0,
    };

    /// The highest representable version
    pub const MAX: PackageVersion = PackageVersion {
        major: u16::MAX,
        minor: u16::MAX,
        build: u16::MAX,
        revision: u16::MAX,
    };
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

impl FromStr for PackageVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for PackageVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PackageVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct VersionVisitor;

        impl Visitor<'_> for VersionVisitor {
            type Value = PackageVersion;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a dotted four-part version string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
                PackageVersion::parse(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(VersionVisitor)
    }
}

/// The version range a package declares itself binary-compatible with
///
/// A package whose binding policy contains an installed package's version is
/// an *update* for it: it may silently replace the older package as current.
/// Versions above the range are *upgrades* and need explicit client consent.
/// Set once from package metadata, never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingPolicy {
    pub minimum: PackageVersion,
    pub maximum: PackageVersion,
}

impl BindingPolicy {
    /// Create a policy covering `[minimum, maximum]`, normalizing a reversed
    /// range so the invariant `minimum <= maximum` always holds
    pub fn new(minimum: PackageVersion, maximum: PackageVersion) -> Self {
        if minimum <= maximum {
            Self { minimum, maximum }
        } else {
            Self {
                minimum: maximum,
                maximum: minimum,
            }
        }
    }

    /// Check whether a version falls inside this policy's range (inclusive)
    pub fn contains(&self, version: PackageVersion) -> bool {
        self.minimum <= version && version <= self.maximum
    }
}

impl fmt::Display for BindingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.minimum, self.maximum)
    }
}

/// Compare two versions, provided for callers holding references
pub fn compare(a: &PackageVersion, b: &PackageVersion) -> Ordering {
    a.cmp(b)
}
