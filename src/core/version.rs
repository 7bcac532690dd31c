//! Version compatibility between source and destination installations.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::IntegrityError;

// MAJOR.MINOR.PATCH[-PRERELEASE][+BUILD]
static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\.(\d+)\.(\d+)(?:-([0-9A-Za-z-]+(?:\.[0-9A-Za-z-]+)*))?(?:\+[0-9A-Za-z-]+(?:\.[0-9A-Za-z-]+)*)?$")
        .expect("version pattern is valid")
});

/// Granularity at which two versions must agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionMatching {
    #[default]
    Exact,
    Major,
    Minor,
    Patch,
    Ignore,
}

impl VersionMatching {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Major => "major",
            Self::Minor => "minor",
            Self::Patch => "patch",
            Self::Ignore => "ignore",
        }
    }
}

impl fmt::Display for VersionMatching {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed semantic version. Build metadata is accepted and dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub prerelease: Option<String>,
}

impl Version {
    pub fn parse(input: &str) -> Option<Self> {
        let caps = VERSION_RE.captures(input)?;
        Some(Self {
            major: caps.get(1)?.as_str().parse().ok()?,
            minor: caps.get(2)?.as_str().parse().ok()?,
            patch: caps.get(3)?.as_str().parse().ok()?,
            prerelease: caps.get(4).map(|m| m.as_str().to_string()),
        })
    }
}

/// Check that `source` and `destination` are compatible under `matching`.
///
/// `exact` compares the raw strings, so malformed input simply mismatches.
/// `major`, `minor` and `patch` compare numeric fields up to the named
/// granularity and reject any prerelease on either side.
pub fn check_versions(
    source: &str,
    destination: &str,
    matching: VersionMatching,
) -> Result<(), IntegrityError> {
    let fail = |reason: String| IntegrityError::IncompatibleVersions {
        source_version: source.to_string(),
        destination_version: destination.to_string(),
        matching,
        reason,
    };

    match matching {
        VersionMatching::Ignore => Ok(()),
        VersionMatching::Exact => {
            if source == destination {
                Ok(())
            } else {
                Err(fail("versions are not identical".to_string()))
            }
        }
        VersionMatching::Major | VersionMatching::Minor | VersionMatching::Patch => {
            let src = Version::parse(source)
                .ok_or_else(|| fail(format!("'{}' is not a valid version", source)))?;
            let dst = Version::parse(destination)
                .ok_or_else(|| fail(format!("'{}' is not a valid version", destination)))?;

            if src.prerelease.is_some() || dst.prerelease.is_some() {
                return Err(fail(
                    "prerelease versions are only compatible under exact matching".to_string(),
                ));
            }

            if src.major != dst.major {
                return Err(fail("major versions differ".to_string()));
            }
            if matching != VersionMatching::Major && src.minor != dst.minor {
                return Err(fail("minor versions differ".to_string()));
            }
            if matching == VersionMatching::Patch && src.patch != dst.patch {
                return Err(fail("patch versions differ".to_string()));
            }
            Ok(())
        }
    }
}
