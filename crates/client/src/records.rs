//! Value types describing discovered packages.

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

/// One discovered package version and where its archive lives.
///
/// The id is the server-reported one where the protocol provides it, falling
/// back to the id the caller queried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    /// The package id.
    pub id: String,
    /// The package version.
    pub version: Version,
    /// The URL of the package archive.
    pub content_url: String,
}

/// Normalized dependency metadata extracted from a package manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyInfo {
    /// The package id.
    pub id: String,
    /// The package version.
    pub version: Version,
    /// The dependency groups of the package.
    pub groups: Vec<DependencyGroup>,
}

/// The dependencies of a package for one target, or for any target when
/// `target` is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyGroup {
    /// The target framework the group applies to.
    pub target: Option<String>,
    /// The dependencies in the group.
    pub dependencies: Vec<Dependency>,
}

/// A single dependency edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// The id of the depended-on package.
    pub id: String,
    /// The version range satisfying the dependency.
    pub range: VersionReq,
}
