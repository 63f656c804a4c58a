//! Per-package-id discovery resolvers.
//!
//! Three protocol variants sit behind one contract: a flat
//! "package-base-address" index, an OData paged feed, and a registration
//! dependency service. Each memoizes discovery per package id so N
//! concurrent callers asking about the same id trigger exactly one network
//! discovery sequence.

use async_trait::async_trait;
use semver::Version;
use std::collections::BTreeMap;
use tokio::io::AsyncWrite;

use crate::error::Result;
use crate::records::{DependencyInfo, PackageRecord};

mod flat;
mod odata;
mod registration;

pub use flat::FlatIndexResolver;
pub use odata::ODataResolver;
pub use registration::{DependencyProvider, RegistrationResolver};

/// Every version discovered for an id, ordered by version.
///
/// Duplicate versions within a discovery are collapsed first-wins.
pub type PackageSet = BTreeMap<Version, PackageRecord>;

/// Finds package versions, dependency metadata, and archives by package id.
///
/// Ids are matched case-insensitively. "Not found" is never an error: an
/// unknown id yields an empty version list, and an absent version yields
/// `None`/`false` from the per-version operations.
#[async_trait]
pub trait FindPackageById: Send + Sync {
    /// Returns all versions of `id` known to the source, in ascending order.
    async fn all_versions(&self, id: &str) -> Result<Vec<Version>>;

    /// Returns the dependency metadata of `id`/`version`, or `None` if the
    /// version is absent from the source.
    async fn dependency_info(&self, id: &str, version: &Version)
        -> Result<Option<DependencyInfo>>;

    /// Copies the archive of `id`/`version` into `destination`, returning
    /// whether the version existed.
    async fn copy_archive(
        &self,
        id: &str,
        version: &Version,
        destination: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<bool>;

    /// Returns whether `id`/`version` exists at the source.
    async fn package_exists(&self, id: &str, version: &Version) -> Result<bool>;
}
