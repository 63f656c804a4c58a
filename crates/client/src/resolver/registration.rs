//! Resolver backed by a registration/dependency service.
//!
//! Sources of this kind expose a higher-level endpoint that returns
//! pre-resolved package records directly, so this resolver does no protocol
//! walking of its own: discovery is delegated to an injected provider, and
//! the resolver's responsibility is memoization and archive materialization.

use async_trait::async_trait;
use semver::Version;
use std::sync::Arc;
use tokio::io::AsyncWrite;

use super::{FindPackageById, PackageSet};
use crate::error::Result;
use crate::http::HttpSource;
use crate::memo::SingleFlight;
use crate::nupkg::{ArchiveReader, NupkgDownloader};
use crate::records::{DependencyInfo, PackageRecord};

/// Resolves every package record for an id against a registration service.
///
/// Implemented by the registration resource collaborator; the wire schema of
/// the service is outside this crate.
#[async_trait]
pub trait DependencyProvider: Send + Sync {
    /// Returns every known record for `id`; an unknown id yields an empty
    /// list.
    async fn resolve_packages(&self, id: &str) -> anyhow::Result<Vec<PackageRecord>>;
}

/// A [`FindPackageById`] resolver over a registration service.
pub struct RegistrationResolver {
    provider: Arc<dyn DependencyProvider>,
    downloader: NupkgDownloader,
    archive_reader: Arc<dyn ArchiveReader>,
    packages: SingleFlight<String, PackageSet>,
}

impl RegistrationResolver {
    /// Creates a resolver delegating discovery to `provider` and fetching
    /// archives through `http`.
    pub fn new(
        provider: Arc<dyn DependencyProvider>,
        http: Arc<HttpSource>,
        archive_reader: Arc<dyn ArchiveReader>,
    ) -> Self {
        Self {
            provider,
            downloader: NupkgDownloader::new(http),
            archive_reader,
            packages: SingleFlight::new(),
        }
    }

    async fn ensure_packages(&self, id: &str) -> Result<Arc<PackageSet>> {
        let provider = self.provider.clone();
        let queried = id.to_string();
        self.packages
            .get_or_run(id.to_lowercase(), move || async move {
                let records = provider
                    .resolve_packages(&queried)
                    .await
                    .map_err(crate::Error::Other)?;

                let mut set = PackageSet::new();
                for record in records {
                    set.entry(record.version.clone()).or_insert(record);
                }
                Ok(set)
            })
            .await
    }
}

#[async_trait]
impl FindPackageById for RegistrationResolver {
    async fn all_versions(&self, id: &str) -> Result<Vec<Version>> {
        let packages = self.ensure_packages(id).await?;
        Ok(packages.keys().cloned().collect())
    }

    async fn dependency_info(
        &self,
        id: &str,
        version: &Version,
    ) -> Result<Option<DependencyInfo>> {
        let packages = self.ensure_packages(id).await?;
        match packages.get(version) {
            Some(record) => Ok(Some(
                self.downloader
                    .dependency_info(record, self.archive_reader.as_ref())
                    .await?,
            )),
            None => Ok(None),
        }
    }

    async fn copy_archive(
        &self,
        id: &str,
        version: &Version,
        destination: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<bool> {
        let packages = self.ensure_packages(id).await?;
        match packages.get(version) {
            Some(record) => {
                self.downloader.copy_to(record, destination).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn package_exists(&self, id: &str, version: &Version) -> Result<bool> {
        let packages = self.ensure_packages(id).await?;
        Ok(packages.contains_key(version))
    }
}
