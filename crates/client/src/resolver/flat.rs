//! Resolver for flat "package-base-address" indexes.
//!
//! Sources of this kind lay files out as
//! `{base}/{id}/index.json` listing every version, with archives at
//! `{base}/{id}/{version}/{id}.{version}.nupkg`, all lowercase. Knowing
//! where an archive lives therefore requires no further network call.

use anyhow::{anyhow, Context};
use semver::Version;
use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWrite;

use super::{FindPackageById, PackageSet};
use crate::error::{Error, Result};
use crate::http::{FetchRequest, FetchResult, HttpSource};
use crate::memo::SingleFlight;
use crate::nupkg::{ArchiveReader, NupkgDownloader};
use crate::records::{DependencyInfo, PackageRecord};
use crate::retry::{with_retries, DEFAULT_MAX_ATTEMPTS};
use crate::source_url::SourceUrl;

/// Mirrors beyond this count would never be reached by the retry policy.
const MAX_MIRRORS: usize = 3;

/// A [`FindPackageById`] resolver over a flat package index.
pub struct FlatIndexResolver {
    mirrors: Arc<Vec<SourceUrl>>,
    http: Arc<HttpSource>,
    downloader: NupkgDownloader,
    archive_reader: Arc<dyn ArchiveReader>,
    packages: SingleFlight<String, PackageSet>,
    tolerate_failure: bool,
    poisoned: AtomicBool,
}

impl FlatIndexResolver {
    /// Creates a resolver over the given mirror base URLs.
    ///
    /// At least one mirror is required; at most three are used.
    pub fn new(
        mirrors: Vec<SourceUrl>,
        http: Arc<HttpSource>,
        archive_reader: Arc<dyn ArchiveReader>,
    ) -> Result<Self> {
        if mirrors.is_empty() {
            return Err(Error::Other(anyhow!(
                "at least one base URL must be specified"
            )));
        }

        Ok(Self {
            mirrors: Arc::new(mirrors.into_iter().take(MAX_MIRRORS).collect()),
            downloader: NupkgDownloader::new(http.clone()),
            http,
            archive_reader,
            packages: SingleFlight::new(),
            tolerate_failure: false,
            poisoned: AtomicBool::new(false),
        })
    }

    /// Downgrades a final discovery failure to an empty result with a
    /// warning instead of an error.
    ///
    /// Once a failure has been downgraded, every later discovery for this
    /// resolver instance short-circuits to empty as well, even if the source
    /// recovers.
    pub fn tolerate_failure(mut self, tolerate: bool) -> Self {
        self.tolerate_failure = tolerate;
        self
    }

    async fn ensure_packages(&self, id: &str) -> Result<Arc<PackageSet>> {
        if self.tolerate_failure && self.poisoned.load(Ordering::Relaxed) {
            return Ok(Arc::new(PackageSet::new()));
        }

        let key = id.to_lowercase();
        let mirrors = self.mirrors.clone();
        let http = self.http.clone();
        let queried = id.to_string();
        let result = self
            .packages
            .get_or_run(key.clone(), move || discover(mirrors, http, queried, key))
            .await;

        match result {
            Err(err) if self.tolerate_failure => {
                tracing::warn!("ignoring failed discovery of package `{id}`: {err}");
                self.poisoned.store(true, Ordering::Relaxed);
                Ok(Arc::new(PackageSet::new()))
            }
            other => other,
        }
    }
}

async fn discover(
    mirrors: Arc<Vec<SourceUrl>>,
    http: Arc<HttpSource>,
    queried_id: String,
    id_lower: String,
) -> Result<PackageSet> {
    let what = format!("package `{queried_id}`");
    let result = with_retries(&what, DEFAULT_MAX_ATTEMPTS, |attempt| {
        let base = mirrors[attempt % mirrors.len()].clone();
        let http = http.clone();
        let id_lower = id_lower.clone();
        let queried_id = queried_id.clone();
        async move {
            let url = base.join(&format!("{id_lower}/index.json"));
            let mut request = FetchRequest::new(url.clone(), format!("list_{id_lower}"));
            request.ignore_not_found = true;
            request.accept = Some("application/json");
            request.ensure_valid = Some(validate_json);

            match http.fetch(request).await? {
                // An id with no matching packages is an empty result, not an
                // error.
                FetchResult::NotFound => Ok(PackageSet::new()),
                FetchResult::Cached(file) => {
                    let path = file.path().to_path_buf();
                    let bytes = file.bytes().await?;
                    parse_flat_index(&bytes, &queried_id, &base).map_err(|source| {
                        tracing::warn!(
                            "the file `{path}` is corrupt",
                            path = path.display()
                        );
                        Error::Malformed { url, source }
                    })
                }
            }
        }
    })
    .await;

    result.map_err(|source| Error::RetrievalFailed {
        url: mirrors[(DEFAULT_MAX_ATTEMPTS - 1) % mirrors.len()]
            .join(&format!("{id_lower}/index.json")),
        id: queried_id,
        source: Box::new(source),
    })
}

#[derive(Deserialize)]
struct FlatIndex {
    #[serde(default)]
    versions: Vec<String>,
}

fn parse_flat_index(bytes: &[u8], id: &str, base: &SourceUrl) -> anyhow::Result<PackageSet> {
    let doc: FlatIndex =
        serde_json::from_slice(bytes).context("invalid package index document")?;

    let mut set = PackageSet::new();
    for raw in doc.versions {
        let version = match Version::parse(&raw) {
            Ok(version) => version,
            Err(err) => {
                tracing::warn!("ignoring unparsable version `{raw}` of package `{id}`: {err}");
                continue;
            }
        };
        let content_url = archive_url(base, id, &version);
        set.entry(version.clone()).or_insert_with(|| PackageRecord {
            id: id.to_string(),
            version,
            content_url,
        });
    }

    Ok(set)
}

fn archive_url(base: &SourceUrl, id: &str, version: &Version) -> String {
    let id = id.to_lowercase();
    base.join(&format!("{id}/{version}/{id}.{version}.nupkg"))
}

fn validate_json(path: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::open(path)?;
    serde_json::from_reader::<_, serde::de::IgnoredAny>(std::io::BufReader::new(file))?;
    Ok(())
}

#[async_trait::async_trait]
impl FindPackageById for FlatIndexResolver {
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
