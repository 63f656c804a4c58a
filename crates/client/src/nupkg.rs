//! Materializing package archives and extracting their dependency metadata.

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;

use crate::error::{Error, Result};
use crate::http::{FetchRequest, FetchResult, HttpSource};
use crate::lock::with_file_lock;
use crate::memo::SingleFlight;
use crate::records::{DependencyInfo, PackageRecord};
use crate::retry::{with_retries, DEFAULT_MAX_ATTEMPTS};

/// Archives for a given version never change, so the cache is trusted for a
/// long time.
pub const ARCHIVE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Extracts dependency metadata from a downloaded package archive.
///
/// The archive/manifest format itself is outside this crate; callers plug in
/// a reader for it.
pub trait ArchiveReader: Send + Sync {
    /// Reads the embedded manifest of the archive at `path` and returns its
    /// normalized dependency information.
    fn read_dependency_info(&self, path: &Path) -> anyhow::Result<DependencyInfo>;
}

/// Obtains package archives as cached local files.
///
/// Materialization is memoized per content URI (not per id/version, since
/// multiple version aliases can resolve to the same content): N concurrent
/// callers for one archive trigger exactly one download.
pub struct NupkgDownloader {
    http: Arc<HttpSource>,
    materialized: SingleFlight<String, PathBuf>,
}

impl NupkgDownloader {
    /// Creates a downloader fetching through the given source.
    pub fn new(http: Arc<HttpSource>) -> Self {
        Self {
            http,
            materialized: SingleFlight::new(),
        }
    }

    /// Ensures the archive for `record` is present in the local cache and
    /// returns its path.
    pub async fn materialize(&self, record: &PackageRecord) -> Result<Arc<PathBuf>> {
        let http = self.http.clone();
        let record = record.clone();
        self.materialized
            .get_or_run(record.content_url.clone(), move || async move {
                let cache_key = format!(
                    "nupkg_{id}.{version}",
                    id = record.id.to_lowercase(),
                    version = record.version
                );

                let what = format!("archive `{url}`", url = record.content_url);
                let fetched = with_retries(&what, DEFAULT_MAX_ATTEMPTS, |_| {
                    let http = http.clone();
                    let mut request =
                        FetchRequest::new(record.content_url.clone(), cache_key.clone());
                    request.ttl = ARCHIVE_TTL;
                    async move { http.fetch(request).await }
                })
                .await?;

                match fetched {
                    FetchResult::Cached(file) => Ok(file.path().to_path_buf()),
                    // ignore_not_found is off for archives, so a 404 has
                    // already surfaced as a status error.
                    FetchResult::NotFound => Err(Error::Status {
                        status: 404,
                        url: record.content_url.clone(),
                    }),
                }
            })
            .await
    }

    /// Streams the archive for `record` into `destination`.
    ///
    /// The materialized file is re-opened under its file lock so a
    /// concurrent fetch of the same entry cannot delete it mid-copy.
    pub async fn copy_to(
        &self,
        record: &PackageRecord,
        destination: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        let path = self.materialize(record).await?;
        with_file_lock(&path, async {
            let mut file = tokio::fs::File::open(path.as_path())
                .await
                .with_context(|| format!("failed to open `{path}`", path = path.display()))?;
            tokio::io::copy(&mut file, destination)
                .await
                .with_context(|| format!("failed to copy `{path}`", path = path.display()))?;
            Ok(())
        })
        .await
    }

    /// Extracts dependency metadata from the archive for `record`.
    ///
    /// A failed extraction is reported as a corrupt-package error naming the
    /// cache file, and is not retried: a server-side corruption would just
    /// be fetched and cached again.
    pub async fn dependency_info(
        &self,
        record: &PackageRecord,
        reader: &dyn ArchiveReader,
    ) -> Result<DependencyInfo> {
        let path = self.materialize(record).await?;
        with_file_lock(&path, async {
            reader
                .read_dependency_info(&path)
                .map_err(|source| Error::CorruptPackage {
                    path: path.to_path_buf(),
                    source,
                })
        })
        .await
    }
}
