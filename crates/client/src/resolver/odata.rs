//! Resolver for OData package feeds.
//!
//! Discovery walks `FindPackagesById()?id='{id}'`, an Atom feed whose
//! entries carry the server-reported id and version plus the archive URL in
//! the `content` element, following `rel="next"` links until the last page.
//! Pages are cached independently, so a page fetched within its TTL window
//! can outlive a shrinking version list upstream; that staleness window is
//! accepted by design.

use anyhow::{anyhow, Context};
use quick_xml::events::Event;
use quick_xml::Reader;
use semver::Version;
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

/// A [`FindPackageById`] resolver over an OData paged feed.
pub struct ODataResolver {
    mirrors: Arc<Vec<SourceUrl>>,
    http: Arc<HttpSource>,
    downloader: NupkgDownloader,
    archive_reader: Arc<dyn ArchiveReader>,
    packages: SingleFlight<String, PackageSet>,
    tolerate_failure: bool,
    poisoned: AtomicBool,
}

impl ODataResolver {
    /// Creates a resolver over the given mirror base URLs.
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
            mirrors: Arc::new(mirrors),
            downloader: NupkgDownloader::new(http.clone()),
            http,
            archive_reader,
            packages: SingleFlight::new(),
            tolerate_failure: false,
            poisoned: AtomicBool::new(false),
        })
    }

    /// Downgrades a final discovery failure to an empty result with a
    /// warning instead of an error; see
    /// [`FlatIndexResolver::tolerate_failure`](super::FlatIndexResolver::tolerate_failure).
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
            let mut set = PackageSet::new();
            let mut page = 1usize;
            let mut next = Some(base.join(&format!("FindPackagesById()?id='{queried_id}'")));

            // Pages are fetched and appended strictly in server-declared
            // order; the first occurrence of a version wins.
            while let Some(url) = next.take() {
                let mut request =
                    FetchRequest::new(url.clone(), format!("list_{id_lower}_page{page}"));
                request.ignore_not_found = true;
                request.accept = Some("application/atom+xml");
                request.ensure_valid = Some(validate_xml);

                match http.fetch(request).await? {
                    FetchResult::NotFound => break,
                    FetchResult::Cached(file) => {
                        let path = file.path().to_path_buf();
                        let bytes = file.bytes().await?;
                        let text = String::from_utf8_lossy(&bytes).into_owned();
                        let parsed = parse_feed(&text, &queried_id).map_err(|source| {
                            tracing::warn!("the file `{path}` is corrupt", path = path.display());
                            Error::Malformed {
                                url: url.clone(),
                                source,
                            }
                        })?;

                        for record in parsed.records {
                            set.entry(record.version.clone()).or_insert(record);
                        }
                        next = parsed.next;
                        page += 1;
                    }
                }
            }

            Ok(set)
        }
    })
    .await;

    result.map_err(|source| Error::RetrievalFailed {
        url: mirrors[(DEFAULT_MAX_ATTEMPTS - 1) % mirrors.len()]
            .join(&format!("FindPackagesById()?id='{queried_id}'")),
        id: queried_id,
        source: Box::new(source),
    })
}

struct ParsedPage {
    records: Vec<PackageRecord>,
    next: Option<String>,
}

#[derive(Default)]
struct EntryFields {
    id: String,
    version: String,
    content_url: Option<String>,
}

enum TextField {
    Id,
    Version,
}

fn parse_feed(xml: &str, fallback_id: &str) -> anyhow::Result<ParsedPage> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut page = ParsedPage {
        records: Vec::new(),
        next: None,
    };
    let mut in_entry = false;
    let mut in_properties = false;
    let mut entry = EntryFields::default();
    let mut field: Option<TextField> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                field = None;
                match e.local_name().as_ref() {
                    b"entry" => {
                        in_entry = true;
                        entry = EntryFields::default();
                    }
                    b"properties" if in_entry => in_properties = true,
                    // The Atom-level `id` element is lowercase; the OData
                    // property is `d:Id`.
                    b"Id" if in_properties => field = Some(TextField::Id),
                    b"Version" if in_properties => field = Some(TextField::Version),
                    b"content" if in_entry => {
                        for attr in e.attributes() {
                            let attr = attr.context("invalid feed attribute")?;
                            if attr.key.as_ref() == b"src" {
                                entry.content_url =
                                    Some(attr.unescape_value()?.into_owned());
                            }
                        }
                    }
                    b"link" if !in_entry => {
                        let mut rel = None;
                        let mut href = None;
                        for attr in e.attributes() {
                            let attr = attr.context("invalid feed attribute")?;
                            match attr.key.as_ref() {
                                b"rel" => rel = Some(attr.unescape_value()?.into_owned()),
                                b"href" => href = Some(attr.unescape_value()?.into_owned()),
                                _ => {}
                            }
                        }
                        if rel.as_deref() == Some("next") {
                            page.next = href;
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(t)) => {
                if in_entry {
                    match field {
                        Some(TextField::Id) => entry.id.push_str(&t.unescape()?),
                        Some(TextField::Version) => entry.version.push_str(&t.unescape()?),
                        None => {}
                    }
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"entry" => {
                    in_entry = false;
                    finish_entry(std::mem::take(&mut entry), fallback_id, &mut page.records);
                }
                b"properties" => in_properties = false,
                _ => field = None,
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(anyhow!("invalid feed document: {e}")),
        }
    }

    Ok(page)
}

fn finish_entry(entry: EntryFields, fallback_id: &str, records: &mut Vec<PackageRecord>) {
    let id = if entry.id.is_empty() {
        fallback_id.to_string()
    } else {
        entry.id
    };

    let version = match Version::parse(entry.version.trim()) {
        Ok(version) => version,
        Err(err) => {
            tracing::warn!(
                "ignoring unparsable version `{raw}` of package `{id}`: {err}",
                raw = entry.version
            );
            return;
        }
    };

    let Some(content_url) = entry.content_url else {
        tracing::warn!("ignoring entry for `{id}` {version} with no content URL");
        return;
    };

    records.push(PackageRecord {
        id,
        version,
        content_url,
    });
}

fn validate_xml(path: &Path) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(path)?;
    let mut reader = Reader::from_str(&text);
    reader.config_mut().trim_text(true);
    loop {
        match reader.read_event() {
            Ok(Event::Eof) => return Ok(()),
            Ok(_) => {}
            Err(e) => return Err(anyhow!("invalid XML: {e}")),
        }
    }
}

#[async_trait::async_trait]
impl FindPackageById for ODataResolver {
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

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom"
      xmlns:d="http://schemas.microsoft.com/ado/2007/08/dataservices"
      xmlns:m="http://schemas.microsoft.com/ado/2007/08/dataservices/metadata">
  <id>https://feed.example.com/api/v2/FindPackagesById()</id>
  <entry>
    <id>https://feed.example.com/api/v2/Packages(Id='xunit',Version='2.4.0')</id>
    <link rel="edit" href="Packages(Id='xunit',Version='2.4.0')"/>
    <content type="application/zip" src="https://feed.example.com/api/v2/package/xunit/2.4.0"/>
    <m:properties>
      <d:Id>xunit</d:Id>
      <d:Version>2.4.0</d:Version>
    </m:properties>
  </entry>
  <entry>
    <id>https://feed.example.com/api/v2/Packages(Id='xunit',Version='2.4.1')</id>
    <content type="application/zip" src="https://feed.example.com/api/v2/package/xunit/2.4.1"/>
    <m:properties>
      <d:Id>xunit</d:Id>
      <d:Version>2.4.1</d:Version>
    </m:properties>
  </entry>
  <link rel="next" href="https://feed.example.com/api/v2/FindPackagesById()?id='xunit'&amp;$skip=2"/>
</feed>"#;

    #[test]
    fn parses_entries_and_next_link() {
        let page = parse_feed(PAGE, "xunit").unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.records[0].id, "xunit");
        assert_eq!(page.records[0].version.to_string(), "2.4.0");
        assert_eq!(
            page.records[0].content_url,
            "https://feed.example.com/api/v2/package/xunit/2.4.0"
        );
        assert_eq!(
            page.next.as_deref(),
            Some("https://feed.example.com/api/v2/FindPackagesById()?id='xunit'&$skip=2")
        );
    }

    #[test]
    fn missing_id_falls_back_to_queried_id() {
        let xml = r#"<feed xmlns:d="d" xmlns:m="m">
  <entry>
    <content src="https://feed.example.com/p/1.0.0"/>
    <m:properties><d:Version>1.0.0</d:Version></m:properties>
  </entry>
</feed>"#;
        let page = parse_feed(xml, "Queried.Id").unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].id, "Queried.Id");
        assert!(page.next.is_none());
    }

    #[test]
    fn last_page_has_no_next() {
        let xml = r#"<feed><entry><content src="https://x/1"/><m:properties xmlns:m="m" xmlns:d="d"><d:Id>a</d:Id><d:Version>1.0.0</d:Version></m:properties></entry></feed>"#;
        let page = parse_feed(xml, "a").unwrap();
        assert_eq!(page.records.len(), 1);
        assert!(page.next.is_none());
    }
}
