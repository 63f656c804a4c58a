//! The HTTP source engine: turns a URI into a locally cached byte stream.

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;

use crate::cache::{self, CacheEntry, HttpCache};
use crate::credentials::{CredentialProvider, CredentialRequestKind, Credentials, NoCredentials};
use crate::error::{Error, Result};
use crate::lock::with_file_lock;
use crate::source_url::SourceUrl;
use crate::throttle::Throttle;

/// How long a cached response is trusted by default.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

/// How many credential prompts are attempted before an authentication
/// challenge is surfaced as a failure.
const MAX_AUTH_ATTEMPTS: usize = 3;

/// The response body as a lazily consumed byte stream.
pub type BodyStream = BoxStream<'static, std::io::Result<Bytes>>;

/// A request issued by the transport layer.
#[derive(Debug)]
pub struct TransportRequest {
    /// The URL to GET.
    pub url: String,
    /// An optional `Accept` header value.
    pub accept: Option<&'static str>,
    /// Credentials to attach, if any.
    pub credentials: Option<Credentials>,
}

/// A response with eagerly read headers and a lazily streamed body.
pub struct TransportResponse {
    /// The HTTP status code.
    pub status: u16,
    /// The body stream.
    pub body: BodyStream,
}

/// The seam between the source engine and the network.
///
/// The production implementation is [`HttpTransport`]; tests substitute a
/// scripted transport. A transport-level error means the request never
/// produced a response and is always treated as transient.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issues a GET request, resolving once response headers are available.
    async fn get(&self, request: TransportRequest) -> anyhow::Result<TransportResponse>;
}

/// A [`Transport`] backed by a reqwest client.
#[derive(Debug, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Creates a transport with a default client.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, request: TransportRequest) -> anyhow::Result<TransportResponse> {
        let mut builder = self.client.get(&request.url);
        if let Some(accept) = request.accept {
            builder = builder.header(reqwest::header::ACCEPT, accept);
        }
        if let Some(credentials) = &request.credentials {
            builder = builder.basic_auth(&credentials.username, Some(&credentials.password));
        }

        // send() resolves once headers are in; the body is not buffered.
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
            .boxed();

        Ok(TransportResponse { status, body })
    }
}

/// A cached GET request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// The URL to fetch.
    pub url: String,
    /// The logical cache key naming the entry, independent of the exact URL.
    pub cache_key: String,
    /// Maximum age at which a cached response is served without a network
    /// call. A zero TTL never reuses the cache and never writes to the
    /// persistent slot.
    pub ttl: Duration,
    /// Treat a 404 response as an explicit absence instead of an error.
    pub ignore_not_found: bool,
    /// An optional `Accept` header value.
    pub accept: Option<&'static str>,
    /// Validates response contents (cached or fresh) before they are
    /// trusted. Cached contents failing validation are refetched; fresh
    /// contents failing validation are never installed into the cache.
    pub ensure_valid: Option<fn(&Path) -> anyhow::Result<()>>,
}

impl FetchRequest {
    /// Creates a request with the default TTL and no options.
    pub fn new(url: impl Into<String>, cache_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            cache_key: cache_key.into(),
            ttl: DEFAULT_TTL,
            ignore_not_found: false,
            accept: None,
            ensure_valid: None,
        }
    }
}

/// The outcome of a fetch.
#[derive(Debug)]
pub enum FetchResult {
    /// The response is available in a local file.
    Cached(CachedFile),
    /// The source reported the resource absent and the request opted in to
    /// treating that as a result.
    NotFound,
}

/// A local file holding a fetched response.
///
/// For zero-TTL fetches the backing file is transient and removed when this
/// value is dropped.
#[derive(Debug)]
pub struct CachedFile {
    path: PathBuf,
    file: tokio::fs::File,
    _temp: Option<TempPath>,
}

impl CachedFile {
    /// The path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Consumes the handle and returns the open file.
    pub fn into_file(self) -> tokio::fs::File {
        self.file
    }

    /// Reads the entire contents into memory.
    pub async fn bytes(mut self) -> Result<Vec<u8>> {
        use tokio::io::AsyncReadExt;

        let mut buf = Vec::new();
        self.file
            .read_to_end(&mut buf)
            .await
            .with_context(|| format!("failed to read `{path}`", path = self.path.display()))?;
        Ok(buf)
    }
}

/// The cache-and-retrieval engine for one package source.
///
/// Given a URI and a cache key, returns a readable byte stream that is
/// either served from a fresh on-disk cache entry or freshly downloaded,
/// replacing the cache entry atomically. Safe against concurrent callers in
/// this process (file lock + throttle) and in other processes (file lock).
pub struct HttpSource {
    source: SourceUrl,
    cache: HttpCache,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialProvider>,
    throttle: Arc<Throttle>,
    prompts_blocked: AtomicBool,
}

impl HttpSource {
    /// Creates an HTTP source over the given base URL, caching under
    /// `cache_root`.
    ///
    /// Defaults to a reqwest transport, anonymous credentials, and the
    /// process-wide throttle; each can be replaced with the `with_` methods.
    pub fn new(source: SourceUrl, cache_root: impl Into<PathBuf>) -> Self {
        Self {
            source,
            cache: HttpCache::new(cache_root),
            transport: Arc::new(HttpTransport::new()),
            credentials: Arc::new(NoCredentials),
            throttle: Throttle::shared(),
            prompts_blocked: AtomicBool::new(false),
        }
    }

    /// Replaces the transport.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// Replaces the credential provider.
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Replaces the throttle.
    pub fn with_throttle(mut self, throttle: Arc<Throttle>) -> Self {
        self.throttle = throttle;
        self
    }

    /// The base URL of the source.
    pub fn source(&self) -> &SourceUrl {
        &self.source
    }

    /// Performs a caching GET request.
    ///
    /// Fresh cache entries are served under the entry's file lock with no
    /// network call and no throttle permit consumed. Misses download under
    /// the same lock, write to a staging file, and atomically install the
    /// result, so a second caller for the same entry — in this process or
    /// another — finds the finished file instead of racing the download.
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResult> {
        if request.ttl.is_zero() {
            return self.fetch_transient(&request).await;
        }

        let entry = self.cache.entry(&self.source, &request.cache_key);
        with_file_lock(&entry.current, async {
            if let Some(file) = cache::read_fresh(&entry.current, request.ttl)? {
                tracing::debug!("CACHE {url}", url = request.url);
                match request.ensure_valid.map(|v| v(&entry.current)).transpose() {
                    Ok(_) => {
                        return Ok(FetchResult::Cached(CachedFile {
                            path: entry.current.clone(),
                            file: tokio::fs::File::from_std(file),
                            _temp: None,
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(
                            "discarding invalid cache entry `{path}` for {url}: {err}",
                            path = entry.current.display(),
                            url = request.url
                        );
                    }
                }
            }

            self.download(&request, &entry).await
        })
        .await
    }

    async fn download(&self, request: &FetchRequest, entry: &CacheEntry) -> Result<FetchResult> {
        let permit = self.throttle.acquire().await;

        tracing::debug!("GET {url}", url = request.url);
        let response = self.send_with_auth(&request.url, request.accept).await?;

        if request.ignore_not_found && response.status == 404 {
            return Ok(FetchResult::NotFound);
        }
        if !(200..300).contains(&response.status) {
            return Err(Error::Status {
                status: response.status,
                url: request.url.clone(),
            });
        }

        write_body(response.body, &entry.staging, &request.url).await?;
        drop(permit);

        if let Some(validate) = request.ensure_valid {
            if let Err(source) = validate(&entry.staging) {
                let _ = std::fs::remove_file(&entry.staging);
                return Err(Error::Malformed {
                    url: request.url.clone(),
                    source,
                });
            }
        }

        // No await between here and returning the opened file: the swap is
        // the one non-cancellable step, so a dropped caller cannot leave a
        // half-written file installed as current.
        let file = cache::promote_staging(entry)?;
        Ok(FetchResult::Cached(CachedFile {
            path: entry.current.clone(),
            file: tokio::fs::File::from_std(file),
            _temp: None,
        }))
    }

    /// A zero-TTL fetch: the response lands in a self-deleting temp file and
    /// the persistent cache slot is never touched.
    async fn fetch_transient(&self, request: &FetchRequest) -> Result<FetchResult> {
        let permit = self.throttle.acquire().await;

        tracing::debug!("GET {url} (uncached)", url = request.url);
        let response = self.send_with_auth(&request.url, request.accept).await?;

        if request.ignore_not_found && response.status == 404 {
            return Ok(FetchResult::NotFound);
        }
        if !(200..300).contains(&response.status) {
            return Err(Error::Status {
                status: response.status,
                url: request.url.clone(),
            });
        }

        let temp_dir = self.cache.temp_dir()?;
        let temp = tempfile::NamedTempFile::new_in(&temp_dir)
            .with_context(|| {
                format!(
                    "failed to create temporary file in `{path}`",
                    path = temp_dir.display()
                )
            })?
            .into_temp_path();

        write_body(response.body, &temp, &request.url).await?;
        drop(permit);

        if let Some(validate) = request.ensure_valid {
            if let Err(source) = validate(&temp) {
                return Err(Error::Malformed {
                    url: request.url.clone(),
                    source,
                });
            }
        }

        let file = std::fs::File::open(&temp)
            .with_context(|| format!("failed to open `{path}`", path = temp.display()))?;
        Ok(FetchResult::Cached(CachedFile {
            path: temp.to_path_buf(),
            file: tokio::fs::File::from_std(file),
            _temp: Some(temp),
        }))
    }

    /// Sends a request, running the bounded re-authentication exchange on
    /// 401/403 responses.
    async fn send_with_auth(
        &self,
        url: &str,
        accept: Option<&'static str>,
    ) -> Result<TransportResponse> {
        let mut credentials = self.credentials.current(&self.source).await;
        let mut prompts = 0;

        loop {
            let response = self
                .transport
                .get(TransportRequest {
                    url: url.to_string(),
                    accept,
                    credentials: credentials.clone(),
                })
                .await
                .map_err(|source| Error::Request {
                    url: url.to_string(),
                    source,
                })?;

            match response.status {
                status @ (401 | 403) => {
                    if self.prompts_blocked.load(Ordering::Relaxed) || prompts >= MAX_AUTH_ATTEMPTS
                    {
                        return Err(Error::Unauthorized {
                            url: url.to_string(),
                            status,
                        });
                    }

                    let kind = if status == 401 {
                        CredentialRequestKind::Unauthorized
                    } else {
                        CredentialRequestKind::Forbidden
                    };
                    match self.credentials.prompt(&self.source, kind).await {
                        Some(fresh) => {
                            prompts += 1;
                            credentials = Some(fresh);
                        }
                        None => {
                            // No credentials available; stop prompting for
                            // the rest of this source's lifetime.
                            self.prompts_blocked.store(true, Ordering::Relaxed);
                            return Err(Error::Unauthorized {
                                url: url.to_string(),
                                status,
                            });
                        }
                    }
                }
                status => {
                    if prompts > 0 && (200..300).contains(&status) {
                        if let Some(accepted) = &credentials {
                            self.credentials.on_success(&self.source, accepted);
                        }
                    }
                    return Ok(response);
                }
            }
        }
    }
}

async fn write_body(mut body: BodyStream, path: &Path, url: &str) -> Result<()> {
    let file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("failed to create `{path}`", path = path.display()))?;
    let mut writer = tokio::io::BufWriter::new(file);

    while let Some(chunk) = body.try_next().await.map_err(|source| Error::Request {
        url: url.to_string(),
        source: source.into(),
    })? {
        writer
            .write_all(&chunk)
            .await
            .with_context(|| format!("failed to write to `{path}`", path = path.display()))?;
    }

    writer
        .shutdown()
        .await
        .with_context(|| format!("failed to write `{path}`", path = path.display()))?;
    Ok(())
}
