//! Shared helpers for integration tests: a scripted transport and stub
//! collaborators.

// Each test binary compiles its own copy of this module and uses a subset.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use pakfeed_client::{
    ArchiveReader, Credentials, DependencyInfo, HttpSource, SourceUrl, Throttle, Transport,
    TransportRequest, TransportResponse,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One scripted response for a URL.
#[derive(Clone)]
pub struct MockResponse {
    status: u16,
    body: Vec<u8>,
    delay: Option<Duration>,
    fail: bool,
    required_credentials: Option<Credentials>,
}

impl MockResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            delay: None,
            fail: false,
            required_credentials: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
            delay: None,
            fail: false,
            required_credentials: None,
        }
    }

    /// A transport-level failure: the request never produces a response.
    pub fn error() -> Self {
        Self {
            status: 0,
            body: Vec::new(),
            delay: None,
            fail: true,
            required_credentials: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Responds 401 unless the request carries these credentials.
    pub fn with_required_credentials(mut self, username: &str, password: &str) -> Self {
        self.required_credentials = Some(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        });
        self
    }
}

/// A transport answering from scripted per-URL response queues.
///
/// Responses are consumed front to back; the last response for a URL
/// repeats. Every request is recorded.
pub struct MockTransport {
    routes: Mutex<HashMap<String, Vec<MockResponse>>>,
    requests: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn on(&self, url: &str, responses: Vec<MockResponse>) {
        assert!(!responses.is_empty());
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), responses);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests_for(&self, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| *r == url)
            .count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn get(&self, request: TransportRequest) -> anyhow::Result<TransportResponse> {
        self.requests.lock().unwrap().push(request.url.clone());

        let response = {
            let mut routes = self.routes.lock().unwrap();
            let queue = routes
                .get_mut(&request.url)
                .unwrap_or_else(|| panic!("no scripted response for `{}`", request.url));
            if queue.len() > 1 {
                queue.remove(0)
            } else {
                queue[0].clone()
            }
        };

        if let Some(delay) = response.delay {
            tokio::time::sleep(delay).await;
        }
        if response.fail {
            anyhow::bail!("connection reset by peer");
        }

        let status = match &response.required_credentials {
            Some(required) if request.credentials.as_ref() != Some(required) => 401,
            _ => response.status,
        };
        let body = if status == response.status {
            response.body
        } else {
            Vec::new()
        };

        Ok(TransportResponse {
            status,
            body: stream::iter(vec![Ok(Bytes::from(body))]).boxed(),
        })
    }
}

pub fn source_url(url: &str) -> SourceUrl {
    SourceUrl::new(url).unwrap()
}

/// An HTTP source over the mock transport with a test-private throttle.
pub fn http_source(transport: Arc<MockTransport>, cache_root: &Path, base: &str) -> Arc<HttpSource> {
    Arc::new(
        HttpSource::new(source_url(base), cache_root)
            .with_transport(transport)
            .with_throttle(Arc::new(Throttle::new(8))),
    )
}

/// An archive reader that accepts every archive.
pub struct StubArchiveReader;

impl ArchiveReader for StubArchiveReader {
    fn read_dependency_info(&self, _path: &Path) -> anyhow::Result<DependencyInfo> {
        Ok(DependencyInfo {
            id: "stub".to_string(),
            version: semver::Version::new(1, 0, 0),
            groups: Vec::new(),
        })
    }
}

/// An archive reader that rejects every archive as corrupt.
pub struct FailingArchiveReader;

impl ArchiveReader for FailingArchiveReader {
    fn read_dependency_info(&self, path: &Path) -> anyhow::Result<DependencyInfo> {
        anyhow::bail!("bad central directory in `{}`", path.display())
    }
}
