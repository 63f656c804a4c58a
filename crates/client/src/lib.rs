//! A client library for HTTP package-source feeds.
//!
//! Given a logical package source — an HTTP feed exposing a flat
//! package-base-address index, an OData query endpoint, or a registration
//! service — this crate discovers which versions of a package id exist,
//! fetches per-version dependency metadata, and streams package archives to
//! local disk. All retrieval goes through a single on-disk response cache
//! shared across repeated requests, concurrent callers, and OS processes,
//! and tolerates transient network failures with bounded retries over a
//! source's mirror list.
//!
//! The moving parts, bottom up:
//!
//! - [`lock`]: cross-process mutual exclusion per cache entry.
//! - [`Throttle`]: a process-wide cap on in-flight HTTP requests.
//! - [`HttpSource`]: turns a URI into a locally cached, verified byte
//!   stream exactly once per (URI, TTL) combination.
//! - [`FindPackageById`] resolvers ([`FlatIndexResolver`],
//!   [`ODataResolver`], [`RegistrationResolver`]): per-id discovery with
//!   single-flight memoization.
//! - [`NupkgDownloader`]: archive materialization memoized per content URI.

#![deny(missing_docs)]

mod cache;
mod credentials;
mod error;
mod http;
mod memo;
mod nupkg;
mod records;
mod resolver;
mod retry;
mod source_url;
mod throttle;

pub mod lock;

pub use cache::HttpCache;
pub use credentials::{CredentialProvider, CredentialRequestKind, Credentials, NoCredentials};
pub use error::{Error, Result};
pub use http::{
    BodyStream, CachedFile, FetchRequest, FetchResult, HttpSource, HttpTransport, Transport,
    TransportRequest, TransportResponse, DEFAULT_TTL,
};
pub use memo::SingleFlight;
pub use nupkg::{ArchiveReader, NupkgDownloader, ARCHIVE_TTL};
pub use records::{Dependency, DependencyGroup, DependencyInfo, PackageRecord};
pub use resolver::{
    DependencyProvider, FindPackageById, FlatIndexResolver, ODataResolver, PackageSet,
    RegistrationResolver,
};
pub use retry::DEFAULT_MAX_ATTEMPTS;
pub use source_url::SourceUrl;
pub use throttle::{Throttle, ThrottlePermit, DEFAULT_CAPACITY};

use std::sync::Arc;

/// The discovery protocol a package source speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    /// A flat per-id `index.json` layout.
    FlatIndex,
    /// An OData `FindPackagesById()` paged feed.
    ODataFeed,
    /// A registration/dependency service returning resolved records.
    Registration,
}

/// A logical package source: one or more equivalent mirror base URLs and
/// the protocol they speak.
///
/// Immutable after construction. Retry attempts rotate through the mirror
/// list in order.
#[derive(Debug, Clone)]
pub struct PackageSource {
    kind: ProtocolKind,
    mirrors: Vec<SourceUrl>,
}

impl PackageSource {
    /// Creates a source from a non-empty mirror list.
    pub fn new(kind: ProtocolKind, mirrors: Vec<SourceUrl>) -> Result<Self> {
        if mirrors.is_empty() {
            return Err(Error::Other(anyhow::anyhow!(
                "a package source requires at least one base URL"
            )));
        }
        Ok(Self { kind, mirrors })
    }

    /// The protocol the source speaks.
    pub fn kind(&self) -> ProtocolKind {
        self.kind
    }

    /// The mirror base URLs, in rotation order.
    pub fn mirrors(&self) -> &[SourceUrl] {
        &self.mirrors
    }

    /// The primary base URL, which also names the source's cache directory.
    pub fn primary(&self) -> &SourceUrl {
        &self.mirrors[0]
    }

    /// Builds the resolver for this source's protocol.
    ///
    /// Registration sources additionally need a [`DependencyProvider`]; use
    /// [`RegistrationResolver::new`] directly for those.
    pub fn into_resolver(
        self,
        http: Arc<HttpSource>,
        archive_reader: Arc<dyn ArchiveReader>,
    ) -> Result<Box<dyn FindPackageById>> {
        match self.kind {
            ProtocolKind::FlatIndex => Ok(Box::new(FlatIndexResolver::new(
                self.mirrors,
                http,
                archive_reader,
            )?)),
            ProtocolKind::ODataFeed => Ok(Box::new(ODataResolver::new(
                self.mirrors,
                http,
                archive_reader,
            )?)),
            ProtocolKind::Registration => Err(Error::Other(anyhow::anyhow!(
                "registration sources need a dependency provider; construct the resolver directly"
            ))),
        }
    }
}
