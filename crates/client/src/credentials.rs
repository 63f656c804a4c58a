//! Pluggable credentials for authenticated package sources.
//!
//! Providers are explicit objects handed to an [`HttpSource`] at
//! construction time and scoped to that source's lifetime; there is no
//! process-wide credential store.
//!
//! [`HttpSource`]: crate::HttpSource

use async_trait::async_trait;

use crate::source_url::SourceUrl;

/// A username/password pair for a package source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// The user name.
    pub username: String,
    /// The password or token.
    pub password: String,
}

/// Why credentials are being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialRequestKind {
    /// The source responded with 401.
    Unauthorized,
    /// The source responded with 403.
    Forbidden,
}

/// Supplies credentials for a package source.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Returns the credentials to attach to requests before any challenge
    /// has been seen, if any are known.
    async fn current(&self, url: &SourceUrl) -> Option<Credentials>;

    /// Requests fresh credentials after an authentication challenge.
    ///
    /// Returning `None` means no further credentials are available; the
    /// source stops prompting for the rest of its lifetime.
    async fn prompt(&self, url: &SourceUrl, kind: CredentialRequestKind) -> Option<Credentials>;

    /// Called once after prompted credentials were accepted by the source.
    fn on_success(&self, _url: &SourceUrl, _credentials: &Credentials) {}
}

/// A provider for anonymous sources.
#[derive(Debug, Default)]
pub struct NoCredentials;

#[async_trait]
impl CredentialProvider for NoCredentials {
    async fn current(&self, _url: &SourceUrl) -> Option<Credentials> {
        None
    }

    async fn prompt(&self, _url: &SourceUrl, _kind: CredentialRequestKind) -> Option<Credentials> {
        None
    }
}
