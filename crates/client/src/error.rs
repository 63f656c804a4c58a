//! Error types for package-source operations.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Represents an error returned by package-source clients.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to reach the source at all (connection, timeout, reset).
    #[error("failed to send request to `{url}`")]
    Request {
        /// The URL of the failed request.
        url: String,
        /// The underlying transport error.
        #[source]
        source: anyhow::Error,
    },

    /// The source returned an unexpected status code.
    #[error("the source returned status {status} for `{url}`")]
    Status {
        /// The status code of the response.
        status: u16,
        /// The URL of the request.
        url: String,
    },

    /// Authentication against the source failed after exhausting all
    /// credential options.
    #[error("authentication failed for `{url}` (status {status})")]
    Unauthorized {
        /// The URL of the request.
        url: String,
        /// The status code of the final response.
        status: u16,
    },

    /// The source returned a response body that could not be understood.
    #[error("the source returned a malformed response for `{url}`")]
    Malformed {
        /// The URL of the request.
        url: String,
        /// The underlying parse error.
        #[source]
        source: anyhow::Error,
    },

    /// A downloaded package archive failed manifest extraction.
    ///
    /// The path names the offending cache file; the entry is not retried or
    /// deleted automatically, since server-side corruption would just be
    /// fetched and cached again.
    #[error("the package archive at `{path}` is corrupt")]
    CorruptPackage {
        /// The cache file containing the corrupt archive.
        path: PathBuf,
        /// The extraction error.
        #[source]
        source: anyhow::Error,
    },

    /// Every retry attempt for a package discovery failed.
    #[error("failed to retrieve package `{id}` from `{url}`")]
    RetrievalFailed {
        /// The package id being discovered.
        id: String,
        /// The URL of the last attempt.
        url: String,
        /// The error from the last attempt.
        #[source]
        source: Box<Error>,
    },

    /// An error shared with other callers of the same memoized operation.
    #[error("{0}")]
    Shared(Arc<Error>),

    /// An error occurred while performing a client operation.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether a retry against another mirror could reasonably succeed.
    ///
    /// Request failures, malformed bodies, and server-side statuses
    /// (5xx, 408, 429) are transient; everything else is terminal for the
    /// operation.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Request { .. } | Error::Malformed { .. } => true,
            Error::Status { status, .. } => {
                matches!(*status, 408 | 429) || (500..600).contains(status)
            }
            Error::Shared(inner) => inner.is_transient(),
            _ => false,
        }
    }
}

/// Represents the result of a client operation.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let url = "https://feed.example.com/".to_string();
        assert!(Error::Status { status: 503, url: url.clone() }.is_transient());
        assert!(Error::Status { status: 429, url: url.clone() }.is_transient());
        assert!(!Error::Status { status: 404, url: url.clone() }.is_transient());
        assert!(!Error::Unauthorized { status: 401, url: url.clone() }.is_transient());
        assert!(Error::Shared(Arc::new(Error::Status { status: 500, url })).is_transient());
    }
}
