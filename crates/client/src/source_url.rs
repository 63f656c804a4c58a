//! Validated base URLs for package sources.

use anyhow::{anyhow, bail, Context, Result};
use reqwest::IntoUrl;
use sha2::{Digest, Sha256};
use url::{Host, Url};

/// The base URL of a package source.
// Note: the inner Url always has a scheme, a host, and a trailing slash.
#[derive(Clone, PartialEq, Eq)]
pub struct SourceUrl(Url);

impl SourceUrl {
    /// Parses and validates the given URL into a [`SourceUrl`].
    ///
    /// A scheme-less input defaults to HTTPS. Unsecured HTTP is only
    /// permitted for loopback hosts.
    pub fn new(url: impl IntoUrl) -> Result<Self> {
        let mut url: Url = if !url.as_str().contains("://") {
            Url::parse(&format!("https://{url}", url = url.as_str()))
                .context("failed to parse package source URL")?
        } else {
            url.into_url().context("failed to parse package source URL")?
        };

        match url.scheme() {
            "https" => {}
            "http" => match url
                .host()
                .ok_or_else(|| anyhow!("expected a host for URL `{url}`"))?
            {
                Host::Domain(d) => {
                    if d != "localhost" {
                        bail!("an unsecured connection is not permitted to `{d}`");
                    }
                }
                Host::Ipv4(ip) => {
                    if !ip.is_loopback() {
                        bail!("an unsecured connection is not permitted to address `{ip}`");
                    }
                }
                Host::Ipv6(ip) => {
                    if !ip.is_loopback() {
                        bail!("an unsecured connection is not permitted to address `{ip}`");
                    }
                }
            },
            _ => bail!("expected a HTTPS scheme for URL `{url}`"),
        }

        // Normalize by appending a '/' if missing so joins are relative to
        // the full base path.
        if !url.path().ends_with('/') {
            url.set_path(&(url.path().to_string() + "/"));
        }

        Ok(Self(url))
    }

    /// Returns a fixed-length, filesystem-safe label identifying this source.
    ///
    /// Used to name the per-source cache directory; a content hash keeps
    /// directory names short regardless of how long the URL is.
    pub fn cache_label(&self) -> String {
        let digest = Sha256::digest(self.0.as_str().as_bytes());
        hex::encode(&digest[..20])
    }

    /// Joins a relative path (optionally carrying a query string) onto the
    /// base URL.
    pub fn join(&self, path: &str) -> String {
        // Url::join can only fail if the base is relative or if the result is
        // very large (>4GB), neither of which should be possible in this lib.
        self.0.join(path).unwrap().to_string()
    }

    /// Returns the URL as a string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl std::str::FromStr for SourceUrl {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl std::fmt::Display for SourceUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for SourceUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SourceUrl").field(&self.0.as_str()).finish()
    }
}
