//! Remote deployment identity

use std::fmt;

use url::Url;

use crate::{Error, Result};

/// One remote server instance
///
/// `stable_identifier` is derived once from the URL and namespaces every
/// credential-store key that belongs to this deployment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Deployment {
    url: Url,
    stable_identifier: String,
}

impl Deployment {
    /// Parse a deployment URL
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is unparsable, not http(s), or has no host.
    pub fn new(url: &str) -> Result<Self> {
        let parsed = Url::parse(url.trim())
            .map_err(|e| Error::InvalidDeployment(format!("{url}: {e}")))?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::InvalidDeployment(format!(
                "{url}: unsupported scheme {}",
                parsed.scheme()
            )));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| Error::InvalidDeployment(format!("{url}: missing host")))?;

        let mut raw = host.to_ascii_lowercase();
        if let Some(port) = parsed.port() {
            raw.push('-');
            raw.push_str(&port.to_string());
        }

        Ok(Self {
            stable_identifier: sanitize_identifier(&raw),
            url: parsed,
        })
    }

    /// Deployment URL
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Key-safe identifier (lowercased host, plus port when explicit)
    #[must_use]
    pub fn stable_identifier(&self) -> &str {
        &self.stable_identifier
    }

    /// Scheme, host and port without path or query
    #[must_use]
    pub fn origin(&self) -> String {
        self.url.origin().ascii_serialization()
    }

    /// Resolve a path relative to the deployment origin
    ///
    /// # Errors
    ///
    /// Returns an error if `path` does not form a valid URL.
    pub fn join(&self, path: &str) -> Result<Url> {
        Url::parse(&self.origin())
            .and_then(|base| base.join(path))
            .map_err(|e| Error::InvalidDeployment(format!("{path}: {e}")))
    }
}

impl fmt::Display for Deployment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

fn sanitize_identifier(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
