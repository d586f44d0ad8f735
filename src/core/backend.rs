use std::{fmt, str::FromStr};

use http::HeaderValue;
use thiserror::Error;
use url::Url;

use crate::{
    config::{BackendConfig, BackendRole},
    core::service_proxy::join_url_path,
};

/// Errors related to backend operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BackendError {
    /// Error when URL is invalid
    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// A type-safe representation of a backend base URL
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendUrl {
    url: String,
    parsed: Url,
}

impl BackendUrl {
    /// Creates a new BackendUrl if the provided string is an absolute http(s) URL with a host
    pub fn new(url: &str) -> BackendResult<Self> {
        if !url.starts_with("https://") && !url.starts_with("http://") {
            return Err(BackendError::InvalidUrl(format!(
                "Backend URL must start with http:// or https://, got: {url}"
            )));
        }

        let parsed = Url::parse(url)
            .map_err(|e| BackendError::InvalidUrl(format!("{url}: {e}")))?;

        if parsed.host_str().is_none_or(str::is_empty) {
            return Err(BackendError::InvalidUrl(format!(
                "Backend URL has no host: {url}"
            )));
        }
        if parsed.fragment().is_some() {
            return Err(BackendError::InvalidUrl(format!(
                "Backend URL must not contain a fragment: {url}"
            )));
        }

        Ok(BackendUrl {
            url: url.to_string(),
            parsed,
        })
    }

    /// Get the underlying URL as a string reference
    pub fn as_str(&self) -> &str {
        &self.url
    }

    /// Check if the URL is using HTTPS
    pub fn is_secure(&self) -> bool {
        self.parsed.scheme() == "https"
    }

    pub fn scheme(&self) -> &str {
        self.parsed.scheme()
    }

    /// `host[:port]`, the port only when it is not the scheme default
    pub fn authority(&self) -> String {
        let host = self.parsed.host_str().unwrap_or_default();
        match self.parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    /// Base path, empty when the URL points at the root
    pub fn base_path(&self) -> &str {
        match self.parsed.path() {
            "/" => "",
            path => path,
        }
    }

    pub fn base_query(&self) -> Option<&str> {
        self.parsed.query().filter(|q| !q.is_empty())
    }
}

impl FromStr for BackendUrl {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendUrl::new(s)
    }
}

impl fmt::Display for BackendUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// One configured upstream. Immutable after startup and owned by its
/// [`ServiceProxy`](crate::core::service_proxy::ServiceProxy).
#[derive(Debug, Clone)]
pub struct BackendTarget {
    name: String,
    role: BackendRole,
    url: BackendUrl,
    health_path: String,
}

impl BackendTarget {
    pub fn new(
        name: impl Into<String>,
        role: BackendRole,
        url: &str,
        health_path: impl Into<String>,
    ) -> BackendResult<Self> {
        Ok(Self {
            name: name.into(),
            role,
            url: BackendUrl::new(url)?,
            health_path: health_path.into(),
        })
    }

    pub fn from_config(role: BackendRole, config: &BackendConfig) -> BackendResult<Self> {
        Self::new(&config.name, role, &config.url, &config.health_path)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> BackendRole {
        self.role
    }

    pub fn url(&self) -> &BackendUrl {
        &self.url
    }

    pub fn health_path(&self) -> &str {
        &self.health_path
    }

    /// Probe URL: the health path joined onto the base path, base query dropped.
    pub fn health_url(&self) -> String {
        format!(
            "{}://{}{}",
            self.url.scheme(),
            self.url.authority(),
            join_url_path(self.url.base_path(), &self.health_path)
        )
    }

    /// Value for the `Host` header of forwarded requests.
    pub fn host_header(&self) -> BackendResult<HeaderValue> {
        HeaderValue::from_str(&self.url.authority())
            .map_err(|e| BackendError::InvalidUrl(format!("{}: {e}", self.url)))
    }
}
