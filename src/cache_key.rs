use std::fmt;

use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{ProxyError, Result};

/// Fixed tag mixed into every key so proxy entries never alias other users
/// of the same store.
const KEY_NAMESPACE: &str = "cache-request/GET/";
const KEY_SEPARATOR: &str = "|";

/// Upstream server identified by scheme and authority only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    base: String,
    authority: String,
}

impl Origin {
    /// Validate an origin such as `http://host`, `https://host:8443` or a
    /// bare `host:port` (assumed `http`). Any path component, including a
    /// lone trailing slash, is rejected.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ProxyError::configuration("origin is required"));
        }

        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{raw}")
        };

        let url = Url::parse(&with_scheme)
            .map_err(|e| ProxyError::configuration(format!("invalid origin {raw:?}: {e}")))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ProxyError::configuration(format!(
                "origin {raw:?} must use http or https"
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::configuration(format!("origin {raw:?} has no host")))?;

        let remainder = with_scheme
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or_default();
        if remainder.contains('/') || url.query().is_some() || url.fragment().is_some() {
            return Err(ProxyError::configuration(format!(
                "origin {raw:?} must not contain a path, e.g. http://host/ and http://host/sub are invalid"
            )));
        }

        if !url.username().is_empty() || url.password().is_some() {
            return Err(ProxyError::configuration(format!(
                "origin {raw:?} must not carry credentials"
            )));
        }

        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        Ok(Self {
            base: url.origin().ascii_serialization(),
            authority,
        })
    }

    /// `scheme://host[:port]`, without a trailing slash.
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Absolute upstream URL for a request path.
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base, path)
        } else {
            format!("{}/{}", self.base, path)
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base)
    }
}

/// Hex-encoded SHA-256 digest identifying one origin resource in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Width of the rendered key in characters.
    pub const LEN: usize = 64;

    pub fn derive(origin: &Origin, path: &str) -> Self {
        let path = if path.is_empty() { "/" } else { path };

        let mut hasher = Sha256::new();
        hasher.update(KEY_NAMESPACE.as_bytes());
        hasher.update(origin.base().as_bytes());
        hasher.update(KEY_SEPARATOR.as_bytes());
        hasher.update(path.as_bytes());

        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validate `origin` and derive the key for `path` in one step.
pub fn derive_key(origin: &str, path: &str) -> Result<CacheKey> {
    let origin = Origin::parse(origin)?;
    Ok(CacheKey::derive(&origin, path))
}
