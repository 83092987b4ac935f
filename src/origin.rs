use std::time::Duration;

use axum::body::Bytes;
use axum::http::StatusCode;
use tracing::debug;

use crate::cache_key::Origin;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::store::CachedResponse;

/// Raw upstream answer, read fully into memory.
#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

impl OriginResponse {
    /// Decode the body as a JSON document. Non-2xx statuses and malformed
    /// bodies are failures and must never be cached.
    pub fn into_document(self) -> Result<CachedResponse> {
        if !self.status.is_success() {
            return Err(ProxyError::OriginStatus(self.status));
        }
        let body = serde_json::from_slice(&self.body).map_err(ProxyError::Decode)?;
        Ok(CachedResponse::new(body))
    }
}

/// Single-shot `GET` client for the configured origin. No retries.
#[derive(Clone)]
pub struct OriginFetcher {
    client: reqwest::Client,
    origin: Origin,
    timeout: Duration,
    max_body_bytes: usize,
}

impl OriginFetcher {
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.origin_timeout)
            .pool_max_idle_per_host(20)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ProxyError::configuration(format!("cannot build origin client: {e}")))?;

        Ok(Self {
            client,
            origin: config.origin.clone(),
            timeout: config.origin_timeout,
            max_body_bytes: config.max_body_bytes,
        })
    }

    pub async fn fetch(&self, path: &str) -> Result<OriginResponse> {
        let url = self.origin.url_for(path);
        debug!(%url, "fetching from origin");

        let mut resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = resp.status();
        let declared = resp.content_length();
        if declared.is_some_and(|len| len > self.max_body_bytes as u64) {
            return Err(self.too_large());
        }

        // Chunked bodies carry no length up front; stop reading as soon as
        // the running total passes the limit.
        let mut body = Vec::with_capacity(
            declared.map_or(0, |len| len as usize).min(self.max_body_bytes),
        );
        while let Some(chunk) = resp.chunk().await.map_err(|e| self.classify(e))? {
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(self.too_large());
            }
            body.extend_from_slice(&chunk);
        }

        Ok(OriginResponse {
            status,
            body: Bytes::from(body),
        })
    }

    fn too_large(&self) -> ProxyError {
        ProxyError::OriginBodyTooLarge {
            limit: self.max_body_bytes,
        }
    }

    fn classify(&self, err: reqwest::Error) -> ProxyError {
        if err.is_timeout() {
            ProxyError::OriginTimeout(self.timeout)
        } else {
            ProxyError::OriginFetch(err)
        }
    }
}
