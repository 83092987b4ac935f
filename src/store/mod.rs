//! Cache store access.
//!
//! [`CacheStore`] is the raw key-value capability (string values with a TTL).
//! [`CacheStoreAdapter`] layers JSON documents, per-operation timeouts and
//! the configured write policy on top of it, and is the only type the proxy
//! talks to.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::timeout;
use tracing::warn;

use crate::cache_key::CacheKey;
use crate::config::{ProxyConfig, WritePolicy};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] fred::error::Error),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("key {0} already holds a live value")]
    KeyExists(String),

    #[error("failed to encode document: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Raw key-value store with expiry.
///
/// Implementations must attach the TTL in the same operation as the write so
/// a crash can never leave a key without an expiry.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// `Ok(None)` is a miss; `Err` is a communication failure.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
        policy: WritePolicy,
    ) -> Result<(), StoreError>;

    /// Remove every key. Administrative use only.
    async fn flush_all(&self) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Decoded origin body as stored under a [`CacheKey`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CachedResponse {
    body: Value,
}

impl CachedResponse {
    pub fn new(body: Value) -> Self {
        Self { body }
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn into_body(self) -> Value {
        self.body
    }
}

#[derive(Clone)]
pub struct CacheStoreAdapter {
    store: Arc<dyn CacheStore>,
    lookup_timeout: Duration,
    write_timeout: Duration,
    write_policy: WritePolicy,
}

impl CacheStoreAdapter {
    pub fn new(store: Arc<dyn CacheStore>, config: &ProxyConfig) -> Self {
        Self {
            store,
            lookup_timeout: config.lookup_timeout,
            write_timeout: config.write_timeout,
            write_policy: config.write_policy,
        }
    }

    /// Look up a document. An undecodable stored value is reported as a
    /// miss so the next write-back replaces it.
    pub async fn read(&self, key: &CacheKey) -> Result<Option<CachedResponse>, StoreError> {
        let raw = timeout(self.lookup_timeout, self.store.get(key.as_str()))
            .await
            .map_err(|_| StoreError::Timeout(self.lookup_timeout))??;

        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(doc) => Ok(Some(doc)),
            Err(err) => {
                warn!(%key, error = %err, "discarding undecodable cache entry");
                Ok(None)
            }
        }
    }

    pub async fn write(
        &self,
        key: &CacheKey,
        doc: &CachedResponse,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_string(doc)?;
        timeout(
            self.write_timeout,
            self.store.set(key.as_str(), value, ttl, self.write_policy),
        )
        .await
        .map_err(|_| StoreError::Timeout(self.write_timeout))?
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        timeout(self.lookup_timeout, self.store.ping())
            .await
            .map_err(|_| StoreError::Timeout(self.lookup_timeout))?
    }
}

/// Whole seconds for a store expiry; sub-second TTLs round up to one.
pub(crate) fn ttl_seconds(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    i64::try_from(secs.max(1)).unwrap_or(i64::MAX)
}
