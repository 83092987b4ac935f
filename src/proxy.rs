use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use axum::{
    extract::{Request, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use dashmap::{mapref::entry::Entry, DashMap};
use metrics::counter;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache_key::CacheKey;
use crate::config::{ProxyConfig, StoreFailurePolicy};
use crate::error::{ProxyError, Result};
use crate::origin::OriginFetcher;
use crate::store::{CacheStore, CacheStoreAdapter, CachedResponse};
use crate::writeback::{EnqueueOutcome, WriteBackItem, WriteBackQueue, WriteBackWorker};
use crate::{CACHE_STATUS_HEADER, FRESHNESS_HEADER};

pub(crate) const METRIC_CACHE_HIT: &str = "cache_proxy_hit_total";
pub(crate) const METRIC_CACHE_MISS: &str = "cache_proxy_miss_total";
pub(crate) const METRIC_ORIGIN_FAILURE: &str = "cache_proxy_origin_failure_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }
}

/// Outcome of a successful request, before it is rendered.
#[derive(Debug, Clone, PartialEq)]
pub struct Served {
    pub status: CacheStatus,
    pub document: CachedResponse,
}

#[derive(Debug, Clone)]
enum Flight {
    Pending,
    Ready(CachedResponse),
    Failed,
}

type InflightMap = DashMap<CacheKey, watch::Receiver<Flight>>;

/// Clears the in-flight entry once the shared fetch has published its
/// outcome, or when the fetch task is torn down without one.
struct FlightGuard {
    inflight: Arc<InflightMap>,
    key: CacheKey,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.inflight.remove(&self.key);
    }
}

/// Origin side of a miss: fetch, decode, then hand the document to the
/// write-back queue.
#[derive(Clone)]
struct Fill {
    origin: OriginFetcher,
    writeback: WriteBackQueue,
    max_age: Duration,
}

impl Fill {
    async fn run(&self, key: &CacheKey, path: &str) -> Result<CachedResponse> {
        let document = self.origin.fetch(path).await?.into_document()?;

        let item = WriteBackItem::new(key.clone(), document.clone(), self.max_age);
        if self.writeback.enqueue(item) != EnqueueOutcome::Queued {
            debug!(%key, "response served without write-back");
        }
        Ok(document)
    }
}

// Proxy Server State
pub struct ProxyServer {
    config: Arc<ProxyConfig>,
    store: CacheStoreAdapter,
    fill: Fill,
    inflight: Arc<InflightMap>,
}

impl ProxyServer {
    /// Build the server and start its write-back worker. The caller owns the
    /// worker and must shut it down after the listener has drained.
    pub fn new(
        config: ProxyConfig,
        store: Arc<dyn CacheStore>,
    ) -> Result<(Arc<Self>, WriteBackWorker)> {
        config.validate()?;

        let store = CacheStoreAdapter::new(store, &config);
        let origin = OriginFetcher::new(&config)?;
        let (writeback, worker) = WriteBackWorker::spawn(store.clone(), config.queue_capacity);

        let fill = Fill {
            origin,
            writeback,
            max_age: config.max_age,
        };
        let server = Arc::new(Self {
            config: Arc::new(config),
            store,
            fill,
            inflight: Arc::new(DashMap::new()),
        });
        Ok((server, worker))
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn writeback(&self) -> &WriteBackQueue {
        &self.fill.writeback
    }

    pub async fn handle_proxy(State(server): State<Arc<ProxyServer>>, req: Request) -> Response {
        if req.method() != Method::GET {
            return (
                StatusCode::METHOD_NOT_ALLOWED,
                [(header::ALLOW, HeaderValue::from_static("GET"))],
            )
                .into_response();
        }

        match server.serve(req.uri().path()).await {
            Ok(served) => server.write_response(served),
            Err(err) => {
                // Anything but a store failure happened after the lookup missed.
                let missed = !matches!(err, ProxyError::Store(_));
                let mut response = err.into_response();
                if missed {
                    response.headers_mut().insert(
                        HeaderName::from_static(CACHE_STATUS_HEADER),
                        HeaderValue::from_static(CacheStatus::Miss.as_str()),
                    );
                }
                response
            }
        }
    }

    /// Run the lookup / fetch / write-back pipeline for one path.
    pub async fn serve(&self, path: &str) -> Result<Served> {
        let key = CacheKey::derive(&self.config.origin, path);

        if let Some(document) = self.lookup(&key).await? {
            counter!(METRIC_CACHE_HIT).increment(1);
            debug!(%key, path, "cache hit");
            return Ok(Served {
                status: CacheStatus::Hit,
                document,
            });
        }

        counter!(METRIC_CACHE_MISS).increment(1);
        info!(%key, path, "cache miss, fetching from origin");

        let document = if self.config.coalesce_misses {
            self.fetch_coalesced(&key, path).await
        } else {
            self.fill.run(&key, path).await
        };

        match document {
            Ok(document) => Ok(Served {
                status: CacheStatus::Miss,
                document,
            }),
            Err(err) => {
                counter!(METRIC_ORIGIN_FAILURE).increment(1);
                Err(err)
            }
        }
    }

    async fn lookup(&self, key: &CacheKey) -> Result<Option<CachedResponse>> {
        match self.store.read(key).await {
            Ok(found) => Ok(found),
            Err(err) => match self.config.store_failure_policy {
                StoreFailurePolicy::FailClosed => Err(err.into()),
                StoreFailurePolicy::FailOpen => {
                    warn!(%key, error = %err, "cache lookup failed, serving from origin");
                    Ok(None)
                }
            },
        }
    }

    /// Join an outstanding fetch for the same key, or lead a new one.
    async fn fetch_coalesced(&self, key: &CacheKey, path: &str) -> Result<CachedResponse> {
        let leader = match self.inflight.entry(key.clone()) {
            Entry::Occupied(e) => Err(e.get().clone()),
            Entry::Vacant(e) => {
                let (tx, rx) = watch::channel(Flight::Pending);
                e.insert(rx);
                Ok(tx)
            }
        };

        match leader {
            Ok(tx) => {
                let guard = FlightGuard {
                    inflight: Arc::clone(&self.inflight),
                    key: key.clone(),
                };
                let fill = self.fill.clone();
                let key = key.clone();
                let path = path.to_owned();

                // Detached from this request: waiters get their answer even
                // if the leading client goes away mid-fetch.
                let flight = tokio::spawn(async move {
                    let _guard = guard;
                    let result = fill.run(&key, &path).await;
                    let _ = tx.send(match &result {
                        Ok(document) => Flight::Ready(document.clone()),
                        Err(_) => Flight::Failed,
                    });
                    result
                });

                flight.await.unwrap_or_else(|err| {
                    warn!(error = %err, "coalesced origin fetch did not complete");
                    Err(ProxyError::CoalescedFetchFailed)
                })
            }
            Err(mut rx) => {
                let outcome = rx
                    .wait_for(|flight| !matches!(flight, Flight::Pending))
                    .await
                    .map(|flight| flight.clone());
                match outcome {
                    Ok(Flight::Ready(document)) => Ok(document),
                    _ => Err(ProxyError::CoalescedFetchFailed),
                }
            }
        }
    }

    fn write_response(&self, served: Served) -> Response {
        let expires_at = freshness_timestamp(self.config.max_age);
        (
            StatusCode::OK,
            [
                (
                    HeaderName::from_static(CACHE_STATUS_HEADER),
                    HeaderValue::from_static(served.status.as_str()),
                ),
                (
                    HeaderName::from_static(FRESHNESS_HEADER),
                    HeaderValue::from(expires_at),
                ),
            ],
            Json(served.document.into_body()),
        )
            .into_response()
    }

    pub async fn handle_health(State(server): State<Arc<ProxyServer>>) -> impl IntoResponse {
        let (status, store) = match server.store.ping().await {
            Ok(()) => ("healthy", "healthy".to_string()),
            Err(e) => ("degraded", format!("unhealthy: {e}")),
        };

        Json(json!({
            "status": status,
            "origin": server.config.origin.base(),
            "store": store,
            "writeback": {
                "capacity": server.fill.writeback.capacity(),
                "pending": server.fill.writeback.pending(),
            },
        }))
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }
}

/// Absolute Unix time at which a response served now should be considered
/// stale. Derived from the configured max-age, not the store's remaining TTL.
pub fn freshness_timestamp(max_age: Duration) -> u64 {
    SystemTime::now()
        .checked_add(max_age)
        .unwrap_or_else(SystemTime::now)
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freshness_is_now_plus_max_age() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let ts = freshness_timestamp(Duration::from_secs(86400));
        assert!(ts >= now + 86400 && ts <= now + 86401);
    }

    #[test]
    fn cache_status_labels() {
        assert_eq!(CacheStatus::Hit.as_str(), "HIT");
        assert_eq!(CacheStatus::Miss.as_str(), "MISS");
    }
}
