//! Read-through caching proxy for a single JSON origin.
//!
//! Every `GET` is keyed by origin and path. Hits are answered from the cache
//! store; misses are fetched from the origin, answered, and handed to a
//! background worker that writes them back with a fixed TTL.

use std::{any::Any, future::Future, io, sync::Arc, time::Duration};

use axum::{
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info, warn};

pub mod cache_key;
pub mod config;
pub mod error;
pub mod origin;
pub mod proxy;
pub mod store;
pub mod telemetry;
pub mod writeback;

pub use cache_key::{derive_key, CacheKey, Origin};
pub use config::{CliArgs, FileConfig, ProxyConfig, StoreFailurePolicy, WritePolicy};
pub use error::{ProxyError, Result};
pub use origin::{OriginFetcher, OriginResponse};
pub use proxy::{CacheStatus, ProxyServer, Served};
pub use store::{CacheStore, CacheStoreAdapter, CachedResponse, MemoryStore, RedisStore, StoreError};
pub use writeback::{EnqueueOutcome, WriteBackItem, WriteBackQueue, WriteBackReport, WriteBackWorker};

// Constants
pub const DEFAULT_LISTEN: &str = "0.0.0.0";
pub const DEFAULT_STORE_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 3600);
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(4);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(4);
pub const ORIGIN_TIMEOUT: Duration = Duration::from_secs(30);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
pub const STORE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_ORIGIN_BODY_SIZE: usize = 10 << 20; // 10 MB

pub const CACHE_STATUS_HEADER: &str = "x-cache";
/// Carries the absolute Unix time the response is considered fresh until.
pub const FRESHNESS_HEADER: &str = "max-age";
/// Reserved path, answered by the proxy itself and never forwarded.
pub const HEALTH_PATH: &str = "/_proxy/health";

/// HTTP surface: the health probe plus a catch-all proxy route.
pub fn router(server: Arc<ProxyServer>) -> Router {
    let request_timeout = server.config().request_timeout;

    Router::new()
        .route(HEALTH_PATH, get(ProxyServer::handle_health))
        .fallback(ProxyServer::handle_proxy)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::GATEWAY_TIMEOUT,
            request_timeout,
        ))
        .layer(middleware::map_response(request_timeout_body))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(panic_response))
        .with_state(server)
}

/// The request timeout answers with a bare status; give it the same JSON
/// shape as every other error.
async fn request_timeout_body(response: Response) -> Response {
    if response.status() != StatusCode::GATEWAY_TIMEOUT
        || response.headers().contains_key(header::CONTENT_TYPE)
    {
        return response;
    }
    warn!("request exceeded the overall time budget");

    (
        StatusCode::GATEWAY_TIMEOUT,
        Json(json!({ "message": "request timed out" })),
    )
        .into_response()
}

/// A panicking handler never takes the process down; the client gets the
/// same generic 500 as any other internal failure.
fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(panic = detail, "request handler panicked");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "message": "internal server error" })),
    )
        .into_response()
}

/// Serve until `shutdown` resolves, then stop accepting connections, give
/// in-flight requests the configured grace period, and finally close the
/// write-back queue and wait for its worker.
pub async fn serve<F>(
    config: ProxyConfig,
    store: Arc<dyn CacheStore>,
    listener: TcpListener,
    shutdown: F,
) -> Result<WriteBackReport>
where
    F: Future<Output = ()> + Send + 'static,
{
    let grace = config.shutdown_grace;
    let (server, worker) = ProxyServer::new(config, store)?;

    info!(
        addr = %listener.local_addr()?,
        origin = %server.config().origin,
        "proxy server started"
    );

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let app = router(server);
    let mut http = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .await
    });

    let exit = tokio::select! {
        _ = shutdown => {
            info!("shutting down server");
            let _ = stop_tx.send(());
            match tokio::time::timeout(grace, &mut http).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(grace = ?grace, "grace period elapsed, abandoning in-flight requests");
                    http.abort();
                    Ok(Ok(()))
                }
            }
        }
        joined = &mut http => joined,
    };

    let report = worker.shutdown().await;
    info!("server shutdown complete");

    match exit {
        Ok(result) => Ok(result.map(|()| report)?),
        Err(err) => Err(ProxyError::Io(io::Error::other(err))),
    }
}
