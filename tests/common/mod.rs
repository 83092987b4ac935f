#![allow(dead_code)]

use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body, Bytes},
    extract::Path,
    http::{HeaderMap, Method, Request, StatusCode},
    routing::get,
    Router,
};
use futures_util::stream;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use cache_proxy::{CacheStore, StoreError, WritePolicy};

/// Local origin server counting every request it answers.
pub struct Upstream {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
}

impl Upstream {
    pub fn origin(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

pub async fn spawn_upstream() -> Upstream {
    let hits = Arc::new(AtomicUsize::new(0));

    let counted = |hits: Arc<AtomicUsize>| {
        move |req: Request<Body>| {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                req
            }
        }
    };

    let app = Router::new()
        .route("/users/1", get(|| async { axum::Json(json!({ "id": 1 })) }))
        .route(
            "/items/{id}",
            get(|Path(id): Path<u64>| async move { axum::Json(json!({ "item": id })) }),
        )
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                axum::Json(json!({ "slow": true }))
            }),
        )
        .route(
            "/delayed",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                axum::Json(json!({ "ok": true, "value": 123 }))
            }),
        )
        .route(
            "/big",
            get(|| async { axum::Json(json!({ "blob": "x".repeat(8 * 1024) })) }),
        )
        .route(
            "/big-chunked",
            get(|| async {
                // Never ends; only a reader that enforces a limit gets out.
                let chunks = stream::repeat_with(|| {
                    Ok::<_, Infallible>(Bytes::from_static(&[b' '; 1024]))
                });
                ([("content-type", "application/json")], Body::from_stream(chunks))
            }),
        )
        .route(
            "/html",
            get(|| async { ([("content-type", "text/html")], "<html>not json</html>") }),
        )
        .route(
            "/missing",
            get(|| async { (StatusCode::NOT_FOUND, axum::Json(json!({ "error": "nope" }))) }),
        )
        .layer(axum::middleware::map_request(counted(hits.clone())));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Upstream { addr, hits }
}

/// Address nothing is listening on.
pub async fn closed_origin() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("JSON body")
    }

    pub fn cache_status(&self) -> Option<&str> {
        self.headers.get("x-cache").and_then(|v| v.to_str().ok())
    }
}

pub async fn send(app: &Router, method: Method, uri: &str) -> Reply {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap().to_vec();
    Reply {
        status,
        headers,
        body,
    }
}

pub async fn get_path(app: &Router, uri: &str) -> Reply {
    send(app, Method::GET, uri).await
}

/// Poll until `check` holds, failing the test after two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

/// Store whose reads and writes never complete.
pub struct HangingStore;

#[async_trait]
impl CacheStore for HangingStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        std::future::pending().await
    }

    async fn set(
        &self,
        _key: &str,
        _value: String,
        _ttl: Duration,
        _policy: WritePolicy,
    ) -> Result<(), StoreError> {
        std::future::pending().await
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Store that misses on every read and never finishes a write.
pub struct StuckWriterStore;

#[async_trait]
impl CacheStore for StuckWriterStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Ok(None)
    }

    async fn set(
        &self,
        _key: &str,
        _value: String,
        _ttl: Duration,
        _policy: WritePolicy,
    ) -> Result<(), StoreError> {
        std::future::pending().await
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Store whose lookups panic, to exercise the handler panic boundary.
pub struct PanickingStore;

#[async_trait]
impl CacheStore for PanickingStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        panic!("store exploded: secret detail");
    }

    async fn set(
        &self,
        _key: &str,
        _value: String,
        _ttl: Duration,
        _policy: WritePolicy,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
