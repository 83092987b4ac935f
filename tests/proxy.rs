mod common;

use std::{
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use axum::http::{header, Method, StatusCode};
use serde_json::json;
use tokio::sync::oneshot;

use cache_proxy::{
    derive_key, CacheStore, MemoryStore, ProxyConfig, ProxyServer, StoreFailurePolicy,
    WriteBackWorker,
};

use common::{
    closed_origin, eventually, get_path, send, spawn_upstream, HangingStore, PanickingStore,
    StuckWriterStore,
};

fn app_with(
    config: ProxyConfig,
    store: Arc<dyn CacheStore>,
) -> (axum::Router, Arc<ProxyServer>, WriteBackWorker) {
    let (server, worker) = ProxyServer::new(config, store).unwrap();
    (cache_proxy::router(server.clone()), server, worker)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

#[tokio::test]
async fn miss_then_hit_goes_to_origin_once() {
    let upstream = spawn_upstream().await;
    let store = Arc::new(MemoryStore::new());
    let config = ProxyConfig::new(&upstream.origin(), 8080).unwrap();
    let (app, _server, worker) = app_with(config, store.clone());

    let first = get_path(&app, "/users/1").await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.cache_status(), Some("MISS"));
    assert_eq!(first.json(), json!({ "id": 1 }));
    assert_eq!(upstream.hits(), 1);

    eventually(|| store.len() == 1).await;
    let key = derive_key(&upstream.origin(), "/users/1").unwrap();
    let stored = store.get(key.as_str()).await.unwrap().expect("entry");
    assert_eq!(serde_json::from_str::<serde_json::Value>(&stored).unwrap(), json!({ "id": 1 }));

    let second = get_path(&app, "/users/1").await;
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(second.cache_status(), Some("HIT"));
    assert_eq!(second.json(), json!({ "id": 1 }));
    assert_eq!(upstream.hits(), 1);

    let report = worker.shutdown().await;
    assert_eq!(report.written, 1);
    assert_eq!(report.failed, 0);
}

#[tokio::test]
async fn responses_carry_freshness_and_content_type() {
    let upstream = spawn_upstream().await;
    let config = ProxyConfig::new(&upstream.origin(), 8080)
        .unwrap()
        .with_max_age(Duration::from_secs(600));
    let (app, _server, worker) = app_with(config, Arc::new(MemoryStore::new()));

    let before = now_secs();
    let reply = get_path(&app, "/items/7").await;
    let after = now_secs();

    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json(), json!({ "item": 7 }));
    assert_eq!(
        reply.headers.get(header::CONTENT_TYPE).unwrap(),
        "application/json"
    );

    let fresh_until: u64 = reply
        .headers
        .get("max-age")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .expect("max-age header");
    assert!(fresh_until >= before + 600 && fresh_until <= after + 600);

    worker.shutdown().await;
}

#[tokio::test]
async fn distinct_paths_are_cached_separately() {
    let upstream = spawn_upstream().await;
    let store = Arc::new(MemoryStore::new());
    let config = ProxyConfig::new(&upstream.origin(), 8080).unwrap();
    let (app, _server, worker) = app_with(config, store.clone());

    assert_eq!(get_path(&app, "/items/1").await.json(), json!({ "item": 1 }));
    assert_eq!(get_path(&app, "/items/2").await.json(), json!({ "item": 2 }));
    eventually(|| store.len() == 2).await;

    let hit = get_path(&app, "/items/2").await;
    assert_eq!(hit.cache_status(), Some("HIT"));
    assert_eq!(hit.json(), json!({ "item": 2 }));
    assert_eq!(upstream.hits(), 2);

    worker.shutdown().await;
}

#[tokio::test]
async fn origin_error_status_is_bad_gateway_and_not_cached() {
    let upstream = spawn_upstream().await;
    let store = Arc::new(MemoryStore::new());
    let config = ProxyConfig::new(&upstream.origin(), 8080).unwrap();
    let (app, _server, worker) = app_with(config, store.clone());

    for expected_hits in 1..=2 {
        let reply = get_path(&app, "/missing").await;
        assert_eq!(reply.status, StatusCode::BAD_GATEWAY);
        assert_eq!(reply.json(), json!({ "message": "bad gateway" }));
        assert_eq!(upstream.hits(), expected_hits);
    }

    let report = worker.shutdown().await;
    assert_eq!(report.written, 0);
    assert!(store.is_empty());
}

#[tokio::test]
async fn non_json_origin_body_is_never_cached() {
    let upstream = spawn_upstream().await;
    let store = Arc::new(MemoryStore::new());
    let config = ProxyConfig::new(&upstream.origin(), 8080).unwrap();
    let (app, _server, worker) = app_with(config, store.clone());

    let first = get_path(&app, "/html").await;
    assert_eq!(first.status, StatusCode::BAD_GATEWAY);
    assert!(!String::from_utf8_lossy(&first.body).contains("html"));

    let second = get_path(&app, "/html").await;
    assert_eq!(second.status, StatusCode::BAD_GATEWAY);
    assert_eq!(upstream.hits(), 2);

    worker.shutdown().await;
    assert!(store.is_empty());
}

#[tokio::test]
async fn unreachable_origin_is_bad_gateway() {
    let origin = closed_origin().await;
    let config = ProxyConfig::new(&origin, 8080).unwrap();
    let (app, _server, worker) = app_with(config, Arc::new(MemoryStore::new()));

    let reply = get_path(&app, "/users/1").await;
    assert_eq!(reply.status, StatusCode::BAD_GATEWAY);
    assert_eq!(reply.json(), json!({ "message": "bad gateway" }));

    worker.shutdown().await;
}

#[tokio::test]
async fn slow_origin_times_out_with_gateway_timeout() {
    let upstream = spawn_upstream().await;
    let config = ProxyConfig::new(&upstream.origin(), 8080)
        .unwrap()
        .with_origin_timeout(Duration::from_millis(300));
    let (app, _server, worker) = app_with(config, Arc::new(MemoryStore::new()));

    let started = Instant::now();
    let reply = get_path(&app, "/slow").await;
    assert_eq!(reply.status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(reply.json(), json!({ "message": "origin timed out" }));
    assert!(started.elapsed() < Duration::from_secs(3));

    worker.shutdown().await;
}

#[tokio::test]
async fn store_outage_fails_closed_without_touching_origin() {
    let upstream = spawn_upstream().await;
    let config = ProxyConfig::new(&upstream.origin(), 8080)
        .unwrap()
        .with_lookup_timeout(Duration::from_millis(200));
    let (app, _server, worker) = app_with(config, Arc::new(HangingStore));

    let reply = get_path(&app, "/users/1").await;
    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(reply.json(), json!({ "message": "internal server error" }));
    assert_eq!(upstream.hits(), 0);

    worker.shutdown().await;
}

#[tokio::test]
async fn store_outage_fails_open_when_configured() {
    let upstream = spawn_upstream().await;
    let config = ProxyConfig::new(&upstream.origin(), 8080)
        .unwrap()
        .with_lookup_timeout(Duration::from_millis(200))
        .with_write_timeout(Duration::from_millis(200))
        .with_store_failure_policy(StoreFailurePolicy::FailOpen);
    let (app, _server, worker) = app_with(config, Arc::new(HangingStore));

    let reply = get_path(&app, "/users/1").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.cache_status(), Some("MISS"));
    assert_eq!(reply.json(), json!({ "id": 1 }));
    assert_eq!(upstream.hits(), 1);

    let report = worker.shutdown().await;
    assert_eq!(report.written, 0);
}

#[tokio::test]
async fn saturated_write_back_never_delays_responses() {
    let upstream = spawn_upstream().await;
    let config = ProxyConfig::new(&upstream.origin(), 8080)
        .unwrap()
        .with_queue_capacity(1)
        .with_write_timeout(Duration::from_secs(60));
    let (app, server, worker) = app_with(config, Arc::new(StuckWriterStore));

    let started = Instant::now();
    for id in 0..10 {
        let reply = get_path(&app, &format!("/items/{id}")).await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.cache_status(), Some("MISS"));
        assert_eq!(reply.json(), json!({ "item": id }));
    }
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(server.writeback().pending() <= 1);

    assert_eq!(upstream.hits(), 10);

    // The worker is parked on a write that never completes.
    drop(worker);
}

#[tokio::test]
async fn non_get_methods_are_rejected() {
    let upstream = spawn_upstream().await;
    let config = ProxyConfig::new(&upstream.origin(), 8080).unwrap();
    let (app, _server, worker) = app_with(config, Arc::new(MemoryStore::new()));

    for method in [Method::POST, Method::PUT, Method::DELETE] {
        let reply = send(&app, method, "/users/1").await;
        assert_eq!(reply.status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(reply.headers.get(header::ALLOW).unwrap(), "GET");
    }
    assert_eq!(upstream.hits(), 0);

    worker.shutdown().await;
}

#[tokio::test]
async fn health_reports_store_and_queue() {
    let upstream = spawn_upstream().await;
    let config = ProxyConfig::new(&upstream.origin(), 8080)
        .unwrap()
        .with_queue_capacity(8);
    let (app, _server, worker) = app_with(config, Arc::new(MemoryStore::new()));

    let reply = get_path(&app, "/_proxy/health").await;
    assert_eq!(reply.status, StatusCode::OK);
    let body = reply.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["store"], "healthy");
    assert_eq!(body["origin"], upstream.origin());
    assert_eq!(body["writeback"]["capacity"], 8);
    assert_eq!(upstream.hits(), 0);

    worker.shutdown().await;
}

#[tokio::test]
async fn serve_handles_requests_and_drains_on_shutdown() {
    let upstream = spawn_upstream().await;
    let store = Arc::new(MemoryStore::new());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = ProxyConfig::new(&upstream.origin(), addr.port()).unwrap();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let proxy = tokio::spawn(cache_proxy::serve(
        config,
        store.clone(),
        listener,
        async move {
            let _ = stop_rx.await;
        },
    ));

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{addr}/users/1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(resp.headers().get("x-cache").unwrap(), "MISS");
    assert_eq!(resp.json::<serde_json::Value>().await.unwrap(), json!({ "id": 1 }));

    eventually(|| store.len() == 1).await;

    let resp = client
        .get(format!("http://{addr}/users/1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers().get("x-cache").unwrap(), "HIT");
    assert_eq!(upstream.hits(), 1);

    stop_tx.send(()).unwrap();
    let report = proxy.await.unwrap().unwrap();
    assert_eq!(report.written, 1);
    assert_eq!(report.abandoned, 0);
}

#[tokio::test]
async fn errors_after_a_miss_are_marked_miss_without_freshness() {
    let upstream = spawn_upstream().await;
    let config = ProxyConfig::new(&upstream.origin(), 8080).unwrap();
    let (app, _server, worker) = app_with(config, Arc::new(MemoryStore::new()));

    let reply = get_path(&app, "/missing").await;
    assert_eq!(reply.status, StatusCode::BAD_GATEWAY);
    assert_eq!(reply.cache_status(), Some("MISS"));
    assert!(reply.headers.get("max-age").is_none());

    worker.shutdown().await;
}

#[tokio::test]
async fn store_failure_carries_no_cache_status() {
    let upstream = spawn_upstream().await;
    let config = ProxyConfig::new(&upstream.origin(), 8080)
        .unwrap()
        .with_lookup_timeout(Duration::from_millis(100));
    let (app, _server, worker) = app_with(config, Arc::new(HangingStore));

    let reply = get_path(&app, "/users/1").await;
    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(reply.cache_status(), None);

    worker.shutdown().await;
}

#[tokio::test]
async fn oversized_body_with_content_length_is_rejected() {
    let upstream = spawn_upstream().await;
    let store = Arc::new(MemoryStore::new());
    let config = ProxyConfig::new(&upstream.origin(), 8080)
        .unwrap()
        .with_max_body_bytes(1024);
    let (app, _server, worker) = app_with(config, store.clone());

    let reply = get_path(&app, "/big").await;
    assert_eq!(reply.status, StatusCode::BAD_GATEWAY);
    assert_eq!(reply.json(), json!({ "message": "bad gateway" }));

    let report = worker.shutdown().await;
    assert_eq!(report.written, 0);
    assert!(store.is_empty());
}

#[tokio::test]
async fn unbounded_chunked_body_is_cut_off_at_the_limit() {
    let upstream = spawn_upstream().await;
    let config = ProxyConfig::new(&upstream.origin(), 8080)
        .unwrap()
        .with_max_body_bytes(16 * 1024)
        .with_origin_timeout(Duration::from_secs(5));
    let (app, _server, worker) = app_with(config, Arc::new(MemoryStore::new()));

    let started = Instant::now();
    let reply = get_path(&app, "/big-chunked").await;
    assert_eq!(reply.status, StatusCode::BAD_GATEWAY);
    assert_eq!(reply.json(), json!({ "message": "bad gateway" }));
    assert!(started.elapsed() < Duration::from_secs(4));

    worker.shutdown().await;
}

#[tokio::test]
async fn handler_panic_becomes_generic_500() {
    let upstream = spawn_upstream().await;
    let config = ProxyConfig::new(&upstream.origin(), 8080).unwrap();
    let (app, _server, worker) = app_with(config, Arc::new(PanickingStore));

    let reply = get_path(&app, "/users/1").await;
    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(reply.json(), json!({ "message": "internal server error" }));
    assert!(!String::from_utf8_lossy(&reply.body).contains("secret"));
    assert_eq!(upstream.hits(), 0);

    // The router keeps serving after a panic.
    let health = get_path(&app, "/_proxy/health").await;
    assert_eq!(health.status, StatusCode::OK);

    worker.shutdown().await;
}

#[tokio::test]
async fn request_timeout_answers_with_json_body() {
    let upstream = spawn_upstream().await;
    let config = ProxyConfig::new(&upstream.origin(), 8080)
        .unwrap()
        .with_request_timeout(Duration::from_millis(200));
    let (app, _server, worker) = app_with(config, Arc::new(MemoryStore::new()));

    let reply = get_path(&app, "/slow").await;
    assert_eq!(reply.status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(
        reply.headers.get(header::CONTENT_TYPE).unwrap(),
        "application/json"
    );
    assert_eq!(reply.json(), json!({ "message": "request timed out" }));

    worker.shutdown().await;
}
