use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use http_proxy_cache::config::{Config, StoreBackend};
use http_proxy_cache::prelude::*;
use hyper::client::HttpConnector;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client, Method, Request, Response, Server, StatusCode};
use serde_json::{json, Value};
use tokio::sync::oneshot;

async fn spawn_upstream(hits: Arc<AtomicUsize>) -> SocketAddr {
    let make_svc = make_service_fn(move |_conn: &AddrStream| {
        let hits = hits.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let body = json!({ "path": req.uri().path(), "method": req.method().as_str() });
                    Ok::<_, Infallible>(
                        Response::builder()
                            .header("content-type", "application/json")
                            .body(Body::from(body.to_string()))
                            .unwrap(),
                    )
                }
            }))
        }
    });
    let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make_svc);
    let addr = server.local_addr();
    tokio::spawn(server);
    addr
}

struct TestProxy {
    addr: SocketAddr,
    client: Client<HttpConnector>,
    _shutdown: oneshot::Sender<()>,
}

impl TestProxy {
    async fn start(backend: StoreBackend) -> Self {
        let mut config = Config::default();
        config.server.port = 0;
        config.store.backend = backend;

        let server = ProxyServer::from_config(&config).unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let (addr, serving) = server
            .serve_with_shutdown(async {
                rx.await.ok();
            })
            .unwrap();
        tokio::spawn(serving);

        Self {
            addr,
            client: Client::new(),
            _shutdown: tx,
        }
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, hyper::HeaderMap, Value) {
        let response = self.client.request(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        (status, headers, serde_json::from_slice(&bytes).unwrap())
    }

    async fn forward(&self, envelope: Value) -> (StatusCode, hyper::HeaderMap, Value) {
        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("http://{}/api/proxy", self.addr))
            .header("content-type", "application/json")
            .header("x-forwarded-for", "203.0.113.50")
            .body(Body::from(envelope.to_string()))
            .unwrap();
        self.send(request).await
    }

    async fn cache_status(&self) -> Value {
        let request = Request::get(format!("http://{}/api/cache-status", self.addr))
            .body(Body::empty())
            .unwrap();
        self.send(request).await.2
    }
}

#[tokio::test]
async fn test_cache_status_reflects_backend() {
    let without = TestProxy::start(StoreBackend::None).await;
    assert_eq!(without.cache_status().await, json!({ "available": false }));

    let with = TestProxy::start(StoreBackend::Memory).await;
    assert_eq!(with.cache_status().await, json!({ "available": true }));
}

#[tokio::test]
async fn test_forward_miss_then_hit() {
    let hits = Arc::new(AtomicUsize::new(0));
    let upstream = spawn_upstream(hits.clone()).await;
    let proxy = TestProxy::start(StoreBackend::Memory).await;

    let envelope = json!({
        "url": format!("http://{}/users/1", upstream),
        "method": "GET",
        "headers": { "Accept": "application/json" },
        "cache": { "enabled": true, "ttl": 20 }
    });

    let (status, _, first) = proxy.forward(envelope.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["status"], 200);
    assert_eq!(first["statusText"], "OK");
    assert_eq!(first["data"], json!({ "path": "/users/1", "method": "GET" }));
    assert_eq!(first["cache"]["hit"], false);
    assert!(first["timing"].is_u64());

    let (status, _, second) = proxy.forward(envelope).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["cache"]["hit"], true);
    let ttl = second["cache"]["ttl"].as_i64().unwrap();
    assert!(ttl > 0 && ttl <= 20);
    assert!(second["cache"]["timeSaved"].is_i64());
    assert_eq!(second["data"], first["data"]);

    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_uncached_requests_always_reach_upstream() {
    let hits = Arc::new(AtomicUsize::new(0));
    let upstream = spawn_upstream(hits.clone()).await;
    let proxy = TestProxy::start(StoreBackend::Memory).await;

    let envelope = json!({ "url": format!("http://{}/plain", upstream), "method": "post", "body": "x" });
    for _ in 0..25 {
        let (status, _, body) = proxy.forward(envelope.clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cache"], json!({ "hit": false }));
    }
    assert_eq!(hits.load(Ordering::SeqCst), 25);
}

#[tokio::test]
async fn test_rate_limit_over_http() {
    let hits = Arc::new(AtomicUsize::new(0));
    let upstream = spawn_upstream(hits.clone()).await;
    let proxy = TestProxy::start(StoreBackend::Memory).await;

    let envelope = json!({
        "url": format!("http://{}/quota", upstream),
        "cache": { "enabled": true }
    });
    for _ in 0..20 {
        let (status, _, _) = proxy.forward(envelope.clone()).await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, headers, body) = proxy.forward(envelope).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "Rate limit exceeded");
    let retry_after: i64 = headers
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after > 0 && retry_after <= 60);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_error_mapping_over_http() {
    let proxy = TestProxy::start(StoreBackend::None).await;

    let (status, _, body) = proxy.forward(json!({ "url": "ftp://example.com" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid URL");

    let (status, _, body) = proxy.forward(json!({ "method": "GET" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid URL");

    let (status, _, body) = proxy.forward(json!({ "url": "http://127.0.0.1:1/" })).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Failed to proxy request");
    assert!(body["details"].is_string());
}
