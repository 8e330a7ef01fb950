use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use hyper::header::{HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::error::ProxyError;
use crate::gatekeeper::Gatekeeper;
use crate::logger::log_request;
use crate::model::{CacheStatus, ErrorBody, ForwardRequest};
use crate::store::StoreHandle;
use crate::utils::client_identity;

pub const PROXY_PATH: &str = "/api/proxy";
pub const CACHE_STATUS_PATH: &str = "/api/cache-status";

struct AppState {
    gatekeeper: Gatekeeper,
    store: Arc<StoreHandle>,
}

pub struct ProxyServer {
    addr: SocketAddr,
    state: Arc<AppState>,
}

impl ProxyServer {
    pub fn new(addr: SocketAddr, gatekeeper: Gatekeeper, store: Arc<StoreHandle>) -> Self {
        info!("Creating proxy server on {}", addr);
        Self {
            addr,
            state: Arc::new(AppState { gatekeeper, store }),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, ProxyError> {
        let store = Arc::new(StoreHandle::from_config(&config.store));
        let gatekeeper = Gatekeeper::from_config(config, store.clone());
        Ok(Self::new(config.listen_addr()?, gatekeeper, store))
    }

    /// Binds the listener and returns the bound address with the server
    /// future, which completes once `shutdown` resolves and connections drain.
    pub fn serve_with_shutdown<F>(
        &self,
        shutdown: F,
    ) -> Result<(SocketAddr, impl Future<Output = Result<(), ProxyError>>), ProxyError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let state = self.state.clone();

        let make_svc = make_service_fn(move |conn: &AddrStream| {
            let remote_addr = conn.remote_addr();
            debug!("New connection from: {}", remote_addr);
            let state = state.clone();

            async move {
                Ok::<_, hyper::Error>(service_fn(move |req| {
                    let state = state.clone();
                    Self::handle_request(req, remote_addr, state)
                }))
            }
        });

        let server = Server::try_bind(&self.addr)
            .map_err(|e| ProxyError::Network(format!("failed to bind {}: {}", self.addr, e)))?
            .serve(make_svc);
        let local_addr = server.local_addr();
        self.state.store.connect_in_background();
        info!("Proxy server is ready to accept connections on {}", local_addr);

        let graceful = server.with_graceful_shutdown(shutdown);
        Ok((local_addr, async move {
            graceful.await.map_err(|e| {
                error!("Server error: {}", e);
                ProxyError::Network(e.to_string())
            })
        }))
    }

    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), ProxyError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (_, server) = self.serve_with_shutdown(shutdown)?;
        server.await
    }

    async fn handle_request(
        req: Request<Body>,
        remote_addr: SocketAddr,
        state: Arc<AppState>,
    ) -> Result<Response<Body>, hyper::Error> {
        let started = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let span = info_span!("request", request_id = %Uuid::new_v4(), %method, %path);

        let response = Self::route(req, remote_addr, &state).instrument(span).await;

        log_request(method.as_str(), &path, response.status().as_u16(), started.elapsed());
        Ok(response)
    }

    async fn route(req: Request<Body>, remote_addr: SocketAddr, state: &AppState) -> Response<Body> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        match (&method, path.as_str()) {
            (&Method::POST, PROXY_PATH) => Self::forward(req, remote_addr, state).await,
            (&Method::GET, CACHE_STATUS_PATH) => json_response(
                StatusCode::OK,
                &CacheStatus {
                    available: state.store.is_configured(),
                },
            ),
            (_, PROXY_PATH) | (_, CACHE_STATUS_PATH) => json_response(
                StatusCode::METHOD_NOT_ALLOWED,
                &ErrorBody::new("Method not allowed", None),
            ),
            _ => json_response(StatusCode::NOT_FOUND, &ErrorBody::new("Not found", None)),
        }
    }

    async fn forward(req: Request<Body>, remote_addr: SocketAddr, state: &AppState) -> Response<Body> {
        let client = client_identity(req.headers(), Some(remote_addr.ip()));

        let body = match hyper::body::to_bytes(req.into_body()).await {
            Ok(body) => body,
            Err(e) => {
                return error_response(ProxyError::InvalidRequest(format!("could not read body: {}", e)))
            }
        };
        let request: ForwardRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => return error_response(ProxyError::InvalidRequest(e.to_string())),
        };

        match state.gatekeeper.handle(request, &client).await {
            Ok(envelope) => json_response(StatusCode::OK, &envelope),
            Err(e) => error_response(e),
        }
    }
}

fn error_response(err: ProxyError) -> Response<Body> {
    let status = err.status_code();
    if status.is_server_error() {
        error!("Proxy request failed: {}", err);
    } else {
        warn!("Proxy request rejected: {}", err);
    }

    let mut response = json_response(status, &err.body());
    if let ProxyError::RateLimited { retry_after: Some(secs) } = err {
        response.headers_mut().insert(RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let (status, payload) = match serde_json::to_vec(body) {
        Ok(payload) => (status, payload),
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                br#"{"error":"Failed to serialize response"}"#.to_vec(),
            )
        }
    };

    let mut response = Response::new(Body::from(payload));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AppState {
        let store = Arc::new(StoreHandle::disabled());
        AppState {
            gatekeeper: Gatekeeper::from_config(&Config::default(), store.clone()),
            store,
        }
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 50000))
    }

    async fn body_json(response: Response<Body>) -> serde_json::Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_cache_status_unconfigured() {
        let req = Request::get(CACHE_STATUS_PATH).body(Body::empty()).unwrap();
        let response = ProxyServer::route(req, peer(), &state()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!({ "available": false }));
    }

    #[tokio::test]
    async fn test_unknown_routes() {
        let req = Request::get("/nope").body(Body::empty()).unwrap();
        let response = ProxyServer::route(req, peer(), &state()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let req = Request::get(PROXY_PATH).body(Body::empty()).unwrap();
        let response = ProxyServer::route(req, peer(), &state()).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_malformed_envelope() {
        let req = Request::post(PROXY_PATH).body(Body::from("{not json")).unwrap();
        let response = ProxyServer::route(req, peer(), &state()).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "Invalid request");
    }

    #[tokio::test]
    async fn test_rejects_non_http_scheme() {
        let body = serde_json::json!({ "url": "ftp://example.com", "method": "GET" });
        let req = Request::post(PROXY_PATH).body(Body::from(body.to_string())).unwrap();
        let response = ProxyServer::route(req, peer(), &state()).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(body_json(response).await["error"], "Invalid URL");
    }

    #[test]
    fn test_rate_limited_response_has_retry_after() {
        let response = error_response(ProxyError::RateLimited { retry_after: Some(37) });
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "37");
    }
}
