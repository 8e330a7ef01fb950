use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use hyper::client::HttpConnector;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{Body, Client, HeaderMap, Request};
use hyper_tls::HttpsConnector;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::UpstreamError;
use crate::model::{ForwardRequest, ResponseData, UpstreamResponse};

pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Framing and hop-by-hop headers the client computes itself.
const SKIPPED_REQUEST_HEADERS: &[&str] = &["host", "content-length", "transfer-encoding", "connection"];

#[async_trait]
pub trait Upstream: Send + Sync {
    /// Performs the outbound call. The returned `timing_ms` covers sending the
    /// request through reading the full body.
    async fn forward(&self, request: &ForwardRequest) -> Result<UpstreamResponse, UpstreamError>;
}

pub struct HttpForwarder {
    client: Client<HttpsConnector<HttpConnector>>,
    timeout: Duration,
}

impl HttpForwarder {
    pub fn new(timeout: Duration) -> Self {
        info!("Creating upstream forwarder with timeout {:?}", timeout);
        Self {
            client: Client::builder().build::<_, Body>(HttpsConnector::new()),
            timeout,
        }
    }

    /// Header names are case-insensitive upstream; when the caller sends the
    /// same name twice in different case, one value is kept.
    fn build_request(request: &ForwardRequest) -> Result<Request<Body>, UpstreamError> {
        let url = Url::parse(&request.url)
            .map_err(|e| UpstreamError::Network(format!("invalid url {}: {}", request.url, e)))?;

        let body = match request.outbound_body() {
            Some(body) => Body::from(body.to_string()),
            None => Body::empty(),
        };
        let mut outbound = Request::builder()
            .method(request.method.clone())
            .uri(url.as_str())
            .body(body)
            .map_err(|e| UpstreamError::Network(e.to_string()))?;

        let headers = outbound.headers_mut();
        for (name, value) in &request.headers {
            if SKIPPED_REQUEST_HEADERS.iter().any(|skip| name.eq_ignore_ascii_case(skip)) {
                debug!("Not forwarding header {}", name);
                continue;
            }
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| UpstreamError::Network(format!("invalid header name {:?}: {}", name, e)))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| UpstreamError::Network(format!("invalid value for header {}: {}", name, e)))?;
            headers.insert(header_name, header_value);
        }
        Ok(outbound)
    }

    #[tracing::instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn send(&self, request: &ForwardRequest) -> Result<UpstreamResponse, UpstreamError> {
        let outbound = Self::build_request(request)?;

        let started = Instant::now();
        let response = self
            .client
            .request(outbound)
            .await
            .map_err(|e| UpstreamError::Network(e.to_string()))?;
        let (parts, body) = response.into_parts();
        let bytes = hyper::body::to_bytes(body)
            .await
            .map_err(|e| UpstreamError::Network(e.to_string()))?;
        let timing_ms = started.elapsed().as_millis() as u64;

        let content_type = parts.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
        let data = parse_body(content_type, bytes)?;

        Ok(UpstreamResponse {
            status: parts.status.as_u16(),
            status_text: parts.status.canonical_reason().unwrap_or("").to_string(),
            headers: collect_headers(&parts.headers),
            data,
            timing_ms,
        })
    }
}

impl Default for HttpForwarder {
    fn default() -> Self {
        Self::new(DEFAULT_UPSTREAM_TIMEOUT)
    }
}

#[async_trait]
impl Upstream for HttpForwarder {
    async fn forward(&self, request: &ForwardRequest) -> Result<UpstreamResponse, UpstreamError> {
        match tokio::time::timeout(self.timeout, self.send(request)).await {
            Ok(Ok(response)) => {
                info!(
                    "Upstream answered {} in {} ms",
                    response.status, response.timing_ms
                );
                Ok(response)
            }
            Ok(Err(e)) => {
                warn!("Upstream call failed: {}", e);
                Err(e)
            }
            Err(_) => {
                warn!("Upstream call timed out after {:?}", self.timeout);
                Err(UpstreamError::Timeout(self.timeout))
            }
        }
    }
}

fn is_json(content_type: &str) -> bool {
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    media_type == "application/json" || media_type.ends_with("+json")
}

/// Decides the body representation once, from the content type alone.
fn parse_body(content_type: Option<&str>, bytes: Bytes) -> Result<ResponseData, UpstreamError> {
    if bytes.is_empty() {
        return Ok(ResponseData::Text(String::new()));
    }
    if content_type.map_or(false, is_json) {
        return serde_json::from_slice(&bytes)
            .map(ResponseData::Json)
            .map_err(|e| UpstreamError::InvalidResponse(format!("malformed JSON body: {}", e)));
    }
    Ok(ResponseData::Text(String::from_utf8_lossy(&bytes).into_owned()))
}

/// Repeated header names are joined with ", ".
fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut collected: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers.iter() {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        collected
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    collected
}
