use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use hyper::Method;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

/// The caller's description of the HTTP call to relay.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_method", deserialize_with = "deserialize_method")]
    pub method: Method,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub cache: Option<CacheRequestConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheRequestConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Whole seconds; fractional values are truncated.
    #[serde(default, deserialize_with = "deserialize_ttl")]
    pub ttl: Option<i64>,
}

fn deserialize_ttl<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<f64>::deserialize(deserializer)?;
    Ok(raw.filter(|secs| secs.is_finite()).map(|secs| secs.trunc() as i64))
}

fn default_method() -> Method {
    Method::GET
}

fn deserialize_method<'de, D>(deserializer: D) -> Result<Method, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    let normalized = raw.trim().to_ascii_uppercase();
    Method::from_bytes(normalized.as_bytes())
        .map_err(|_| D::Error::custom(format!("unsupported method: {:?}", raw)))
}

impl ForwardRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            headers: BTreeMap::new(),
            body: None,
            cache: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_cache(mut self, enabled: bool, ttl: Option<i64>) -> Self {
        self.cache = Some(CacheRequestConfig { enabled, ttl });
        self
    }

    /// The body that is actually sent upstream. GET and HEAD never carry one.
    pub fn outbound_body(&self) -> Option<&str> {
        if self.method == Method::GET || self.method == Method::HEAD {
            return None;
        }
        self.body.as_deref()
    }

    /// Cache settings, only when caching was explicitly enabled.
    pub fn caching(&self) -> Option<&CacheRequestConfig> {
        self.cache.as_ref().filter(|cache| cache.enabled)
    }
}

/// Upstream body, parsed when the content type declared JSON.
///
/// `Text` is listed first so a cached string round-trips as text; both
/// variants serialize identically for a string payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseData {
    Text(String),
    Json(serde_json::Value),
}

/// What the forwarder produced: the response envelope without cache stats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: BTreeMap<String, String>,
    pub data: ResponseData,
    #[serde(rename = "timing")]
    pub timing_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_saved: Option<i64>,
}

impl CacheStats {
    pub fn disabled() -> Self {
        Self { hit: false, ttl: None, time_saved: None }
    }

    pub fn miss(ttl_seconds: u64) -> Self {
        Self {
            hit: false,
            ttl: Some(ttl_seconds as i64),
            time_saved: None,
        }
    }

    pub fn hit(ttl_remaining: Option<i64>, time_saved_ms: i64) -> Self {
        Self {
            hit: true,
            ttl: ttl_remaining,
            time_saved: Some(time_saved_ms),
        }
    }
}

/// The unit returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseEnvelope {
    #[serde(flatten)]
    pub response: UpstreamResponse,
    pub cache: CacheStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub response: UpstreamResponse,
    pub original_timing: u64,
    pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(response: UpstreamResponse) -> Self {
        let original_timing = response.timing_ms;
        Self {
            response,
            original_timing,
            cached_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>, details: Option<String>) -> Self {
        Self { error: error.into(), details }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStatus {
    pub available: bool,
}
