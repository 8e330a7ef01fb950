//! Cache and rate-limit key derivation.
//!
//! Cache keys are a JSON array of `[method, url, body]`, which is injective
//! over the triple and stable across restarts. Headers never take part, so
//! cached responses are shared between callers sending different headers.

use hyper::Method;
use serde_json::Value;

pub const CACHE_KEY_PREFIX: &str = "proxy:cache:";
pub const RATE_KEY_PREFIX: &str = "proxy:rate:";

pub fn build_cache_key(method: &Method, url: &str, body: Option<&str>) -> String {
    let triple = Value::Array(vec![
        Value::String(method.as_str().to_string()),
        Value::String(url.to_string()),
        body.map_or(Value::Null, |b| Value::String(b.to_string())),
    ]);
    format!("{}{}", CACHE_KEY_PREFIX, triple)
}

pub fn build_rate_key(client_identity: &str) -> String {
    let identity = if client_identity.is_empty() { "unknown" } else { client_identity };
    format!("{}{}", RATE_KEY_PREFIX, identity)
}
