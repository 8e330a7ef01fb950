use std::net::IpAddr;

use hyper::HeaderMap;
use url::Url;

use crate::error::ProxyError;

/// Returns true when the URL uses one of the schemes the proxy will relay.
///
/// # Examples
/// ```
/// use http_proxy_cache::utils::is_absolute_url;
///
/// assert!(is_absolute_url("https://example.com/api"));
/// assert!(!is_absolute_url("ftp://example.com"));
/// ```
pub fn is_absolute_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Checks the scheme prefix and that the rest parses as a URL with a host.
pub fn validate_forward_url(raw: &str) -> Result<Url, ProxyError> {
    if raw.is_empty() {
        return Err(ProxyError::InvalidUrl("URL is required".to_string()));
    }
    if !is_absolute_url(raw) {
        return Err(ProxyError::InvalidUrl(format!(
            "URL must start with http:// or https://: {}",
            raw
        )));
    }
    let parsed = Url::parse(raw).map_err(|e| ProxyError::InvalidUrl(format!("{}: {}", raw, e)))?;
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(ProxyError::InvalidUrl(format!("URL has no host: {}", raw)));
    }
    Ok(parsed)
}

/// Best-effort caller address: first `X-Forwarded-For` hop, then `X-Real-IP`,
/// then the peer address, then `"unknown"`.
pub fn client_identity(headers: &HeaderMap, peer: Option<IpAddr>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        let first = forwarded.split(',').next().unwrap_or("").trim();
        if let Ok(ip) = first.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            return normalize_ip(ip);
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if let Ok(ip) = real_ip.trim().parse::<IpAddr>() {
            return normalize_ip(ip);
        }
    }

    match peer {
        Some(ip) => normalize_ip(ip),
        None => "unknown".to_string(),
    }
}

/// IPv4-mapped IPv6 addresses collapse to their IPv4 form.
fn normalize_ip(ip: IpAddr) -> String {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        IpAddr::V4(v4) => v4.to_string(),
    }
}
