use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::store::KvStore;

/// Fixed-window counter per client key.
///
/// The window is owned by the store's key expiry: the first request creates
/// the counter with a TTL of one window and the counter disappears with it.
/// Rejected requests still count. When there is no store, or it errors or
/// times out, the limiter fails open.
pub struct RateLimiter {
    max_requests: i64,
    window_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Count after this request, when the store answered.
    pub count: Option<i64>,
    /// Seconds until the window resets, reported on rejection.
    pub remaining_window_seconds: Option<i64>,
}

impl RateDecision {
    fn fail_open() -> Self {
        Self {
            allowed: true,
            count: None,
            remaining_window_seconds: None,
        }
    }
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            max_requests: config.max_requests,
            window_secs: config.window_secs,
        }
    }

    pub async fn check_and_increment(
        &self,
        store: Option<&dyn KvStore>,
        client_key: &str,
    ) -> RateDecision {
        let store = match store {
            Some(store) => store,
            None => {
                debug!("No store for rate limiting, allowing {}", client_key);
                return RateDecision::fail_open();
            }
        };

        let count = match store.incr_window(client_key, self.window_secs).await {
            Ok(count) => count,
            Err(e) => {
                warn!(key = %client_key, error = %e, "Rate limit store failed, allowing request");
                return RateDecision::fail_open();
            }
        };

        if count <= self.max_requests {
            debug!("Rate limit {}: {}/{}", client_key, count, self.max_requests);
            return RateDecision {
                allowed: true,
                count: Some(count),
                remaining_window_seconds: None,
            };
        }

        let remaining = match store.ttl(client_key).await {
            Ok(ttl) => ttl,
            Err(e) => {
                warn!(key = %client_key, error = %e, "Could not read rate window TTL");
                None
            }
        };
        warn!(
            key = %client_key,
            count = count,
            limit = self.max_requests,
            "Rate limit exceeded"
        );
        RateDecision {
            allowed: false,
            count: Some(count),
            remaining_window_seconds: remaining,
        }
    }
}
