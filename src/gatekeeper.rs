use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::cache::ResponseCache;
use crate::config::Config;
use crate::error::ProxyError;
use crate::keys::{build_cache_key, build_rate_key};
use crate::model::{CacheEntry, CacheStats, ForwardRequest, ResponseEnvelope};
use crate::rate_limit::RateLimiter;
use crate::store::StoreHandle;
use crate::upstream::{HttpForwarder, Upstream};
use crate::utils::validate_forward_url;

/// Runs one forward request through validate, rate check, cache lookup,
/// upstream call, cache store and assembly. Nothing is retried.
///
/// Rate limiting is gated by the same flag as caching: a request without
/// `cache.enabled` never touches the store. The store is resolved once per
/// request and shared by the rate check, the lookup and the write.
pub struct Gatekeeper {
    store: Arc<StoreHandle>,
    limiter: RateLimiter,
    cache: ResponseCache,
    upstream: Arc<dyn Upstream>,
}

struct CachePlan {
    key: String,
    ttl_secs: u64,
}

impl Gatekeeper {
    pub fn new(
        store: Arc<StoreHandle>,
        limiter: RateLimiter,
        cache: ResponseCache,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        Self {
            store,
            limiter,
            cache,
            upstream,
        }
    }

    pub fn from_config(config: &Config, store: Arc<StoreHandle>) -> Self {
        Self::new(
            store,
            RateLimiter::new(&config.rate_limit),
            ResponseCache::new(&config.cache),
            Arc::new(HttpForwarder::new(config.upstream_timeout())),
        )
    }

    pub async fn handle(
        &self,
        request: ForwardRequest,
        client_identity: &str,
    ) -> Result<ResponseEnvelope, ProxyError> {
        let started = Instant::now();
        validate_forward_url(&request.url)?;

        let plan = request.caching().map(|settings| CachePlan {
            key: build_cache_key(&request.method, &request.url, request.outbound_body()),
            ttl_secs: self.cache.effective_ttl(settings.ttl),
        });
        let store = plan.as_ref().and_then(|_| self.store.get());
        let store = store.as_deref();

        if let Some(plan) = &plan {
            let decision = self
                .limiter
                .check_and_increment(store, &build_rate_key(client_identity))
                .await;
            if !decision.allowed {
                return Err(ProxyError::RateLimited {
                    retry_after: decision.remaining_window_seconds,
                });
            }

            if let Some(hit) = self.cache.get(store, &plan.key).await {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                // may go negative when the cache path is slower than the original fetch
                let time_saved = hit.entry.original_timing as i64 - elapsed_ms as i64;
                info!(
                    "Served {} {} from cache in {} ms, saved {} ms",
                    request.method, request.url, elapsed_ms, time_saved
                );

                let mut response = hit.entry.response;
                response.timing_ms = elapsed_ms;
                return Ok(ResponseEnvelope {
                    response,
                    cache: CacheStats::hit(hit.ttl_remaining, time_saved),
                });
            }
        }

        debug!("Forwarding {} {}", request.method, request.url);
        let response = self.upstream.forward(&request).await?;

        let cache = match &plan {
            Some(plan) => {
                let entry = CacheEntry::new(response.clone());
                self.cache.put(store, &plan.key, &entry, plan.ttl_secs).await;
                CacheStats::miss(plan.ttl_secs)
            }
            None => CacheStats::disabled(),
        };

        Ok(ResponseEnvelope { response, cache })
    }
}
