use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::StoreError;
use crate::model::CacheEntry;
use crate::store::KvStore;

/// Response cache on top of the key/value store.
///
/// Entries are JSON blobs written with `set_ex`; expiry belongs to the store.
/// Two concurrent misses for one key both write and the later write wins.
/// A missing store, or any store failure or timeout, reads as a miss and
/// drops the write.
pub struct ResponseCache {
    default_ttl_secs: u64,
    max_ttl_secs: u64,
}

#[derive(Debug, Clone)]
pub struct CachedLookup {
    pub entry: CacheEntry,
    pub ttl_remaining: Option<i64>,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        info!(
            "Initializing response cache, default TTL {}s, max TTL {}s",
            config.default_ttl_secs, config.max_ttl_secs
        );
        Self {
            default_ttl_secs: config.default_ttl_secs,
            max_ttl_secs: config.max_ttl_secs,
        }
    }

    /// Requested TTL, or the default when absent or not positive, capped at the max.
    pub fn effective_ttl(&self, requested: Option<i64>) -> u64 {
        let ttl = match requested {
            Some(secs) if secs > 0 => secs as u64,
            _ => self.default_ttl_secs,
        };
        ttl.min(self.max_ttl_secs).max(1)
    }

    pub async fn get(&self, store: Option<&dyn KvStore>, key: &str) -> Option<CachedLookup> {
        let store = store?;
        match Self::read(store, key).await {
            Ok(Some(lookup)) => {
                debug!("Cache hit for key: {}", key);
                Some(lookup)
            }
            Ok(None) => {
                debug!("Cache miss for key: {}", key);
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed, treating as miss");
                None
            }
        }
    }

    async fn read(
        store: &dyn KvStore,
        key: &str,
    ) -> Result<Option<CachedLookup>, StoreError> {
        let raw = match store.get(key).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let entry: CacheEntry = serde_json::from_str(&raw)?;
        let ttl_remaining = store.ttl(key).await?;
        Ok(Some(CachedLookup { entry, ttl_remaining }))
    }

    /// Best effort; failures are logged and swallowed.
    pub async fn put(
        &self,
        store: Option<&dyn KvStore>,
        key: &str,
        entry: &CacheEntry,
        ttl_secs: u64,
    ) {
        let store = match store {
            Some(store) => store,
            None => {
                debug!("No store, dropping cache write for {}", key);
                return;
            }
        };
        let ttl = ttl_secs.min(self.max_ttl_secs).max(1);

        let payload = match serde_json::to_string(entry) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key = %key, error = %e, "Could not serialize cache entry");
                return;
            }
        };

        match store.set_ex(key, &payload, ttl).await {
            Ok(()) => info!("Cached {} bytes for key {} with TTL {}s", payload.len(), key, ttl),
            Err(e) => warn!(key = %key, error = %e, "Cache write failed"),
        }
    }
}
