//! Key/value backend shared by the rate limiter and the response cache.
//!
//! All shared mutable state of the pipeline lives behind [`KvStore`]; its
//! atomicity comes from the backend's own primitives, never from locks held
//! in the request path.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::{StoreBackend, StoreConfig};
use crate::error::StoreError;

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

const MEMORY_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_ex(&self, key: &str, value: &str, seconds: u64) -> Result<(), StoreError>;

    /// Remaining lifetime in seconds; `None` when the key is missing or has no expiry.
    async fn ttl(&self, key: &str) -> Result<Option<i64>, StoreError>;

    /// Increments a window counter, starting the window's expiry when the
    /// counter is created. Backends should override this with a single
    /// atomic operation.
    async fn incr_window(&self, key: &str, window_seconds: u64) -> Result<i64, StoreError> {
        let count = self.incr(key).await?;
        if count == 1 {
            self.expire(key, window_seconds).await?;
        }
        Ok(count)
    }
}

struct RedisSettings {
    url: String,
    connect_timeout: Duration,
    command_timeout: Duration,
    reconnect_backoff: Duration,
}

enum Source {
    Disabled,
    Memory,
    Redis(RedisSettings),
    Provided,
}

#[derive(Default)]
struct ConnectAttempt {
    in_flight: bool,
    failed_at: Option<Instant>,
}

/// Owns the one backend connection of the process.
///
/// Requests never wait for a connection. A redis connection is opened by a
/// background task; until it is up, [`StoreHandle::get`] answers `None` and
/// callers fail open. After a failed attempt no new one starts before the
/// reconnect backoff has passed. An established store is never replaced.
pub struct StoreHandle {
    source: Source,
    store: OnceLock<Arc<dyn KvStore>>,
    attempt: Mutex<ConnectAttempt>,
}

impl StoreHandle {
    fn with_source(source: Source) -> Self {
        Self {
            source,
            store: OnceLock::new(),
            attempt: Mutex::new(ConnectAttempt::default()),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        let source = match (&config.backend, &config.redis_url) {
            (StoreBackend::None, _) => Source::Disabled,
            (StoreBackend::Memory, _) => Source::Memory,
            (StoreBackend::Redis, Some(url)) => Source::Redis(RedisSettings {
                url: url.clone(),
                connect_timeout: Duration::from_secs(config.connect_timeout_secs),
                command_timeout: Duration::from_millis(config.command_timeout_ms),
                reconnect_backoff: Duration::from_secs(config.reconnect_backoff_secs),
            }),
            (StoreBackend::Redis, None) => {
                warn!("Redis backend selected without redis_url, cache backend disabled");
                Source::Disabled
            }
        };
        Self::with_source(source)
    }

    /// Wraps an already constructed store.
    pub fn with_store(store: Arc<dyn KvStore>) -> Self {
        let handle = Self::with_source(Source::Provided);
        let _ = handle.store.set(store);
        handle
    }

    pub fn disabled() -> Self {
        Self::with_source(Source::Disabled)
    }

    /// Whether a cache backend is configured at all. Does not connect.
    pub fn is_configured(&self) -> bool {
        !matches!(self.source, Source::Disabled)
    }

    /// The live store, or `None` when none is configured or it is not
    /// connected yet. Never waits on the network.
    pub fn get(self: &Arc<Self>) -> Option<Arc<dyn KvStore>> {
        if let Some(store) = self.store.get() {
            return Some(store.clone());
        }
        match &self.source {
            Source::Memory => Some(self.store.get_or_init(Self::memory_store).clone()),
            Source::Redis(settings) => {
                self.start_connect(settings.reconnect_backoff);
                None
            }
            Source::Disabled | Source::Provided => None,
        }
    }

    /// Opens the backend ahead of the first request.
    pub fn connect_in_background(self: &Arc<Self>) {
        if self.is_configured() && self.get().is_none() {
            info!("Connecting to cache backend in the background");
        }
    }

    fn memory_store() -> Arc<dyn KvStore> {
        info!("Using in-memory store");
        let store = Arc::new(MemoryStore::new());
        store.clone().start_cleanup_task(MEMORY_CLEANUP_INTERVAL);
        store
    }

    fn lock_attempt(&self) -> MutexGuard<'_, ConnectAttempt> {
        self.attempt.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_connect(self: &Arc<Self>, backoff: Duration) {
        {
            let mut attempt = self.lock_attempt();
            if attempt.in_flight {
                return;
            }
            if attempt.failed_at.map_or(false, |at| at.elapsed() < backoff) {
                return;
            }
            attempt.in_flight = true;
        }

        let handle = Arc::clone(self);
        tokio::spawn(async move {
            let result = handle.connect_redis().await;

            let mut attempt = handle.lock_attempt();
            attempt.in_flight = false;
            match result {
                Ok(store) => {
                    attempt.failed_at = None;
                    if handle.store.set(store).is_err() {
                        debug!("Store already connected, dropping the new connection");
                    }
                }
                Err(e) => {
                    warn!("Cache backend unavailable, retrying in {:?}: {}", backoff, e);
                    attempt.failed_at = Some(Instant::now());
                }
            }
        });
    }

    async fn connect_redis(&self) -> Result<Arc<dyn KvStore>, StoreError> {
        let settings = match &self.source {
            Source::Redis(settings) => settings,
            _ => return Err(StoreError::Connect("no redis backend configured".to_string())),
        };
        debug!("Connecting to redis, timeout {:?}", settings.connect_timeout);
        let store = tokio::time::timeout(
            settings.connect_timeout,
            RedisStore::connect(&settings.url, settings.command_timeout),
        )
        .await
        .map_err(|_| StoreError::Connect(format!("timed out after {:?}", settings.connect_timeout)))??;
        Ok(Arc::new(store))
    }
}
