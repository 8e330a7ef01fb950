use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use super::KvStore;
use crate::error::StoreError;

/// In-process store with per-key expiry on the tokio clock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<HashMap<String, StoredValue>>,
}

#[derive(Debug)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment under the write lock; `window` starts an expiry on creation.
    async fn increment(&self, key: &str, window: Option<u64>) -> Result<i64, StoreError> {
        let mut state = self.state.write().await;
        let now = Instant::now();

        if state.get(key).map_or(false, |v| v.is_expired(now)) {
            state.remove(key);
        }

        let entry = state.entry(key.to_string()).or_insert_with(|| StoredValue {
            value: "0".to_string(),
            expires_at: None,
        });
        let count = entry
            .value
            .parse::<i64>()
            .map_err(|_| StoreError::NotAnInteger(key.to_string()))?
            + 1;
        entry.value = count.to_string();

        if count == 1 {
            if let Some(seconds) = window {
                entry.expires_at = Some(now + Duration::from_secs(seconds));
            }
        }
        Ok(count)
    }

    /// Drops expired keys, returning how many were removed.
    pub async fn cleanup(&self) -> usize {
        let mut state = self.state.write().await;
        let now = Instant::now();
        let before = state.len();
        state.retain(|_, value| !value.is_expired(now));
        let removed = before - state.len();
        debug!("Memory store cleanup removed {} expired keys", removed);
        removed
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.state.read().await.len()
    }

    pub fn start_cleanup_task(self: Arc<Self>, interval: Duration) {
        info!("Starting memory store cleanup task, interval {:?}", interval);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                self.cleanup().await;
            }
        });
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.increment(key, None).await
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let now = Instant::now();
        if !state.get(key).map_or(false, |value| !value.is_expired(now)) {
            return Ok(false);
        }
        if seconds == 0 {
            state.remove(key);
        } else if let Some(value) = state.get_mut(key) {
            value.expires_at = Some(now + Duration::from_secs(seconds));
        }
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let state = self.state.read().await;
        let now = Instant::now();
        Ok(state
            .get(key)
            .filter(|value| !value.is_expired(now))
            .map(|value| value.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, seconds: u64) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(seconds)),
            },
        );
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let state = self.state.read().await;
        let now = Instant::now();
        let remaining = state
            .get(key)
            .filter(|value| !value.is_expired(now))
            .and_then(|value| value.expires_at)
            .map(|at| {
                let left = at - now;
                // round up so a freshly written key reports its full TTL
                let secs = left.as_secs() + u64::from(left.subsec_nanos() > 0);
                secs as i64
            });
        Ok(remaining)
    }

    async fn incr_window(&self, key: &str, window_seconds: u64) -> Result<i64, StoreError> {
        self.increment(key, Some(window_seconds)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_set_ex_and_expiry() {
        let store = MemoryStore::new();
        store.set_ex("key", "value", 30).await.unwrap();

        assert_eq!(store.get("key").await.unwrap().as_deref(), Some("value"));
        assert_eq!(store.ttl("key").await.unwrap(), Some(30));

        tokio::time::advance(Duration::from_secs(12)).await;
        assert_eq!(store.ttl("key").await.unwrap(), Some(18));

        tokio::time::advance(Duration::from_secs(18)).await;
        assert_eq!(store.get("key").await.unwrap(), None);
        assert_eq!(store.ttl("key").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incr_window_resets_after_expiry() {
        let store = MemoryStore::new();
        assert_eq!(store.incr_window("rate", 60).await.unwrap(), 1);
        assert_eq!(store.incr_window("rate", 60).await.unwrap(), 2);

        // later increments must not push the window out
        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(store.incr_window("rate", 60).await.unwrap(), 3);
        assert_eq!(store.ttl("rate").await.unwrap(), Some(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(store.incr_window("rate", 60).await.unwrap(), 1);
        assert_eq!(store.ttl("rate").await.unwrap(), Some(60));
    }

    #[tokio::test]
    async fn test_incr_rejects_non_integer() {
        let store = MemoryStore::new();
        store.set_ex("text", "hello", 30).await.unwrap();
        assert!(matches!(store.incr("text").await, Err(StoreError::NotAnInteger(_))));
    }

    #[tokio::test]
    async fn test_plain_incr_has_no_expiry() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("counter").await.unwrap(), 1);
        assert_eq!(store.ttl("counter").await.unwrap(), None);
        assert!(store.expire("counter", 10).await.unwrap());
        assert!(!store.expire("missing", 10).await.unwrap());
        assert_eq!(store.ttl("counter").await.unwrap(), Some(10));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.incr_window("shared", 60).await.unwrap() }));
        }
        let mut seen = Vec::new();
        for handle in handles {
            seen.push(handle.await.unwrap());
        }
        seen.sort_unstable();

        assert_eq!(seen, (1..=50).collect::<Vec<i64>>());
        assert_eq!(store.get("shared").await.unwrap().as_deref(), Some("50"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_removes_expired() {
        let store = MemoryStore::new();
        store.set_ex("short", "1", 1).await.unwrap();
        store.set_ex("long", "2", 100).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.cleanup().await, 1);
        assert_eq!(store.len().await, 1);
    }
}
