use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use tracing::info;

use super::KvStore;
use crate::error::StoreError;

/// INCR and start the window expiry in one step.
const WINDOW_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return count
";

/// Redis-backed store. The connection manager reconnects on its own and is
/// cloned per call. Every command is bounded by `command_timeout`, so a
/// server that stops answering surfaces as [`StoreError::Timeout`].
pub struct RedisStore {
    conn: ConnectionManager,
    window_script: redis::Script,
    command_timeout: Duration,
}

impl RedisStore {
    pub async fn connect(url: &str, command_timeout: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to redis, command timeout {:?}", command_timeout);
        Ok(Self {
            conn,
            window_script: redis::Script::new(WINDOW_SCRIPT),
            command_timeout,
        })
    }

    async fn bounded<T, F>(&self, command: F) -> Result<T, StoreError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        tokio::time::timeout(self.command_timeout, command)
            .await
            .map_err(|_| StoreError::Timeout(self.command_timeout))?
            .map_err(StoreError::from)
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let count: i64 = self.bounded(conn.incr(key, 1)).await?;
        Ok(count)
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let applied: bool = self.bounded(conn.expire(key, seconds as i64)).await?;
        Ok(applied)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = self.bounded(conn.get(key)).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, seconds: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = self.bounded(conn.set_ex(key, value, seconds)).await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let mut conn = self.conn.clone();
        // -2: missing, -1: no expiry
        let ttl: i64 = self.bounded(conn.ttl(key)).await?;
        Ok((ttl >= 0).then_some(ttl))
    }

    async fn incr_window(&self, key: &str, window_seconds: u64) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.window_script.key(key);
        invocation.arg(window_seconds);
        let count: i64 = self.bounded(invocation.invoke_async(&mut conn)).await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::spawn_stalled_redis;
    use std::time::Instant;

    #[tokio::test]
    async fn test_stalled_server_times_out() {
        let addr = spawn_stalled_redis().await;
        let store = tokio::time::timeout(
            Duration::from_secs(5),
            RedisStore::connect(&format!("redis://{}", addr), Duration::from_millis(200)),
        )
        .await
        .expect("connection setup should complete")
        .unwrap();

        let started = Instant::now();
        assert!(matches!(store.get("proxy:cache:k").await, Err(StoreError::Timeout(_))));
        assert!(matches!(
            store.incr_window("proxy:rate:k", 60).await,
            Err(StoreError::Timeout(_))
        ));
        assert!(matches!(store.set_ex("proxy:cache:k", "v", 10).await, Err(StoreError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    // Run with: docker run -d -p 6379:6379 redis:7

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_window_counter() -> Result<(), StoreError> {
        let store = RedisStore::connect("redis://localhost:6379", Duration::from_secs(1)).await?;
        let key = format!("test:window:{}", uuid::Uuid::new_v4());

        assert_eq!(store.incr_window(&key, 60).await?, 1);
        assert_eq!(store.incr_window(&key, 60).await?, 2);
        let ttl = store.ttl(&key).await?.unwrap();
        assert!(ttl > 0 && ttl <= 60);

        store.expire(&key, 0).await?;
        Ok(())
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_set_ex_and_ttl() -> Result<(), StoreError> {
        let store = RedisStore::connect("redis://localhost:6379", Duration::from_secs(1)).await?;
        let key = format!("test:value:{}", uuid::Uuid::new_v4());

        store.set_ex(&key, "value", 10).await?;
        assert_eq!(store.get(&key).await?.as_deref(), Some("value"));
        let ttl = store.ttl(&key).await?.unwrap();
        assert!(ttl > 0 && ttl <= 10);

        assert_eq!(store.ttl("test:missing-key").await?, None);
        Ok(())
    }
}
