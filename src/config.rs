use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ProxyError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub upstream: UpstreamConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    None,
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: Option<String>,
    pub connect_timeout_secs: u64,
    /// Upper bound for a single store command.
    pub command_timeout_ms: u64,
    /// Pause after a failed connection attempt before the next one.
    pub reconnect_backoff_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub default_ttl_secs: u64,
    pub max_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: i64,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::None,
            redis_url: None,
            connect_timeout_secs: 5,
            command_timeout_ms: 1000,
            reconnect_backoff_secs: 10,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 30,
            max_ttl_secs: 30,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 20,
            window_secs: 60,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ProxyError> {
        let mut config = match std::env::var("CONFIG_PATH") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self, ProxyError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ProxyError> {
        toml::from_str(content).map_err(|e| ProxyError::Config(e.to_string()))
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("PROXY_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("PROXY_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(url) = lookup("REDIS_URL").filter(|u| !u.is_empty()) {
            self.store.backend = StoreBackend::Redis;
            self.store.redis_url = Some(url);
        }
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.cache.max_ttl_secs == 0 || self.cache.default_ttl_secs == 0 {
            return Err(ProxyError::Config("cache TTLs must be positive".into()));
        }
        if self.cache.default_ttl_secs > self.cache.max_ttl_secs {
            return Err(ProxyError::Config(format!(
                "default TTL {}s exceeds max TTL {}s",
                self.cache.default_ttl_secs, self.cache.max_ttl_secs
            )));
        }
        if self.rate_limit.max_requests <= 0 || self.rate_limit.window_secs == 0 {
            return Err(ProxyError::Config("rate limit and window must be positive".into()));
        }
        if self.upstream.timeout_secs == 0 {
            return Err(ProxyError::Config("upstream timeout must be positive".into()));
        }
        if self.store.connect_timeout_secs == 0 || self.store.command_timeout_ms == 0 {
            return Err(ProxyError::Config("store timeouts must be positive".into()));
        }
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            return Err(ProxyError::Config("redis backend needs redis_url".into()));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ProxyError> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|e| ProxyError::Config(format!("invalid listen address: {}", e)))
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.timeout_secs)
    }
}
