pub mod cache;
pub mod config;
pub mod error;
pub mod gatekeeper;
pub mod keys;
pub mod logger;
pub mod model;
pub mod proxy;
pub mod rate_limit;
pub mod store;
pub mod upstream;
pub mod utils;

pub use config::Config;
pub use error::{ProxyError, Result};

pub mod prelude {
    pub use crate::cache::ResponseCache;
    pub use crate::config::Config;
    pub use crate::gatekeeper::Gatekeeper;
    pub use crate::model::{ForwardRequest, ResponseEnvelope};
    pub use crate::proxy::ProxyServer;
    pub use crate::rate_limit::RateLimiter;
    pub use crate::store::{KvStore, MemoryStore, RedisStore, StoreHandle};
    pub use crate::upstream::{HttpForwarder, Upstream};
}
