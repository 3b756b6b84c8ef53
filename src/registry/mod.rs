//! Shared backend registry
//!
//! The registry is the source of truth for every worker: backend pools,
//! per-frontend dead-sets and TLS credentials. Quarantine decisions are
//! announced on a notification channel so that every worker can drop its
//! cached copy of the affected pool.

mod memory;
mod redis_store;

pub use memory::MemoryRegistry;
pub use redis_store::RedisRegistry;

use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::broadcast;

/// Registry kind used for backend pools
pub const BACKEND_KIND: &str = "backend";

/// Capacity of the local reload broadcast channel
pub const RELOAD_CHANNEL_CAPACITY: usize = 1024;

/// Errors raised by registry operations. None of them are retried by the
/// registry itself.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("malformed dead notice: {0}")]
    MalformedNotice(String),

    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Result of one atomic pool read
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolRead {
    /// Raw list entries, one list per requested key, in request order
    pub pools: Vec<Vec<String>>,
    /// Dead-set of the first requested key
    pub dead: HashSet<String>,
}

/// TLS material stored for a server name
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct Credential {
    pub certificate: String,
    pub key: String,
}

/// Quarantine announcement, encoded as `frontend;url;id;index`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadNotice {
    pub frontend: String,
    pub url: String,
    pub id: String,
    pub index: usize,
}

impl fmt::Display for DeadNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{};{};{}", self.frontend, self.url, self.id, self.index)
    }
}

impl FromStr for DeadNotice {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(4, ';');
        let (Some(frontend), Some(url), Some(id), Some(index)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(RegistryError::MalformedNotice(s.to_string()));
        };

        let index = index
            .trim()
            .parse()
            .map_err(|_| RegistryError::MalformedNotice(s.to_string()))?;

        Ok(Self {
            frontend: frontend.to_string(),
            url: url.to_string(),
            id: id.to_string(),
            index,
        })
    }
}

/// Invalidation event delivered to local subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadEvent {
    /// The cache key to drop (the quarantined backend's frontend)
    pub key: String,
}

/// Operations the resolution layer needs from the shared store
#[async_trait]
pub trait BackendRegistry: Send + Sync + 'static {
    /// Read the pool list for every key plus the dead-set of the first key,
    /// as one atomic snapshot
    async fn read_pool(&self, keys: &[String], kind: &str) -> RegistryResult<PoolRead>;

    /// Add a backend to its frontend's dead-set, refresh the set's TTL and
    /// publish the notice
    async fn mark_dead(&self, notice: &DeadNotice, ttl: Duration) -> RegistryResult<()>;

    /// Fetch the TLS credential stored under `key`
    async fn fetch_credential(&self, key: &str) -> RegistryResult<Option<Credential>>;

    /// Subscribe to reload events, emitted for every notice seen on the
    /// channel, whichever process published it
    fn subscribe(&self) -> broadcast::Receiver<ReloadEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_notice_format() {
        let notice = DeadNotice {
            frontend: "shop.example.com".to_string(),
            url: "http://10.0.0.2:80".to_string(),
            id: "2".to_string(),
            index: 2,
        };
        assert_eq!(notice.to_string(), "shop.example.com;http://10.0.0.2:80;2;2");
    }

    #[test]
    fn test_dead_notice_parse() {
        let notice: DeadNotice = "shop.example.com;http://10.0.0.2:80;2;2".parse().unwrap();
        assert_eq!(notice.frontend, "shop.example.com");
        assert_eq!(notice.url, "http://10.0.0.2:80");
        assert_eq!(notice.id, "2");
        assert_eq!(notice.index, 2);
    }

    #[test]
    fn test_dead_notice_parse_rejects_garbage() {
        assert!("shop.example.com;http://x".parse::<DeadNotice>().is_err());
        assert!("a;b;c;not-a-number".parse::<DeadNotice>().is_err());
    }
}
