use crate::registry::Credential;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Number of worker processes to supervise (0 = serve in this process)
    #[serde(default)]
    pub workers: usize,

    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Failover behaviour
    #[serde(flatten)]
    pub failover: FailoverConfig,

    /// Backend connection settings
    #[serde(flatten)]
    pub upstream: UpstreamConfig,

    /// Default log session for requests that never resolve a backend
    pub log_session: Option<String>,

    /// Default metric session for requests that never resolve a backend
    pub metric_session: Option<String>,

    /// Local cache in front of the registry
    #[serde(default)]
    pub cache: CacheConfig,

    /// Shared backend registry
    #[serde(default)]
    pub registry: RegistryConfig,

    /// statsd metrics sink
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 80, set to 0 to disable)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// HTTPS listener, enabled when present
    pub https: Option<HttpsConfig>,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.https.as_ref().map(|h| h.port > 0).unwrap_or(false)
    }

    /// Get HTTP port (0 means disabled)
    pub fn http_port(&self) -> u16 {
        self.port
    }

    /// Get HTTPS port (0 means disabled)
    pub fn https_port(&self) -> u16 {
        self.https.as_ref().map(|h| h.port).unwrap_or(0)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            https: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpsConfig {
    /// HTTPS port (default: 443)
    #[serde(default = "default_https_port")]
    pub port: u16,

    /// Default certificate (PEM), served when the client sends no server name.
    /// A self-signed certificate is generated when cert and key are omitted.
    pub cert: Option<String>,

    /// Private key for the default certificate (PEM)
    pub key: Option<String>,
}

impl HttpsConfig {
    pub fn has_tls_files(&self) -> bool {
        self.cert.is_some() && self.key.is_some()
    }
}

/// Retry and quarantine settings
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct FailoverConfig {
    /// Retries after a connection-class failure (0 disables retrying)
    #[serde(default = "default_retry_on_error")]
    pub retry_on_error: u32,

    /// How long a quarantined backend stays in its frontend's dead-set
    #[serde(default = "default_dead_backend_ttl")]
    pub dead_backend_ttl_secs: u64,

    /// Treat HTTP 500 as a dead backend (otherwise only 501-599)
    #[serde(default = "default_dead_backend_on_500")]
    pub dead_backend_on_500: bool,
}

impl FailoverConfig {
    pub fn dead_backend_ttl(&self) -> Duration {
        Duration::from_secs(self.dead_backend_ttl_secs)
    }

    /// First status code that marks a backend as dead
    pub fn dead_status_start(&self) -> u16 {
        if self.dead_backend_on_500 {
            500
        } else {
            501
        }
    }
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            retry_on_error: default_retry_on_error(),
            dead_backend_ttl_secs: default_dead_backend_ttl(),
            dead_backend_on_500: default_dead_backend_on_500(),
        }
    }
}

/// Settings for connections to backends
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct UpstreamConfig {
    /// Inactivity timeout while waiting on a backend, in seconds
    #[serde(default = "default_tcp_timeout")]
    pub tcp_timeout_secs: u64,

    /// Backend connect timeout, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Reuse backend connections between requests (default: false)
    #[serde(default)]
    pub http_keep_alive: bool,

    /// Maximum idle connections kept per backend when keep-alive is on
    #[serde(default = "default_max_sockets")]
    pub max_sockets: usize,

    /// Largest request body buffered for replay on retry
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl UpstreamConfig {
    pub fn tcp_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Idle connections kept per backend; zero closes each connection after use
    pub fn max_idle_per_host(&self) -> usize {
        if self.http_keep_alive {
            self.max_sockets
        } else {
            0
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            tcp_timeout_secs: default_tcp_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            http_keep_alive: false,
            max_sockets: default_max_sockets(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Enable the local cache (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum cached entries (default: 10000)
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: default_cache_capacity(),
        }
    }
}

/// Registry implementation
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    /// Shared Redis server (default)
    #[default]
    Redis,
    /// In-process registry seeded from this file
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    #[serde(default)]
    pub kind: RegistryKind,

    #[serde(default = "default_registry_host")]
    pub host: String,

    #[serde(default = "default_registry_port")]
    pub port: u16,

    #[serde(default)]
    pub db: i64,

    pub password: Option<String>,

    /// Prefix applied to every key
    #[serde(default)]
    pub prefix: String,

    /// Channel carrying dead backend notices
    #[serde(default = "default_registry_channel")]
    pub channel: String,

    /// Memory registry seed: lookup key -> raw JSON entries
    #[serde(default)]
    pub pools: HashMap<String, Vec<String>>,

    /// Memory registry seed: server name -> credential
    #[serde(default)]
    pub certificates: HashMap<String, Credential>,
}

impl RegistryConfig {
    /// Connection parameters for the redis client
    pub fn connection_info(&self) -> redis::ConnectionInfo {
        redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: redis::RedisConnectionInfo {
                db: self.db,
                password: self.password.clone(),
                ..Default::default()
            },
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            kind: RegistryKind::default(),
            host: default_registry_host(),
            port: default_registry_port(),
            db: 0,
            password: None,
            prefix: String::new(),
            channel: default_registry_channel(),
            pools: HashMap::new(),
            certificates: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    /// Send statsd datagrams (default: false)
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_host")]
    pub host: String,

    #[serde(default = "default_metrics_port")]
    pub port: u16,

    /// Maximum datagram payload in bytes
    #[serde(default = "default_packet_size")]
    pub packet_size: usize,

    /// Samples queued for the statsd writer before new ones are dropped
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// How often per-connection byte counters are reported, in milliseconds
    #[serde(default = "default_connection_interval")]
    pub connection_interval_ms: u64,
}

impl MetricsConfig {
    pub fn connection_interval(&self) -> Duration {
        Duration::from_millis(self.connection_interval_ms)
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_metrics_host(),
            port: default_metrics_port(),
            packet_size: default_packet_size(),
            queue_size: default_queue_size(),
            connection_interval_ms: default_connection_interval(),
        }
    }
}

/// Upper bound accepted for `retry_on_error`
pub const MAX_RETRY_ON_ERROR: u32 = 100;

fn default_listen_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_retry_on_error() -> u32 {
    3
}

fn default_dead_backend_ttl() -> u64 {
    30
}

fn default_dead_backend_on_500() -> bool {
    true
}

fn default_tcp_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_max_sockets() -> usize {
    100
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_cache_capacity() -> usize {
    crate::cache::DEFAULT_CAPACITY
}

fn default_registry_host() -> String {
    "127.0.0.1".to_string()
}

fn default_registry_port() -> u16 {
    6379
}

fn default_registry_channel() -> String {
    "dead".to_string()
}

fn default_metrics_host() -> String {
    "127.0.0.1".to_string()
}

fn default_metrics_port() -> u16 {
    8125
}

fn default_packet_size() -> usize {
    1432
}

fn default_queue_size() -> usize {
    4096
}

fn default_connection_interval() -> u64 {
    1000
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.failover.retry_on_error > MAX_RETRY_ON_ERROR {
            errors.push(format!(
                "retry_on_error must be at most {}",
                MAX_RETRY_ON_ERROR
            ));
        }

        if self.failover.dead_backend_ttl_secs == 0 {
            errors.push("dead_backend_ttl_secs must be greater than 0".to_string());
        }

        if self.cache.enabled && self.cache.capacity == 0 {
            errors.push("cache.capacity must be greater than 0".to_string());
        }

        if self.upstream.tcp_timeout_secs == 0 {
            errors.push("tcp_timeout_secs must be greater than 0".to_string());
        }

        if let Some(https) = &self.server.https {
            if https.port != 0 && https.port == self.server.port {
                errors.push("server.https.port must differ from server.port".to_string());
            }
            if https.cert.is_some() != https.key.is_some() {
                errors.push(
                    "server.https.cert and server.https.key must be set together".to_string(),
                );
            }
        }

        if self.server.http_port() == 0 && self.server.https_port() == 0 {
            errors.push(
                "at least one of server.port or server.https.port must be enabled".to_string(),
            );
        }

        if self.metrics.enabled && self.metrics.packet_size == 0 {
            errors.push("metrics.packet_size must be greater than 0".to_string());
        }
        if self.metrics.enabled && self.metrics.queue_size == 0 {
            errors.push("metrics.queue_size must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
