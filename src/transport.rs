//! Forwarding requests to backends
//!
//! The failover controller only sees the [`Transport`] trait: it hands over
//! a fully buffered request and gets back either a response or a classified
//! [`TransportError`]. [`HyperTransport`] is the production implementation,
//! a pooled hyper client.

use crate::backend::Backend;
use crate::config::UpstreamConfig;
use crate::error::ProxyBody;
use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response, Uri, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Classified forwarding failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection refused")]
    ConnectionRefused,

    #[error("connection timed out")]
    Timeout,

    /// The backend went quiet for longer than the inactivity timeout
    #[error("backend inactive for {}s", .0.as_secs())]
    Inactivity(Duration),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Connection-class failures mark the backend dead and may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionRefused
                | TransportError::Timeout
                | TransportError::Inactivity(_)
        )
    }
}

/// Sends one request to one backend
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn forward(
        &self,
        req: Request<Full<Bytes>>,
        backend: &Backend,
    ) -> Result<Response<ProxyBody>, TransportError>;
}

/// Statistics for the transport
#[derive(Debug, Default)]
pub struct TransportStats {
    /// Total number of requests sent to backends
    pub total_requests: AtomicU64,
    /// Requests that ended in a transport error
    pub failures: AtomicU64,
}

impl TransportStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Pooled hyper client used to reach backends
pub struct HyperTransport {
    client: Client<HttpConnector, Full<Bytes>>,
    inactivity_timeout: Duration,
    stats: Arc<TransportStats>,
}

impl HyperTransport {
    pub fn new(config: &UpstreamConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(config.connect_timeout()));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host())
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        debug!(
            keep_alive = config.http_keep_alive,
            max_idle = config.max_idle_per_host(),
            connect_timeout_secs = config.connect_timeout_secs,
            tcp_timeout_secs = config.tcp_timeout_secs,
            "Backend transport initialized"
        );

        Self {
            client,
            inactivity_timeout: config.tcp_timeout(),
            stats: Arc::new(TransportStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<TransportStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn forward(
        &self,
        req: Request<Full<Bytes>>,
        backend: &Backend,
    ) -> Result<Response<ProxyBody>, TransportError> {
        let backend_req = rewrite_for_backend(req, backend)?;
        self.stats.record_request();

        let result =
            tokio::time::timeout(self.inactivity_timeout, self.client.request(backend_req)).await;

        match result {
            Ok(Ok(response)) => {
                let (parts, body) = response.into_parts();
                Ok(Response::from_parts(parts, body.boxed()))
            }
            Ok(Err(e)) => {
                self.stats.record_failure();
                Err(classify_client_error(&e))
            }
            Err(_) => {
                self.stats.record_failure();
                Err(TransportError::Inactivity(self.inactivity_timeout))
            }
        }
    }
}

/// Point a client request at a backend, keeping the original Host header
fn rewrite_for_backend(
    req: Request<Full<Bytes>>,
    backend: &Backend,
) -> Result<Request<Full<Bytes>>, TransportError> {
    let (mut parts, body) = req.into_parts();

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri: Uri = format!("{}{}", backend.url(), path)
        .parse()
        .map_err(|e| TransportError::Other(format!("invalid backend uri: {}", e)))?;

    // HTTP/2 clients send :authority instead of Host
    if !parts.headers.contains_key(HOST) {
        if let Some(authority) = parts.uri.authority() {
            if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                parts.headers.insert(HOST, value);
            }
        }
    }

    parts.uri = uri;
    parts.version = Version::HTTP_11;
    Ok(Request::from_parts(parts, body))
}

/// Map a hyper client error onto the failure classes the controller acts on
fn classify_client_error(err: &hyper_util::client::legacy::Error) -> TransportError {
    if err.is_connect() {
        if let Some(io) = find_io_error(err) {
            match io.kind() {
                std::io::ErrorKind::ConnectionRefused => return TransportError::ConnectionRefused,
                std::io::ErrorKind::TimedOut => return TransportError::Timeout,
                _ => {}
            }
        }
    }
    TransportError::Other(err.to_string())
}

fn find_io_error<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a std::io::Error> {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return Some(io);
        }
        current = e.source();
    }
    None
}
