//! Shared helpers for the proxy integration tests

#![allow(dead_code)]

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tenantgate::cache::BoundedCache;
use tenantgate::config::{FailoverConfig, UpstreamConfig};
use tenantgate::controller::{ProxyFailoverController, SessionDefaults};
use tenantgate::proxy::ProxyServer;
use tenantgate::registry::MemoryRegistry;
use tenantgate::resolver::ResolutionCache;
use tenantgate::telemetry::{ConnectionReport, RequestSummary, TelemetrySink};
use tenantgate::tls::TlsContext;
use tenantgate::transport::HyperTransport;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

pub const INFO: &str = r#"{"virtualHost":"shop","logSession":"log-1","metricSession":"metric-1"}"#;

/// Pool entry for a backend on localhost
pub fn entry(id: u32, port: u16) -> String {
    format!(r#"{{"id":{},"host":"127.0.0.1","port":{}}}"#, id, port)
}

/// A port nothing listens on
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

pub struct Origin {
    pub port: u16,
    pub hits: Arc<AtomicUsize>,
}

impl Origin {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// HTTP origin answering every request with `status`, `headers` and a body
/// of `name`. It echoes the forwarding headers it received.
pub async fn spawn_origin(
    name: &'static str,
    status: u16,
    headers: Vec<(&'static str, &'static str)>,
) -> Origin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let counter = Arc::clone(&counter);
            let headers = headers.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let mut builder = Response::builder().status(status);
                    for (key, value) in &headers {
                        builder = builder.header(*key, *value);
                    }
                    for (seen, header) in [
                        ("x-seen-forwarded-for", "x-forwarded-for"),
                        ("x-seen-forwarded-port", "x-forwarded-port"),
                        ("x-seen-request-id", "x-request-id"),
                        ("x-seen-host", "host"),
                    ] {
                        if let Some(value) = req.headers().get(header) {
                            builder = builder.header(seen, value.clone());
                        }
                    }
                    let response = builder.body(Full::new(Bytes::from(name))).unwrap();
                    async move { Ok::<_, Infallible>(response) }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    Origin { port, hits }
}

/// Origin that accepts an upgrade and then echoes bytes back
const SWITCHING_PROTOCOLS: &[u8] =
    b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";

pub async fn spawn_echo_upgrade_origin() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut byte = [0u8; 1];
                while !head.ends_with(b"\r\n\r\n") {
                    if stream.read_exact(&mut byte).await.is_err() {
                        return;
                    }
                    head.push(byte[0]);
                }
                let _ = stream.write_all(SWITCHING_PROTOCOLS).await;

                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    port
}

/// Origin that reads a request head and hangs up without answering
pub async fn spawn_hangup_origin() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut byte = [0u8; 1];
                while !head.ends_with(b"\r\n\r\n") {
                    if stream.read_exact(&mut byte).await.is_err() {
                        return;
                    }
                    head.push(byte[0]);
                }
            });
        }
    });

    port
}

/// Telemetry sink keeping every summary
#[derive(Default)]
pub struct RecordingSink {
    pub summaries: Mutex<Vec<RequestSummary>>,
}

impl TelemetrySink for RecordingSink {
    fn record_request(&self, summary: &RequestSummary) {
        self.summaries.lock().push(summary.clone());
    }

    fn record_connection(&self, _report: &ConnectionReport) {}
}

pub struct TestProxy {
    pub port: u16,
    pub registry: Arc<MemoryRegistry>,
    pub resolver: Arc<ResolutionCache<MemoryRegistry>>,
    pub sink: Arc<RecordingSink>,
    shutdown_tx: watch::Sender<bool>,
}

impl TestProxy {
    /// Wait until `count` request summaries were recorded
    pub async fn wait_for_summaries(&self, count: usize) -> Vec<RequestSummary> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let summaries = self.sink.summaries.lock().clone();
            if summaries.len() >= count || tokio::time::Instant::now() > deadline {
                return summaries;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

pub async fn start_proxy(registry: Arc<MemoryRegistry>, failover: FailoverConfig) -> TestProxy {
    start_proxy_with(registry, failover, None).await
}

pub async fn start_proxy_with(
    registry: Arc<MemoryRegistry>,
    failover: FailoverConfig,
    tls: Option<TlsContext>,
) -> TestProxy {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let resolver = ResolutionCache::new(
        Arc::clone(&registry),
        BoundedCache::new(100, true),
        failover.dead_backend_ttl(),
    );
    let _listener = resolver.spawn_reload_listener(shutdown_rx.clone());

    let upstream = UpstreamConfig {
        tcp_timeout_secs: 5,
        connect_timeout_secs: 1,
        ..UpstreamConfig::default()
    };
    let sink = Arc::new(RecordingSink::default());
    let controller = Arc::new(ProxyFailoverController::new(
        Arc::clone(&resolver),
        Arc::new(HyperTransport::new(&upstream)),
        sink.clone() as Arc<dyn TelemetrySink>,
        failover,
        SessionDefaults::default(),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut server = ProxyServer::new(
        listener.local_addr().unwrap(),
        controller,
        shutdown_rx,
        upstream.max_body_bytes,
    );
    if let Some(context) = tls {
        server = server.with_tls(context);
    }
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    TestProxy {
        port,
        registry,
        resolver,
        sink,
        shutdown_tx,
    }
}

/// Send a raw request and read the whole response
pub async fn send_raw(port: u16, request: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

/// GET with a custom Host header and extra header lines
pub async fn http_get_with_host(
    port: u16,
    path: &str,
    host: &str,
    extra: &[(&str, &str)],
) -> String {
    let mut request = format!("GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n", path, host);
    for (name, value) in extra {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");
    send_raw(port, &request).await
}

pub fn status_of(response: &str) -> u16 {
    response
        .lines()
        .next()
        .and_then(|line| line.split(' ').nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap_or(0)
}

pub fn header_of<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    response
        .split("\r\n\r\n")
        .next()?
        .lines()
        .skip(1)
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
        })
}

pub fn body_of(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or("")
}
