use crate::connection::{spawn_stats_reporter, ConnectionLabels, ConnectionStats, CountingStream};
use crate::controller::{
    inject_forwarding_headers, BufferedRequest, ClientConnection, ProxyFailoverController,
};
use crate::error::{error_response, ProxyBody, ProxyErrorCode};
use crate::registry::BackendRegistry;
use crate::resolver::ResolutionCache;
use crate::tls::TlsContext;
use crate::transport::Transport;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONNECTION, HOST, UPGRADE};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, error, info, warn};

/// Largest backend response head accepted for an upgrade
const MAX_UPGRADE_HEAD: usize = 16 * 1024;

/// How often per-connection byte counters are reported by default
const DEFAULT_CONNECTION_INTERVAL: Duration = Duration::from_secs(1);

/// A listener feeding requests into the failover controller
pub struct ProxyServer<R, T> {
    bind_addr: SocketAddr,
    controller: Arc<ProxyFailoverController<R, T>>,
    shutdown_rx: watch::Receiver<bool>,
    /// Context for handshakes without a server name; enables TLS when set
    default_tls: Option<TlsContext>,
    max_body_bytes: usize,
    connection_interval: Duration,
}

impl<R: BackendRegistry, T: Transport> ProxyServer<R, T> {
    pub fn new(
        bind_addr: SocketAddr,
        controller: Arc<ProxyFailoverController<R, T>>,
        shutdown_rx: watch::Receiver<bool>,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            bind_addr,
            controller,
            shutdown_rx,
            default_tls: None,
            max_body_bytes,
            connection_interval: DEFAULT_CONNECTION_INTERVAL,
        }
    }

    /// Terminate TLS, picking certificates by SNI
    pub fn with_tls(mut self, default_context: TlsContext) -> Self {
        self.default_tls = Some(default_context);
        self
    }

    pub fn with_connection_interval(mut self, interval: Duration) -> Self {
        self.connection_interval = interval;
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.default_tls.is_some()
    }

    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr, local_port: u16) {
        let controller = Arc::clone(&self.controller);
        let default_tls = self.default_tls.clone();
        let max_body_bytes = self.max_body_bytes;
        let interval = self.connection_interval;

        tokio::spawn(async move {
            let stats = ConnectionStats::new();
            let _reporter = spawn_stats_reporter(
                Arc::clone(&stats),
                Arc::clone(controller.telemetry()),
                interval,
            );
            let is_tls = default_tls.is_some();
            let client = ClientConnection::new(addr, local_port, is_tls, Arc::clone(&stats));
            let stream = CountingStream::new(stream, Arc::clone(&stats));

            let result = match default_tls {
                Some(default_context) => {
                    match accept_tls(stream, controller.resolver(), &default_context).await {
                        Ok(tls_stream) => {
                            handle_connection(tls_stream, client, controller, max_body_bytes).await
                        }
                        Err(e) => {
                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                            Ok(())
                        }
                    }
                }
                None => handle_connection(stream, client, controller, max_body_bytes).await,
            };
            if let Err(e) = result {
                debug!(addr = %addr, tls = is_tls, error = %e, "Connection error");
            }

            stats.mark_closed();
        });
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", self.bind_addr, e))?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        let protocol = if self.tls_enabled() { "HTTPS" } else { "HTTP" };
        info!(addr = %local_addr, protocol, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let _ = stream.set_nodelay(true);
                            self.spawn_connection(stream, addr, local_addr.port());
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(addr = %local_addr, "Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Read the ClientHello and finish the handshake with the context for its
/// server name. Unknown names abort the handshake.
async fn accept_tls<R, IO>(
    stream: IO,
    resolver: &ResolutionCache<R>,
    default_context: &TlsContext,
) -> anyhow::Result<tokio_rustls::server::TlsStream<IO>>
where
    R: BackendRegistry,
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream).await?;
    let server_name = start.client_hello().server_name().map(str::to_string);

    let context = match server_name {
        Some(name) => resolver.resolve_tls_context(&name).await.map_err(|e| {
            warn!(server_name = %name, error = %e, "No TLS context for server name");
            anyhow::anyhow!("{}", e)
        })?,
        None => Arc::clone(default_context),
    };

    Ok(start.into_stream(context).await?)
}

async fn handle_connection<S, R, T>(
    stream: S,
    client: ClientConnection,
    controller: Arc<ProxyFailoverController<R, T>>,
    max_body_bytes: usize,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    R: BackendRegistry,
    T: Transport,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let controller = Arc::clone(&controller);
        let client = client.clone();
        async move { handle_request(req, controller, client, max_body_bytes).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request<R: BackendRegistry, T: Transport>(
    req: Request<Incoming>,
    controller: Arc<ProxyFailoverController<R, T>>,
    client: ClientConnection,
    max_body_bytes: usize,
) -> Result<Response<ProxyBody>, hyper::Error> {
    if is_upgrade_request(&req) {
        return Ok(handle_upgrade(req, controller.resolver(), &client).await);
    }

    let (parts, body) = req.into_parts();
    let mut buffered = BufferedRequest::from_parts(parts);
    if let Err(e) = buffered.read_body(body, max_body_bytes).await {
        warn!(remote = %client.remote_addr, error = %e, "Failed to buffer request body");
        return Ok(controller.reject(&buffered, &client, e.code()));
    }

    Ok(controller.handle(buffered, &client).await)
}

/// Check if a request asks for a protocol upgrade (WebSocket)
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(UPGRADE)
}

/// Copy bytes both ways between the upgraded client and the backend
async fn forward_bidirectional(
    client: Upgraded,
    mut backend: TcpStream,
    leftover: Vec<u8>,
    frontend: &str,
) {
    let mut client_io = TokioIo::new(client);

    if !leftover.is_empty() {
        if let Err(e) = client_io.write_all(&leftover).await {
            debug!(frontend, error = %e, "Failed to relay early backend data");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(frontend, client_to_backend, backend_to_client, "Upgraded connection closed");
        }
        Err(e) => {
            debug!(frontend, error = %e, "Upgraded connection closed with error");
        }
    }
}

/// Serialize the upgrade request for the backend. The client's Host header
/// is kept so the backend sees the frontend name.
fn build_upgrade_request<B>(req: &Request<B>) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    if !req.headers().contains_key(HOST) {
        if let Some(authority) = req.uri().authority() {
            request.push_str(&format!("host: {}\r\n", authority));
        }
    }
    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    request.push_str("\r\n");

    request.into_bytes()
}

/// Read until the end of the response head. Returns the head and any bytes
/// that arrived after it.
async fn read_response_head(stream: &mut TcpStream) -> std::io::Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "backend closed connection before responding",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let leftover = buf.split_off(end + 4);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_UPGRADE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "backend response head too large",
            ));
        }
    }
}

/// Parse the status line and headers of a backend response head
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }
    let status = StatusCode::from_u16(parts[1].parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

fn empty_response(
    status: StatusCode,
    headers: &[(String, String)],
    skip_framing: bool,
) -> Response<ProxyBody> {
    let mut response = Response::new(Empty::<Bytes>::new().map_err(|never| match never {}).boxed());
    *response.status_mut() = status;

    for (name, value) in headers {
        let framing = name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding");
        if skip_framing && framing {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            hyper::header::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            response.headers_mut().append(name, value);
        }
    }
    response
}

/// Resolve a backend and bridge an upgrade request to it over raw TCP.
/// Upgrades are never retried.
async fn handle_upgrade<R: BackendRegistry>(
    mut req: Request<Incoming>,
    resolver: &ResolutionCache<R>,
    client: &ClientConnection,
) -> Response<ProxyBody> {
    let request_id = inject_forwarding_headers(req.headers_mut(), client);
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()));

    let backend = match resolver.select_backend(host.as_deref()).await {
        Ok(backend) => backend,
        Err(e) => {
            debug!(request_id, error = %e, "Upgrade resolution failed");
            return error_response(e.code());
        }
    };

    client.stats.set_labels(ConnectionLabels {
        frontend: backend.frontend.clone(),
        virtual_host: backend.virtual_host.clone(),
        metric_session: backend.metric_session.clone(),
    });

    let upgrade_type = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_lowercase();
    debug!(
        request_id,
        frontend = %backend.frontend,
        upgrade_type,
        url = %backend.url(),
        "Handling upgrade request"
    );

    let mut backend_stream = match TcpStream::connect(backend.authority()).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(
                frontend = %backend.frontend,
                url = %backend.url(),
                error = %e,
                "Failed to connect to backend for upgrade"
            );
            return error_response(ProxyErrorCode::BackendUnreachable);
        }
    };

    if let Err(e) = backend_stream.write_all(&build_upgrade_request(&req)).await {
        error!(
            frontend = %backend.frontend,
            error = %e,
            "Failed to send upgrade request to backend"
        );
        return error_response(ProxyErrorCode::BackendUnreachable);
    }

    let (head, leftover) = match read_response_head(&mut backend_stream).await {
        Ok(read) => read,
        Err(e) => {
            error!(
                frontend = %backend.frontend,
                error = %e,
                "Failed to read upgrade response from backend"
            );
            return error_response(ProxyErrorCode::BackendError);
        }
    };

    let Some((status, response_headers)) = parse_upgrade_response(&head) else {
        error!(frontend = %backend.frontend, "Failed to parse backend upgrade response");
        return error_response(ProxyErrorCode::BackendError);
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(frontend = %backend.frontend, status = %status, "Backend rejected upgrade request");
        return empty_response(status, &response_headers, false);
    }

    info!(request_id, frontend = %backend.frontend, upgrade_type, "Upgrade successful");
    let response = empty_response(StatusCode::SWITCHING_PROTOCOLS, &response_headers, true);

    let frontend = backend.frontend.clone();
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                forward_bidirectional(upgraded, backend_stream, leftover, &frontend).await
            }
            Err(e) => error!(frontend, error = %e, "Failed to upgrade client connection"),
        }
    });

    response
}
