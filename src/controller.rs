//! Per-request failover state machine
//!
//! A request moves `Init → Resolving → Proxying` and ends in `Success` or
//! `Failed`, looping through `Retry` while connection-class failures stay
//! within the configured bound. Each request owns a [`RequestContext`];
//! when the response body is finished (or dropped) the context is turned
//! into exactly one telemetry summary.

use crate::backend::Backend;
use crate::config::FailoverConfig;
use crate::connection::{ConnectionLabels, ConnectionStats};
use crate::error::{error_response, ProxyBody, ProxyErrorCode, ResolveError};
use crate::registry::BackendRegistry;
use crate::resolver::{normalize_host, ResolutionCache};
use crate::telemetry::{RequestSummary, TelemetrySink};
use crate::transport::{Transport, TransportError};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, HOST, REFERER, RETRY_AFTER, USER_AGENT};
use hyper::http::request::Parts;
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info, warn};

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_REAL_IP: &str = "x-real-ip";
pub const X_FORWARDED_PROTOCOL: &str = "x-forwarded-protocol";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const X_FORWARDED_PORT: &str = "x-forwarded-port";
pub const X_REQUEST_ID: &str = "x-request-id";
pub const X_DEBUG: &str = "x-debug";

/// Status recorded for requests whose client went away before a response
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// States of the failover state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Init,
    Resolving,
    Proxying,
    Retry,
    Success,
    Failed,
}

/// The client side of a request
#[derive(Debug, Clone)]
pub struct ClientConnection {
    pub remote_addr: SocketAddr,
    /// Port of the listener that accepted the connection
    pub local_port: u16,
    pub is_tls: bool,
    pub stats: Arc<ConnectionStats>,
}

impl ClientConnection {
    pub fn new(
        remote_addr: SocketAddr,
        local_port: u16,
        is_tls: bool,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        Self {
            remote_addr,
            local_port,
            is_tls,
            stats,
        }
    }

    /// Client address, with IPv4-mapped IPv6 addresses unwrapped
    pub fn remote_ip(&self) -> IpAddr {
        match self.remote_addr.ip() {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => IpAddr::V6(v6),
            },
            ip => ip,
        }
    }

    pub fn protocol(&self) -> &'static str {
        if self.is_tls {
            "https"
        } else {
            "http"
        }
    }

    /// Whether a response can still be delivered
    pub fn is_writable(&self) -> bool {
        !self.stats.is_closed()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BodyReadError {
    #[error("request body exceeds {0} bytes")]
    TooLarge(usize),

    #[error("failed to read request body: {0}")]
    Read(String),
}

impl BodyReadError {
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            BodyReadError::TooLarge(_) => ProxyErrorCode::PayloadTooLarge,
            BodyReadError::Read(_) => ProxyErrorCode::ResponseAlreadyClosed,
        }
    }
}

/// A request with its body held in memory so it can be replayed on retry
#[derive(Debug, Clone)]
pub struct BufferedRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl BufferedRequest {
    /// Request head with an empty body
    pub fn from_parts(parts: Parts) -> Self {
        Self {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            body: Bytes::new(),
        }
    }

    /// Read the whole body, failing once it grows past `limit` bytes
    pub async fn read_body<B>(&mut self, body: B, limit: usize) -> Result<(), BodyReadError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let collected = Limited::new(body, limit).collect().await.map_err(|e| {
            if e.downcast_ref::<LengthLimitError>().is_some() {
                BodyReadError::TooLarge(limit)
            } else {
                BodyReadError::Read(e.to_string())
            }
        })?;
        self.body = collected.to_bytes();
        Ok(())
    }

    pub async fn from_incoming<B>(req: Request<B>, limit: usize) -> Result<Self, BodyReadError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();
        let mut buffered = Self::from_parts(parts);
        buffered.read_body(body, limit).await?;
        Ok(buffered)
    }

    /// A fresh outbound request for one attempt
    pub fn to_request(&self) -> Request<Full<Bytes>> {
        let mut req = Request::new(Full::new(self.body.clone()));
        *req.method_mut() = self.method.clone();
        *req.uri_mut() = self.uri.clone();
        *req.version_mut() = self.version;
        *req.headers_mut() = self.headers.clone();
        req
    }

    /// Host header, or the URI authority for HTTP/2 requests
    pub fn host(&self) -> Option<String> {
        self.headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| self.uri.authority().map(|a| a.as_str().to_string()))
    }

    fn header_str(&self, name: HeaderName) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

fn insert_if_absent(headers: &mut HeaderMap, name: &'static str, value: &str) {
    let name = HeaderName::from_static(name);
    if headers.contains_key(&name) {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// Add forwarding headers the client did not send itself, and return the
/// request id. Calling it again on the same headers changes nothing.
pub fn inject_forwarding_headers(headers: &mut HeaderMap, client: &ClientConnection) -> String {
    let ip = client.remote_ip().to_string();
    let port = client.local_port.to_string();

    insert_if_absent(headers, X_FORWARDED_FOR, &ip);
    insert_if_absent(headers, X_REAL_IP, &ip);
    insert_if_absent(headers, X_FORWARDED_PROTOCOL, client.protocol());
    insert_if_absent(headers, X_FORWARDED_PROTO, client.protocol());
    insert_if_absent(headers, X_FORWARDED_PORT, &port);

    if let Some(existing) = headers.get(X_REQUEST_ID).and_then(|v| v.to_str().ok()) {
        return existing.to_string();
    }
    let request_id = uuid::Uuid::new_v4().to_string();
    insert_if_absent(headers, X_REQUEST_ID, &request_id);
    request_id
}

/// Whether a backend response means the backend should be quarantined.
/// A 503 carrying Retry-After is planned maintenance, not a failure.
pub fn is_dead_status(status: StatusCode, headers: &HeaderMap, failover: &FailoverConfig) -> bool {
    let code = status.as_u16();
    if code < failover.dead_status_start() || code >= 600 {
        return false;
    }
    !(status == StatusCode::SERVICE_UNAVAILABLE && headers.contains_key(RETRY_AFTER))
}

/// Timer marks for one request
#[derive(Debug, Clone)]
pub struct RequestTimer {
    pub start: Instant,
    pub start_backend: Option<Instant>,
    pub head: Option<Instant>,
    pub end: Option<Instant>,
}

impl RequestTimer {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            start_backend: None,
            head: None,
            end: None,
        }
    }

    fn until(&self, mark: Option<Instant>) -> Instant {
        mark.unwrap_or_else(Instant::now)
    }

    pub fn total(&self) -> Duration {
        self.until(self.end).saturating_duration_since(self.start)
    }

    pub fn backend(&self) -> Duration {
        match self.start_backend {
            Some(start) => self.until(self.end).saturating_duration_since(start),
            None => Duration::ZERO,
        }
    }

    /// Elapsed (total, backend) at the moment the response head arrived
    pub fn at_head(&self) -> (Duration, Duration) {
        let head = self.until(self.head);
        let backend = self
            .start_backend
            .map(|start| head.saturating_duration_since(start))
            .unwrap_or(Duration::ZERO);
        (head.saturating_duration_since(self.start), backend)
    }
}

/// Session identifiers used when a request never resolves a backend
#[derive(Debug, Clone, Default)]
pub struct SessionDefaults {
    pub log_session: Option<String>,
    pub metric_session: Option<String>,
}

/// Everything the proxy tracks about one request
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub frontend: String,
    pub backend: Option<Backend>,
    pub log_session: Option<String>,
    pub metric_session: Option<String>,
    pub timer: RequestTimer,
    pub started_at: SystemTime,
    pub retries: u32,
    pub state: ControllerState,
    pub status: u16,
    pub bytes: u64,
    pub debug: bool,
    response_inspected: bool,
    method: String,
    path: String,
    version: String,
    referer: Option<String>,
    user_agent: Option<String>,
    remote_addr: String,
}

impl RequestContext {
    pub fn new(
        req: &BufferedRequest,
        client: &ClientConnection,
        request_id: String,
        defaults: &SessionDefaults,
    ) -> Self {
        Self {
            request_id,
            frontend: req.host().map(|h| normalize_host(&h)).unwrap_or_default(),
            backend: None,
            log_session: defaults.log_session.clone(),
            metric_session: defaults.metric_session.clone(),
            timer: RequestTimer::new(),
            started_at: SystemTime::now(),
            retries: 0,
            state: ControllerState::Init,
            status: CLIENT_CLOSED_REQUEST,
            bytes: 0,
            debug: req.headers.contains_key(X_DEBUG),
            response_inspected: false,
            method: req.method.to_string(),
            path: req
                .uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            version: format!("{:?}", req.version),
            referer: req.header_str(REFERER),
            user_agent: req.header_str(USER_AGENT),
            remote_addr: client.remote_ip().to_string(),
        }
    }

    pub fn transition(&mut self, next: ControllerState) {
        debug!(request_id = %self.request_id, from = ?self.state, to = ?next, "Request state");
        self.state = next;
    }

    /// Record the backend chosen for the current attempt
    fn attach_backend(&mut self, backend: Backend) {
        self.frontend = backend.frontend.clone();
        if backend.log_session.is_some() {
            self.log_session = backend.log_session.clone();
        }
        if backend.metric_session.is_some() {
            self.metric_session = backend.metric_session.clone();
        }
        self.backend = Some(backend);
    }

    pub fn summary(&self) -> RequestSummary {
        RequestSummary {
            request_id: self.request_id.clone(),
            remote_addr: self.remote_addr.clone(),
            started_at: self.started_at,
            method: self.method.clone(),
            path: self.path.clone(),
            http_version: self.version.clone(),
            status: self.status,
            bytes: self.bytes,
            referer: self.referer.clone(),
            user_agent: self.user_agent.clone(),
            name: self
                .backend
                .as_ref()
                .map(|b| b.name.clone())
                .unwrap_or_else(|| "-".to_string()),
            backend_url: self.backend.as_ref().map(Backend::url),
            virtual_host: self.backend.as_ref().and_then(|b| b.virtual_host.clone()),
            frontend: self.frontend.clone(),
            log_session: self.log_session.clone(),
            metric_session: self.metric_session.clone(),
            retries: self.retries,
            total: self.timer.total(),
            backend: self.timer.backend(),
        }
    }
}

/// Emits the request summary when dropped, so it fires exactly once
/// whether the body completes, the client disconnects, or the handler
/// future is cancelled
struct Completion {
    ctx: RequestContext,
    telemetry: Arc<dyn TelemetrySink>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.ctx.timer.end.is_none() {
            self.ctx.timer.end = Some(Instant::now());
        }
        let summary = self.ctx.summary();
        self.telemetry.record_request(&summary);
    }
}

/// Drives resolution, forwarding, retries and quarantine for each request
pub struct ProxyFailoverController<R, T> {
    resolver: Arc<ResolutionCache<R>>,
    transport: Arc<T>,
    telemetry: Arc<dyn TelemetrySink>,
    failover: FailoverConfig,
    defaults: SessionDefaults,
}

impl<R: BackendRegistry, T: Transport> ProxyFailoverController<R, T> {
    pub fn new(
        resolver: Arc<ResolutionCache<R>>,
        transport: Arc<T>,
        telemetry: Arc<dyn TelemetrySink>,
        failover: FailoverConfig,
        defaults: SessionDefaults,
    ) -> Self {
        Self {
            resolver,
            transport,
            telemetry,
            failover,
            defaults,
        }
    }

    pub fn resolver(&self) -> &Arc<ResolutionCache<R>> {
        &self.resolver
    }

    pub fn telemetry(&self) -> &Arc<dyn TelemetrySink> {
        &self.telemetry
    }

    /// Handle one buffered request end to end
    pub async fn handle(
        &self,
        mut req: BufferedRequest,
        client: &ClientConnection,
    ) -> Response<ProxyBody> {
        let request_id = inject_forwarding_headers(&mut req.headers, client);
        let ctx = RequestContext::new(&req, client, request_id, &self.defaults);
        let mut completion = Completion {
            ctx,
            telemetry: Arc::clone(&self.telemetry),
        };

        let response = self.run(&req, client, &mut completion.ctx).await;
        finish(response, completion)
    }

    /// Answer a request that never reached the state machine, still
    /// producing its summary
    pub fn reject(
        &self,
        req: &BufferedRequest,
        client: &ClientConnection,
        code: ProxyErrorCode,
    ) -> Response<ProxyBody> {
        let request_id = req
            .headers
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut ctx = RequestContext::new(req, client, request_id, &self.defaults);
        ctx.transition(ControllerState::Failed);
        finish(
            error_response(code),
            Completion {
                ctx,
                telemetry: Arc::clone(&self.telemetry),
            },
        )
    }

    async fn run(
        &self,
        req: &BufferedRequest,
        client: &ClientConnection,
        ctx: &mut RequestContext,
    ) -> Response<ProxyBody> {
        let host = req.host();
        let mut failures: u32 = 0;

        loop {
            ctx.transition(ControllerState::Resolving);
            let backend = match self.resolver.select_backend(host.as_deref()).await {
                Ok(backend) => backend,
                Err(e) => return self.on_resolve_error(ctx, e),
            };

            client.stats.set_labels(ConnectionLabels {
                frontend: backend.frontend.clone(),
                virtual_host: backend.virtual_host.clone(),
                metric_session: backend
                    .metric_session
                    .clone()
                    .or_else(|| ctx.metric_session.clone()),
            });
            ctx.attach_backend(backend.clone());

            ctx.transition(ControllerState::Proxying);
            ctx.timer.start_backend = Some(Instant::now());

            match self.transport.forward(req.to_request(), &backend).await {
                Ok(response) => {
                    ctx.timer.head = Some(Instant::now());
                    self.inspect_response(ctx, &backend, &response).await;
                    ctx.transition(ControllerState::Success);
                    return response;
                }
                Err(e) => {
                    if let Some(response) = self
                        .on_transport_error(ctx, client, &backend, e, &mut failures)
                        .await
                    {
                        return response;
                    }
                }
            }
        }
    }

    fn on_resolve_error(&self, ctx: &mut RequestContext, err: ResolveError) -> Response<ProxyBody> {
        ctx.transition(ControllerState::Failed);
        match &err {
            ResolveError::Registry(e) => {
                warn!(
                    request_id = %ctx.request_id,
                    frontend = %ctx.frontend,
                    error = %e,
                    "Registry read failed"
                )
            }
            _ => debug!(
                request_id = %ctx.request_id,
                frontend = %ctx.frontend,
                error = %err,
                "Resolution failed"
            ),
        }
        error_response(err.code())
    }

    /// Returns the final response, or `None` to retry
    async fn on_transport_error(
        &self,
        ctx: &mut RequestContext,
        client: &ClientConnection,
        backend: &Backend,
        err: TransportError,
        failures: &mut u32,
    ) -> Option<Response<ProxyBody>> {
        warn!(
            request_id = %ctx.request_id,
            frontend = %backend.frontend,
            backend_id = %backend.id,
            url = %backend.url(),
            error = %err,
            "Backend request failed"
        );

        if !err.is_retryable() {
            ctx.transition(ControllerState::Failed);
            return Some(error_response(ProxyErrorCode::BackendError));
        }

        if !backend.is_protected() {
            if let Err(e) = self.resolver.mark_dead_backend(backend).await {
                warn!(backend_id = %backend.id, error = %e, "Failed to quarantine backend");
            }
        }

        *failures += 1;

        if !client.is_writable() {
            error!(request_id = %ctx.request_id, "Cannot retry on error, client connection closed");
            ctx.transition(ControllerState::Failed);
            return Some(error_response(ProxyErrorCode::ResponseAlreadyClosed));
        }

        if *failures > self.failover.retry_on_error {
            ctx.transition(ControllerState::Failed);
            let code = if self.failover.retry_on_error == 0 {
                ProxyErrorCode::RetryDisabled
            } else {
                ProxyErrorCode::MaxRetriesExceeded
            };
            info!(
                request_id = %ctx.request_id,
                retries = ctx.retries,
                code = code.as_header_value(),
                "Giving up on request"
            );
            return Some(error_response(code));
        }

        ctx.retries = *failures;
        ctx.transition(ControllerState::Retry);
        None
    }

    /// Quarantine the backend if its response looks like a failure.
    /// Runs at most once per request.
    async fn inspect_response(
        &self,
        ctx: &mut RequestContext,
        backend: &Backend,
        response: &Response<ProxyBody>,
    ) {
        if ctx.response_inspected {
            return;
        }
        ctx.response_inspected = true;

        if !is_dead_status(response.status(), response.headers(), &self.failover) {
            return;
        }
        if backend.is_protected() {
            debug!(
                backend_id = %backend.id,
                status = response.status().as_u16(),
                "Protected backend not quarantined"
            );
            return;
        }

        warn!(
            request_id = %ctx.request_id,
            frontend = %backend.frontend,
            backend_id = %backend.id,
            status = response.status().as_u16(),
            "Backend returned an error status"
        );
        if let Err(e) = self.resolver.mark_dead_backend(backend).await {
            warn!(backend_id = %backend.id, error = %e, "Failed to quarantine backend");
        }
    }
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: String) {
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

fn add_debug_headers(headers: &mut HeaderMap, ctx: &RequestContext) {
    if let Some(backend) = &ctx.backend {
        set_header(headers, "x-debug-backend-url", backend.url());
        set_header(headers, "x-debug-backend-id", backend.id.clone());
        if let Some(vhost) = &backend.virtual_host {
            set_header(headers, "x-debug-vhost", vhost.clone());
        }
    }
    set_header(headers, "x-debug-frontend-key", ctx.frontend.clone());

    let (total, backend) = ctx.timer.at_head();
    set_header(headers, "x-debug-time-total", total.as_millis().to_string());
    set_header(headers, "x-debug-time-backend", backend.as_millis().to_string());
}

/// Attach the completion guard to the response body so the summary is
/// emitted once the body is done
fn finish(response: Response<ProxyBody>, mut completion: Completion) -> Response<ProxyBody> {
    let (mut parts, body) = response.into_parts();
    completion.ctx.status = parts.status.as_u16();
    if completion.ctx.timer.head.is_none() {
        completion.ctx.timer.head = Some(Instant::now());
    }
    if completion.ctx.debug {
        add_debug_headers(&mut parts.headers, &completion.ctx);
    }

    let body = body
        .map_frame(move |frame| {
            if let Some(data) = frame.data_ref() {
                completion.ctx.bytes += data.len() as u64;
            }
            frame
        })
        .boxed();

    Response::from_parts(parts, body)
}
