//! Failure taxonomy and plain-text error responses for the proxy

use crate::registry::RegistryError;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, EXPIRES, PRAGMA};
use hyper::{Response, StatusCode};

/// Body type of every response the proxy produces
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Header carrying the machine-readable error code
pub const X_PROXY_ERROR: &str = "x-proxy-error";

/// Error codes for user-visible proxy failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// No pool with a real backend for this host
    NotConfigured,
    /// The pool has a single backend and is treated as offline
    ApplicationOffline,
    /// No TLS credential for the requested server name
    BadDomain,
    /// Connection refused or timed out
    BackendUnreachable,
    /// Retries exhausted
    MaxRetriesExceeded,
    /// Failed with retries disabled
    RetryDisabled,
    /// The client went away before a retry could be attempted
    ResponseAlreadyClosed,
    /// Non-retryable transport failure
    BackendError,
    /// Registry I/O failed during resolution
    RegistryUnavailable,
    /// Request body exceeds the replay buffer
    PayloadTooLarge,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::NotConfigured => StatusCode::BAD_REQUEST,
            ProxyErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyErrorCode::ApplicationOffline
            | ProxyErrorCode::BadDomain
            | ProxyErrorCode::BackendUnreachable
            | ProxyErrorCode::MaxRetriesExceeded
            | ProxyErrorCode::RetryDisabled
            | ProxyErrorCode::ResponseAlreadyClosed
            | ProxyErrorCode::BackendError
            | ProxyErrorCode::RegistryUnavailable => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::NotConfigured => "NOT_CONFIGURED",
            ProxyErrorCode::ApplicationOffline => "APPLICATION_OFFLINE",
            ProxyErrorCode::BadDomain => "BAD_DOMAIN",
            ProxyErrorCode::BackendUnreachable => "BACKEND_UNREACHABLE",
            ProxyErrorCode::MaxRetriesExceeded => "MAX_RETRIES_EXCEEDED",
            ProxyErrorCode::RetryDisabled => "RETRY_DISABLED",
            ProxyErrorCode::ResponseAlreadyClosed => "RESPONSE_ALREADY_CLOSED",
            ProxyErrorCode::BackendError => "BACKEND_ERROR",
            ProxyErrorCode::RegistryUnavailable => "REGISTRY_UNAVAILABLE",
            ProxyErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
        }
    }

    /// Default message shown to clients
    pub fn message(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "No Host header",
            ProxyErrorCode::NotConfigured => "No Application Configured",
            ProxyErrorCode::ApplicationOffline => "Application is offline",
            ProxyErrorCode::BadDomain => "Bad domain",
            ProxyErrorCode::BackendUnreachable => "Backend is unreachable",
            ProxyErrorCode::MaxRetriesExceeded => "Reached max retries limit",
            ProxyErrorCode::RetryDisabled => "Retry on error is disabled",
            ProxyErrorCode::ResponseAlreadyClosed => "Cannot retry on error",
            ProxyErrorCode::BackendError => "Backend reported an error",
            ProxyErrorCode::RegistryUnavailable => "Backend registry unavailable",
            ProxyErrorCode::PayloadTooLarge => "Request body too large",
        }
    }
}

/// Failures while turning a Host header or server name into a target
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no host header")]
    MissingHostHeader,

    #[error("no application configured for {0}")]
    NotConfigured(String),

    #[error("application {0} is offline")]
    ApplicationOffline(String),

    #[error("bad domain {0}")]
    BadDomain(String),

    #[error("invalid TLS credential for {name}: {reason}")]
    InvalidCredential { name: String, reason: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ResolveError {
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            ResolveError::MissingHostHeader => ProxyErrorCode::MissingHostHeader,
            ResolveError::NotConfigured(_) => ProxyErrorCode::NotConfigured,
            ResolveError::ApplicationOffline(_) => ProxyErrorCode::ApplicationOffline,
            ResolveError::BadDomain(_) | ResolveError::InvalidCredential { .. } => {
                ProxyErrorCode::BadDomain
            }
            ResolveError::Registry(_) => ProxyErrorCode::RegistryUnavailable,
        }
    }
}

/// Plain-text error response with the code's message that intermediaries
/// must not cache. Internal failure details stay in the logs.
pub fn error_response(code: ProxyErrorCode) -> Response<ProxyBody> {
    let body = code.message();

    Response::builder()
        .status(code.status_code())
        .header(CONTENT_TYPE, "text/plain")
        .header(CONTENT_LENGTH, body.len())
        .header(CACHE_CONTROL, "no-cache")
        .header(PRAGMA, "no-cache")
        .header(EXPIRES, HeaderValue::from_static("-1"))
        .header(X_PROXY_ERROR, code.as_header_value())
        .body(Full::new(Bytes::from_static(body.as_bytes())).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
