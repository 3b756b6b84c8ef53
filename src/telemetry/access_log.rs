use super::RequestSummary;
use tracing::info;

/// Tracing target carrying access-log lines
pub const ACCESS_LOG_TARGET: &str = "access_log";

/// Writes one line per request on the `access_log` tracing target
#[derive(Debug, Clone, Default)]
pub struct AccessLogger {
    /// Session used when the request did not resolve one
    default_session: Option<String>,
}

impl AccessLogger {
    pub fn new(default_session: Option<String>) -> Self {
        Self { default_session }
    }

    pub fn log(&self, summary: &RequestSummary) {
        let session = summary
            .log_session
            .as_deref()
            .or(self.default_session.as_deref())
            .unwrap_or("");
        let line = format_access_line(summary);

        info!(
            target: ACCESS_LOG_TARGET,
            session,
            request_id = %summary.request_id,
            "{}",
            line
        );
    }
}

/// `fwd=<addr> method=<m> path=<p> status=<s> bytes=<n> name=<name> host=<url>
/// backend=<ms>ms connect=<ms>ms total=<ms>ms`
pub fn format_access_line(summary: &RequestSummary) -> String {
    format!(
        "fwd={} method={} path={} status={} bytes={} name={} host={} \
         backend={}ms connect={}ms total={}ms",
        summary.remote_addr,
        summary.method,
        summary.path,
        summary.status,
        summary.bytes,
        summary.name,
        summary.backend_url.as_deref().unwrap_or("-"),
        summary.backend.as_millis(),
        summary.connect().as_millis(),
        summary.total.as_millis(),
    )
}
