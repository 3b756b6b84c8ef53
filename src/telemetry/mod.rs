//! Per-request and per-connection telemetry
//!
//! Every request produces exactly one [`RequestSummary`], handed to a
//! [`TelemetrySink`] once the response has been fully written (or
//! abandoned). Sinks are fire-and-forget and never block the response.

mod access_log;
mod statsd;

pub use access_log::{format_access_line, AccessLogger};
pub use statsd::{
    metric_prefix, record_connection_metrics, record_request_metrics, statsd_recorder,
    StatsdMetrics, DEFAULT_METRIC_SESSION,
};

use std::time::{Duration, SystemTime};
use tracing::debug;

/// Everything known about a finished request
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSummary {
    pub request_id: String,
    pub remote_addr: String,
    pub started_at: SystemTime,
    pub method: String,
    pub path: String,
    pub http_version: String,
    pub status: u16,
    pub bytes: u64,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    pub name: String,
    pub backend_url: Option<String>,
    pub virtual_host: Option<String>,
    pub frontend: String,
    pub log_session: Option<String>,
    pub metric_session: Option<String>,
    pub retries: u32,
    pub total: Duration,
    pub backend: Duration,
}

impl RequestSummary {
    /// Time spent before the backend was engaged
    pub fn connect(&self) -> Duration {
        self.total.saturating_sub(self.backend)
    }
}

/// Byte counters for one client connection since the previous report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionReport {
    pub frontend: String,
    pub virtual_host: Option<String>,
    pub metric_session: Option<String>,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Receiver of request summaries and connection reports
pub trait TelemetrySink: Send + Sync {
    fn record_request(&self, summary: &RequestSummary);

    fn record_connection(&self, report: &ConnectionReport);
}

/// Access log plus optional statsd metrics
pub struct Telemetry {
    access_log: AccessLogger,
    metrics: Option<StatsdMetrics>,
}

impl Telemetry {
    pub fn new(access_log: AccessLogger, metrics: Option<StatsdMetrics>) -> Self {
        Self { access_log, metrics }
    }
}

impl TelemetrySink for Telemetry {
    fn record_request(&self, summary: &RequestSummary) {
        self.access_log.log(summary);
        if let Some(metrics) = &self.metrics {
            metrics.record_request(summary);
        }
    }

    fn record_connection(&self, report: &ConnectionReport) {
        if report.bytes_read == 0 && report.bytes_written == 0 {
            return;
        }
        debug!(
            frontend = %report.frontend,
            bytes_read = report.bytes_read,
            bytes_written = report.bytes_written,
            "Connection traffic"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_connection(report);
        }
    }
}
