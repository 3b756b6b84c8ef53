//! statsd metrics
//!
//! Samples are recorded through the `metrics` macros. In production a statsd
//! recorder is installed globally; it queues samples off the request path and
//! packs them into datagrams of at most `packet_size` bytes.

use super::{ConnectionReport, RequestSummary};
use crate::config::MetricsConfig;
use metrics::{counter, histogram};
use metrics_exporter_statsd::{StatsdBuilder, StatsdRecorder};
use tracing::info;

/// Session used when neither the request nor the config names one
pub const DEFAULT_METRIC_SESSION: &str = "default";

pub fn metric_prefix(session: Option<&str>, frontend: &str) -> String {
    let session = session.filter(|s| !s.is_empty()).unwrap_or(DEFAULT_METRIC_SESSION);
    format!("http.{}.{}", session, frontend.replace('.', "_"))
}

/// Timings and status counters for one request
pub fn record_request_metrics(summary: &RequestSummary, default_session: Option<&str>) {
    let prefix = metric_prefix(
        summary.metric_session.as_deref().or(default_session),
        &summary.frontend,
    );
    histogram!(format!("{}.total", prefix)).record(summary.total.as_millis() as f64);
    histogram!(format!("{}.backend", prefix)).record(summary.backend.as_millis() as f64);
    histogram!(format!("{}.connect", prefix)).record(summary.connect().as_millis() as f64);
    counter!(format!("{}.status.{}", prefix, summary.status)).increment(1);
    counter!(prefix).increment(1);
}

/// Byte counters for one connection report
pub fn record_connection_metrics(report: &ConnectionReport, default_session: Option<&str>) {
    let prefix = metric_prefix(
        report.metric_session.as_deref().or(default_session),
        &report.frontend,
    );
    counter!(format!("{}.bytesWritten", prefix)).increment(report.bytes_written);
    counter!(format!("{}.bytesRead", prefix)).increment(report.bytes_read);
    counter!(format!("{}.bytesTotal", prefix)).increment(report.bytes_read + report.bytes_written);
}

/// Build a statsd recorder for the configured collector without installing it
pub fn statsd_recorder(config: &MetricsConfig) -> anyhow::Result<StatsdRecorder> {
    StatsdBuilder::from(config.host.clone(), config.port)
        .with_queue_size(config.queue_size)
        .with_buffer_size(config.packet_size)
        .histogram_is_timer()
        .build(None)
        .map_err(|e| {
            anyhow::anyhow!(
                "Failed to create statsd recorder for {}:{}: {}",
                config.host,
                config.port,
                e
            )
        })
}

/// Records into whichever `metrics` recorder is current
#[derive(Debug, Clone, Default)]
pub struct StatsdMetrics {
    default_session: Option<String>,
}

impl StatsdMetrics {
    pub fn new(default_session: Option<String>) -> Self {
        Self { default_session }
    }

    /// Install a statsd recorder as the process-wide recorder
    pub fn install(
        config: &MetricsConfig,
        default_session: Option<String>,
    ) -> anyhow::Result<Self> {
        let recorder = statsd_recorder(config)?;
        metrics::set_global_recorder(recorder)
            .map_err(|_| anyhow::anyhow!("A metrics recorder is already installed"))?;

        info!(
            host = %config.host,
            port = config.port,
            packet_size = config.packet_size,
            "statsd recorder installed"
        );
        Ok(Self::new(default_session))
    }

    pub fn record_request(&self, summary: &RequestSummary) {
        record_request_metrics(summary, self.default_session.as_deref());
    }

    pub fn record_connection(&self, report: &ConnectionReport) {
        record_connection_metrics(report, self.default_session.as_deref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};
    use std::collections::HashMap;
    use std::time::{Duration, SystemTime};

    fn recorded(f: impl FnOnce()) -> HashMap<String, DebugValue> {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        metrics::with_local_recorder(&recorder, f);

        snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _, _, value)| (key.key().name().to_string(), value))
            .collect()
    }

    fn counter_value(values: &HashMap<String, DebugValue>, name: &str) -> u64 {
        match values.get(name) {
            Some(DebugValue::Counter(n)) => *n,
            other => panic!("expected counter {}, got {:?}", name, other),
        }
    }

    fn timings(values: &HashMap<String, DebugValue>, name: &str) -> Vec<f64> {
        match values.get(name) {
            Some(DebugValue::Histogram(samples)) => {
                samples.iter().map(|s| s.into_inner()).collect()
            }
            other => panic!("expected histogram {}, got {:?}", name, other),
        }
    }

    fn summary(metric_session: Option<&str>) -> RequestSummary {
        RequestSummary {
            request_id: "r1".to_string(),
            remote_addr: "127.0.0.1".to_string(),
            started_at: SystemTime::UNIX_EPOCH,
            method: "GET".to_string(),
            path: "/".to_string(),
            http_version: "HTTP/1.1".to_string(),
            status: 404,
            bytes: 10,
            referer: None,
            user_agent: None,
            name: "shop".to_string(),
            backend_url: None,
            virtual_host: None,
            frontend: "shop.example.com".to_string(),
            log_session: None,
            metric_session: metric_session.map(String::from),
            retries: 0,
            total: Duration::from_millis(25),
            backend: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_request_timings_and_status() {
        let values = recorded(|| {
            record_request_metrics(&summary(Some("s1")), None);
            record_request_metrics(&summary(Some("s1")), None);
        });

        assert_eq!(timings(&values, "http.s1.shop_example_com.total"), vec![25.0, 25.0]);
        assert_eq!(timings(&values, "http.s1.shop_example_com.backend"), vec![20.0, 20.0]);
        assert_eq!(timings(&values, "http.s1.shop_example_com.connect"), vec![5.0, 5.0]);
        assert_eq!(counter_value(&values, "http.s1.shop_example_com"), 2);
        assert_eq!(counter_value(&values, "http.s1.shop_example_com.status.404"), 2);
    }

    #[test]
    fn test_default_session() {
        let values = recorded(|| {
            record_request_metrics(&summary(None), Some("configured"));
            record_request_metrics(&summary(Some("")), None);
        });

        assert_eq!(counter_value(&values, "http.configured.shop_example_com"), 1);
        assert_eq!(counter_value(&values, "http.default.shop_example_com"), 1);
    }

    #[test]
    fn test_connection_byte_counters() {
        let report = ConnectionReport {
            frontend: "a.b".to_string(),
            virtual_host: None,
            metric_session: None,
            bytes_read: 100,
            bytes_written: 250,
        };
        let metrics = StatsdMetrics::new(Some("m".to_string()));
        let values = recorded(|| {
            metrics.record_connection(&report);
            metrics.record_connection(&report);
        });

        assert_eq!(counter_value(&values, "http.m.a_b.bytesWritten"), 500);
        assert_eq!(counter_value(&values, "http.m.a_b.bytesRead"), 200);
        assert_eq!(counter_value(&values, "http.m.a_b.bytesTotal"), 700);
    }

    #[test]
    fn test_statsd_recorder_for_local_collector() {
        let config = MetricsConfig {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8125,
            ..MetricsConfig::default()
        };
        assert!(statsd_recorder(&config).is_ok());
    }
}
