//! Client connection accounting
//!
//! Every accepted socket is wrapped in a [`CountingStream`] so the proxy can
//! report bytes read and written per connection, and can tell whether the
//! client is still there before retrying a failed request.

use crate::telemetry::{ConnectionReport, TelemetrySink};
use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::task::JoinHandle;
use tracing::trace;

/// Routing labels learned once a request on the connection resolves
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionLabels {
    pub frontend: String,
    pub virtual_host: Option<String>,
    pub metric_session: Option<String>,
}

/// Shared counters for one client connection
#[derive(Debug, Default)]
pub struct ConnectionStats {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    reported_read: AtomicU64,
    reported_written: AtomicU64,
    closed: AtomicBool,
    labels: Mutex<Option<ConnectionLabels>>,
}

impl ConnectionStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_read(&self, n: usize) {
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_written(&self, n: usize) {
        self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn set_labels(&self, labels: ConnectionLabels) {
        *self.labels.lock() = Some(labels);
    }

    pub fn labels(&self) -> Option<ConnectionLabels> {
        self.labels.lock().clone()
    }

    /// Bytes (read, written) since the previous call
    pub fn take_delta(&self) -> (u64, u64) {
        let read = self.bytes_read();
        let written = self.bytes_written();
        let prev_read = self.reported_read.swap(read, Ordering::Relaxed);
        let prev_written = self.reported_written.swap(written, Ordering::Relaxed);
        (read.saturating_sub(prev_read), written.saturating_sub(prev_written))
    }

    /// Report the delta since the last report, if the connection ever
    /// resolved a frontend
    pub fn report(&self) -> Option<ConnectionReport> {
        let labels = self.labels()?;
        let (bytes_read, bytes_written) = self.take_delta();
        Some(ConnectionReport {
            frontend: labels.frontend,
            virtual_host: labels.virtual_host,
            metric_session: labels.metric_session,
            bytes_read,
            bytes_written,
        })
    }
}

/// Stream wrapper that counts bytes in both directions.
/// Dropping it marks the connection closed.
pub struct CountingStream<S> {
    inner: S,
    stats: Arc<ConnectionStats>,
}

impl<S> CountingStream<S> {
    pub fn new(inner: S, stats: Arc<ConnectionStats>) -> Self {
        Self { inner, stats }
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S> Drop for CountingStream<S> {
    fn drop(&mut self) {
        self.stats.mark_closed();
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CountingStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let n = buf.filled().len() - before;
            if n == 0 {
                this.stats.mark_closed();
            } else {
                this.stats.add_read(n);
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CountingStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        match &poll {
            Poll::Ready(Ok(n)) => this.stats.add_written(*n),
            Poll::Ready(Err(_)) => this.stats.mark_closed(),
            Poll::Pending => {}
        }
        poll
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        match &poll {
            Poll::Ready(Ok(n)) => this.stats.add_written(*n),
            Poll::Ready(Err(_)) => this.stats.mark_closed(),
            Poll::Pending => {}
        }
        poll
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        this.stats.mark_closed();
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// Periodically report a connection's traffic, with a final report once it
/// closes
pub fn spawn_stats_reporter(
    stats: Arc<ConnectionStats>,
    telemetry: Arc<dyn TelemetrySink>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let closed = stats.is_closed();

            if let Some(report) = stats.report() {
                telemetry.record_connection(&report);
            }
            if closed {
                trace!("Connection closed, stats reporter done");
                break;
            }
        }
    })
}
