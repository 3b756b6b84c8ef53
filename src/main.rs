use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tenantgate::cache::BoundedCache;
use tenantgate::config::{Config, RegistryKind};
use tenantgate::controller::{ProxyFailoverController, SessionDefaults};
use tenantgate::proxy::ProxyServer;
use tenantgate::registry::{BackendRegistry, MemoryRegistry, RedisRegistry};
use tenantgate::resolver::ResolutionCache;
use tenantgate::supervisor::{Supervisor, WORKER_FLAG};
use tenantgate::telemetry::{AccessLogger, StatsdMetrics, Telemetry, TelemetrySink};
use tenantgate::tls::{load_tls_context, self_signed_context, TlsContext};
use tenantgate::transport::HyperTransport;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tenantgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let mut is_worker = false;
    let mut config_path = None;
    for arg in std::env::args().skip(1) {
        if arg == WORKER_FLAG {
            is_worker = true;
        } else if config_path.is_none() {
            config_path = Some(PathBuf::from(arg));
        }
    }
    let config_path = config_path.unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), worker = is_worker, "Configuration loaded");

    if config.workers > 0 && !is_worker {
        print_startup_banner(&config, "master");
        return run_master(&config, &config_path).await;
    }

    print_startup_banner(&config, if is_worker { "worker" } else { "standalone" });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    match config.registry.kind {
        RegistryKind::Redis => {
            let registry = RedisRegistry::connect(&config.registry, shutdown_rx.clone())
                .await
                .map_err(|e| anyhow::anyhow!("Failed to connect to backend registry: {}", e))?;
            run_worker(config, Arc::new(registry), shutdown_tx, shutdown_rx).await
        }
        RegistryKind::Memory => {
            let registry =
                MemoryRegistry::seeded(&config.registry.pools, &config.registry.certificates);
            info!(
                pools = config.registry.pools.len(),
                certificates = config.registry.certificates.len(),
                "Using in-memory backend registry"
            );
            run_worker(config, Arc::new(registry), shutdown_tx, shutdown_rx).await
        }
    }
}

/// Supervise worker processes until a termination signal arrives
async fn run_master(config: &Config, config_path: &Path) -> anyhow::Result<()> {
    let supervisor = Arc::new(Supervisor::for_current_exe(
        config_path.as_os_str(),
        config.workers,
    )?);

    let runner = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move { supervisor.run().await })
    };

    wait_for_shutdown_signal().await?;

    info!("Stopping all workers...");
    supervisor.shutdown();

    match tokio::time::timeout(Duration::from_secs(15), runner).await {
        Ok(Ok(Ok(()))) => info!("Shutdown complete"),
        Ok(Ok(Err(e))) => error!(error = %e, "Supervisor error"),
        Ok(Err(e)) => error!(error = %e, "Supervisor task failed"),
        Err(_) => warn!("Timed out waiting for workers to stop"),
    }
    Ok(())
}

/// Serve traffic in this process until a termination signal arrives
async fn run_worker<R: BackendRegistry>(
    config: Config,
    registry: Arc<R>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let cache = if config.cache.enabled {
        BoundedCache::new(config.cache.capacity, true)
    } else {
        BoundedCache::disabled()
    };
    info!(
        enabled = config.cache.enabled,
        capacity = config.cache.capacity,
        "Local cache configured"
    );

    let resolver = ResolutionCache::new(registry, cache, config.failover.dead_backend_ttl());
    let reload_listener = resolver.spawn_reload_listener(shutdown_rx.clone());

    let transport = Arc::new(HyperTransport::new(&config.upstream));
    let transport_stats = transport.stats();

    let metrics = if config.metrics.enabled {
        Some(StatsdMetrics::install(&config.metrics, config.metric_session.clone())?)
    } else {
        None
    };
    let telemetry: Arc<dyn TelemetrySink> = Arc::new(Telemetry::new(
        AccessLogger::new(config.log_session.clone()),
        metrics,
    ));

    let controller = Arc::new(ProxyFailoverController::new(
        Arc::clone(&resolver),
        transport,
        telemetry,
        config.failover.clone(),
        SessionDefaults {
            log_session: config.log_session.clone(),
            metric_session: config.metric_session.clone(),
        },
    ));

    let mut servers: Vec<JoinHandle<()>> = Vec::new();

    let http_port = config.server.http_port();
    if http_port > 0 {
        let addr = bind_address(&config.server.bind, http_port)?;
        let server = ProxyServer::new(
            addr,
            Arc::clone(&controller),
            shutdown_rx.clone(),
            config.upstream.max_body_bytes,
        )
        .with_connection_interval(config.metrics.connection_interval());
        servers.push(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "HTTP proxy server error");
            }
        }));
    }

    let https_port = config.server.https_port();
    if config.server.tls_enabled() {
        let default_context = default_tls_context(&config)?;
        let addr = bind_address(&config.server.bind, https_port)?;
        let server = ProxyServer::new(
            addr,
            Arc::clone(&controller),
            shutdown_rx.clone(),
            config.upstream.max_body_bytes,
        )
        .with_connection_interval(config.metrics.connection_interval())
        .with_tls(default_context);
        servers.push(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "HTTPS proxy server error");
            }
        }));
    }

    wait_for_shutdown_signal().await?;

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        for handle in servers {
            let _ = handle.await;
        }
        let _ = reload_listener.await;
    })
    .await;

    info!(
        backend_requests = transport_stats.get_total_requests(),
        backend_failures = transport_stats.get_failures(),
        "Shutdown complete"
    );
    Ok(())
}

fn bind_address(bind: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", bind, port).parse().map_err(|e| {
        error!(bind, port, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address {}:{}: {}", bind, port, e)
    })
}

/// Context served to clients that send no server name
fn default_tls_context(config: &Config) -> anyhow::Result<TlsContext> {
    match config.server.https.as_ref() {
        Some(https) if https.has_tls_files() => {
            let cert = https.cert.as_deref().unwrap_or_default();
            let key = https.key.as_deref().unwrap_or_default();
            info!(cert, key, "Default TLS certificate loaded");
            load_tls_context(cert, key)
        }
        _ => {
            warn!("No default certificate configured, using a self-signed one");
            self_signed_context().map_err(|e| anyhow::anyhow!("{}", e))
        }
    }
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config, mode: &str) {
    info!("========================================");
    info!("  {} v{}", PKG_NAME, VERSION);
    info!("========================================");

    info!(mode, workers = config.workers, "Process mode");

    if config.server.http_port() > 0 {
        info!(bind = %config.server.bind, port = config.server.http_port(), "HTTP listener");
    }
    if config.server.tls_enabled() {
        info!(
            bind = %config.server.bind,
            port = config.server.https_port(),
            "HTTPS listener (SNI)"
        );
    }

    info!(
        kind = ?config.registry.kind,
        host = %config.registry.host,
        port = config.registry.port,
        prefix = %config.registry.prefix,
        channel = %config.registry.channel,
        "Backend registry"
    );

    info!(
        retry_on_error = config.failover.retry_on_error,
        dead_backend_ttl_secs = config.failover.dead_backend_ttl_secs,
        dead_backend_on_500 = config.failover.dead_backend_on_500,
        "Failover"
    );

    info!(
        tcp_timeout_secs = config.upstream.tcp_timeout_secs,
        connect_timeout_secs = config.upstream.connect_timeout_secs,
        http_keep_alive = config.upstream.http_keep_alive,
        max_sockets = config.upstream.max_sockets,
        "Upstream"
    );

    if config.metrics.enabled {
        info!(host = %config.metrics.host, port = config.metrics.port, "statsd metrics enabled");
    }

    info!("========================================");
}
