//! End-to-end tests: real origins on localhost behind a running proxy

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use tenantgate::config::FailoverConfig;
use tenantgate::registry::MemoryRegistry;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn failover(retry_on_error: u32) -> FailoverConfig {
    FailoverConfig {
        retry_on_error,
        ..FailoverConfig::default()
    }
}

fn registry_with(key: &str, entries: Vec<String>) -> Arc<MemoryRegistry> {
    let registry = Arc::new(MemoryRegistry::new());
    registry.set_pool(key, entries);
    registry
}

#[tokio::test]
async fn test_proxies_to_backend_with_forwarding_headers() {
    let a = spawn_origin("origin-a", 200, vec![]).await;
    let b = spawn_origin("origin-b", 200, vec![]).await;
    let registry = registry_with(
        "shop.example.com",
        vec![INFO.to_string(), entry(1, a.port), entry(2, b.port)],
    );
    let proxy = start_proxy(registry, failover(3)).await;

    let response = http_get_with_host(proxy.port, "/cart", "shop.example.com", &[]).await;

    assert_eq!(status_of(&response), 200);
    assert!(body_of(&response).starts_with("origin-"));
    assert_eq!(header_of(&response, "x-seen-forwarded-for"), Some("127.0.0.1"));
    assert_eq!(
        header_of(&response, "x-seen-forwarded-port"),
        Some(proxy.port.to_string().as_str())
    );
    assert_eq!(header_of(&response, "x-seen-host"), Some("shop.example.com"));
    assert!(header_of(&response, "x-seen-request-id").is_some());
    assert_eq!(a.hits() + b.hits(), 1);

    let summaries = proxy.wait_for_summaries(1).await;
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].status, 200);
    assert_eq!(summaries[0].frontend, "shop.example.com");
    assert_eq!(summaries[0].path, "/cart");
    assert_eq!(summaries[0].log_session.as_deref(), Some("log-1"));
}

#[tokio::test]
async fn test_wildcard_pool_serves_subdomains() {
    let a = spawn_origin("origin-a", 200, vec![]).await;
    let b = spawn_origin("origin-b", 200, vec![]).await;
    let registry = registry_with(
        "*.example.com",
        vec![INFO.to_string(), entry(1, a.port), entry(2, b.port)],
    );
    let proxy = start_proxy(registry, failover(3)).await;

    let response = http_get_with_host(proxy.port, "/", "blog.example.com", &[]).await;
    assert_eq!(status_of(&response), 200);
}

#[tokio::test]
async fn test_unknown_host_is_not_configured() {
    let proxy = start_proxy(Arc::new(MemoryRegistry::new()), failover(3)).await;

    let response = http_get_with_host(proxy.port, "/", "nobody.example.org", &[]).await;

    assert_eq!(status_of(&response), 400);
    assert_eq!(header_of(&response, "x-proxy-error"), Some("NOT_CONFIGURED"));
    assert_eq!(header_of(&response, "cache-control"), Some("no-cache"));
    assert_eq!(body_of(&response), "No Application Configured");
}

#[tokio::test]
async fn test_missing_host_header() {
    let proxy = start_proxy(Arc::new(MemoryRegistry::new()), failover(3)).await;

    let response = send_raw(proxy.port, "GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await;

    assert_eq!(status_of(&response), 400);
    assert_eq!(body_of(&response), "No Host header");
}

#[tokio::test]
async fn test_single_backend_is_offline_until_second_is_added() {
    let a = spawn_origin("origin-a", 200, vec![]).await;
    let b = spawn_origin("origin-b", 200, vec![]).await;
    let registry = registry_with("shop.example.com", vec![INFO.to_string(), entry(1, a.port)]);
    let proxy = start_proxy(Arc::clone(&registry), failover(3)).await;

    let response = http_get_with_host(proxy.port, "/", "shop.example.com", &[]).await;
    assert_eq!(status_of(&response), 502);
    assert_eq!(body_of(&response), "Application is offline");
    assert!(!proxy.resolver.is_cached("shop.example.com"));

    // Not cached, so the next request sees the new backend immediately
    registry.push_entry("shop.example.com", entry(2, b.port));

    let response = http_get_with_host(proxy.port, "/", "shop.example.com", &[]).await;
    assert_eq!(status_of(&response), 200);
    assert!(proxy.resolver.is_cached("shop.example.com"));
    assert_eq!(a.hits() + b.hits(), 1);
}

#[tokio::test]
async fn test_sustained_refusal_exhausts_retries() {
    let dead_a = closed_port().await;
    let dead_b = closed_port().await;
    let registry = registry_with(
        "shop.example.com",
        vec![INFO.to_string(), entry(1, dead_a), entry(2, dead_b)],
    );
    let proxy = start_proxy(Arc::clone(&registry), failover(2)).await;

    let response = http_get_with_host(proxy.port, "/", "shop.example.com", &[]).await;

    assert_eq!(status_of(&response), 502);
    assert_eq!(header_of(&response, "x-proxy-error"), Some("MAX_RETRIES_EXCEEDED"));
    assert_eq!(body_of(&response), "Reached max retries limit");

    let summaries = proxy.wait_for_summaries(1).await;
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].retries, 2);

    // The first real backend is never quarantined
    assert!(registry.notices().iter().all(|notice| notice.index == 2));
}

#[tokio::test]
async fn test_retry_disabled_fails_on_first_error() {
    let dead_a = closed_port().await;
    let dead_b = closed_port().await;
    let registry = registry_with(
        "shop.example.com",
        vec![INFO.to_string(), entry(1, dead_a), entry(2, dead_b)],
    );
    let proxy = start_proxy(registry, failover(0)).await;

    let response = http_get_with_host(proxy.port, "/", "shop.example.com", &[]).await;

    assert_eq!(status_of(&response), 502);
    assert_eq!(header_of(&response, "x-proxy-error"), Some("RETRY_DISABLED"));
    assert_eq!(body_of(&response), "Retry on error is disabled");
}

#[tokio::test]
async fn test_fails_over_from_dead_backend() {
    let live = spawn_origin("live", 200, vec![]).await;
    let dead = closed_port().await;
    let registry = registry_with(
        "shop.example.com",
        vec![INFO.to_string(), entry(1, live.port), entry(2, dead)],
    );
    let proxy = start_proxy(Arc::clone(&registry), failover(3)).await;

    for _ in 0..6 {
        let response = http_get_with_host(proxy.port, "/", "shop.example.com", &[]).await;
        assert_eq!(status_of(&response), 200);
        assert_eq!(body_of(&response), "live");
    }

    for notice in registry.notices() {
        assert_eq!(notice.index, 2);
        assert_eq!(notice.frontend, "shop.example.com");
    }
}

#[tokio::test]
async fn test_error_status_quarantines_backend() {
    let first = spawn_origin("first", 500, vec![]).await;
    let second = spawn_origin("second", 500, vec![]).await;
    let registry = registry_with(
        "shop.example.com",
        vec![INFO.to_string(), entry(1, first.port), entry(2, second.port)],
    );
    let proxy = start_proxy(Arc::clone(&registry), failover(3)).await;

    for _ in 0..20 {
        let response = http_get_with_host(proxy.port, "/", "shop.example.com", &[]).await;
        // Error responses are passed through, not retried
        assert_eq!(status_of(&response), 500);
        if second.hits() > 0 {
            break;
        }
    }

    assert!(second.hits() > 0);
    let notices = registry.notices();
    assert!(!notices.is_empty());
    assert!(notices.iter().all(|notice| notice.index == 2));
}

#[tokio::test]
async fn test_500_ignored_when_not_treated_as_dead() {
    let first = spawn_origin("first", 500, vec![]).await;
    let second = spawn_origin("second", 500, vec![]).await;
    let registry = registry_with(
        "shop.example.com",
        vec![INFO.to_string(), entry(1, first.port), entry(2, second.port)],
    );
    let config = FailoverConfig {
        dead_backend_on_500: false,
        ..FailoverConfig::default()
    };
    let proxy = start_proxy(Arc::clone(&registry), config).await;

    for _ in 0..8 {
        let response = http_get_with_host(proxy.port, "/", "shop.example.com", &[]).await;
        assert_eq!(status_of(&response), 500);
    }
    assert!(registry.notices().is_empty());
}

#[tokio::test]
async fn test_maintenance_503_does_not_quarantine() {
    let first = spawn_origin("first", 503, vec![("retry-after", "120")]).await;
    let second = spawn_origin("second", 503, vec![("retry-after", "120")]).await;
    let registry = registry_with(
        "shop.example.com",
        vec![INFO.to_string(), entry(1, first.port), entry(2, second.port)],
    );
    let proxy = start_proxy(Arc::clone(&registry), failover(3)).await;

    for _ in 0..8 {
        let response = http_get_with_host(proxy.port, "/", "shop.example.com", &[]).await;
        assert_eq!(status_of(&response), 503);
        assert_eq!(header_of(&response, "retry-after"), Some("120"));
    }
    assert!(registry.notices().is_empty());
}

#[tokio::test]
async fn test_debug_headers() {
    let a = spawn_origin("origin-a", 200, vec![]).await;
    let b = spawn_origin("origin-b", 200, vec![]).await;
    let registry = registry_with(
        "shop.example.com",
        vec![INFO.to_string(), entry(1, a.port), entry(2, b.port)],
    );
    let proxy = start_proxy(registry, failover(3)).await;

    let response =
        http_get_with_host(proxy.port, "/", "shop.example.com", &[("x-debug", "1")]).await;

    assert_eq!(status_of(&response), 200);
    assert_eq!(header_of(&response, "x-debug-frontend-key"), Some("shop.example.com"));
    assert_eq!(header_of(&response, "x-debug-vhost"), Some("shop"));
    let url = header_of(&response, "x-debug-backend-url").unwrap();
    let candidates = [
        format!("http://127.0.0.1:{}", a.port),
        format!("http://127.0.0.1:{}", b.port),
    ];
    assert!(candidates.iter().any(|c| c == url));
    assert!(header_of(&response, "x-debug-time-total").is_some());
}

#[tokio::test]
async fn test_websocket_upgrade_is_bridged() {
    let echo_a = spawn_echo_upgrade_origin().await;
    let echo_b = spawn_echo_upgrade_origin().await;
    let registry = registry_with(
        "chat.example.com",
        vec![INFO.to_string(), entry(1, echo_a), entry(2, echo_b)],
    );
    let proxy = start_proxy(registry, failover(3)).await;

    let mut stream = TcpStream::connect(("127.0.0.1", proxy.port)).await.unwrap();
    stream
        .write_all(
            b"GET /socket HTTP/1.1\r\nHost: chat.example.com\r\n\
              Connection: Upgrade\r\nUpgrade: websocket\r\n\
              Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        )
        .await
        .unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    assert_eq!(status_of(&head), 101);

    stream.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"ping");
}

#[tokio::test]
async fn test_websocket_upgrade_for_unknown_host() {
    let proxy = start_proxy(Arc::new(MemoryRegistry::new()), failover(3)).await;

    let response = send_raw(
        proxy.port,
        "GET /socket HTTP/1.1\r\nHost: nobody.example.org\r\n\
         Connection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
    )
    .await;

    assert_eq!(status_of(&response), 400);
    assert_eq!(body_of(&response), "No Application Configured");
}

#[tokio::test]
async fn test_upgrade_backend_hangup_hides_error_detail() {
    let a = spawn_hangup_origin().await;
    let b = spawn_hangup_origin().await;
    let registry = registry_with(
        "chat.example.com",
        vec![INFO.to_string(), entry(1, a), entry(2, b)],
    );
    let proxy = start_proxy(registry, failover(3)).await;

    let response = send_raw(
        proxy.port,
        "GET /socket HTTP/1.1\r\nHost: chat.example.com\r\n\
         Connection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
    )
    .await;

    assert_eq!(status_of(&response), 502);
    assert_eq!(header_of(&response, "x-proxy-error"), Some("BACKEND_ERROR"));
    assert_eq!(body_of(&response), "Backend reported an error");
}
