//! Tenantgate - a host-routed reverse proxy with a shared backend registry
//!
//! Each request's Host header is resolved to a pool of backends stored in a
//! shared registry (Redis in production). Resolved pools are cached locally
//! and invalidated across processes through a notification channel:
//! - Wildcard lookup from the most to the least specific domain
//! - Random backend selection, skipping quarantined backends
//! - Retries on connection failures, with quarantine of the failing backend
//! - Per-hostname TLS certificates selected by SNI
//! - Access log lines and statsd metrics per request

pub mod backend;
pub mod cache;
pub mod config;
pub mod connection;
pub mod controller;
pub mod domain;
pub mod error;
pub mod proxy;
pub mod registry;
pub mod resolver;
pub mod supervisor;
pub mod telemetry;
pub mod tls;
pub mod transport;
