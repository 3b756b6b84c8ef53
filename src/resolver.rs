//! Host header to backend resolution
//!
//! [`ResolutionCache`] puts a [`BoundedCache`] in front of the shared
//! registry. Pools with more than one real backend are cached until a
//! quarantine decision (local or announced by another worker) evicts them;
//! single-backend pools are always re-read so a frontend comes back as soon
//! as the registry does. TLS contexts share the same cache under a `tls:`
//! namespace.

use crate::backend::{Backend, Pool, SharedPool};
use crate::cache::BoundedCache;
use crate::domain;
use crate::error::ResolveError;
use crate::registry::{BackendRegistry, DeadNotice, RegistryError, ReloadEvent, BACKEND_KIND};
use crate::tls::{build_tls_context, TlsContext};
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Namespace prefix for TLS entries, keeping them apart from pool keys
pub const TLS_KEY_PREFIX: &str = "tls:";

/// Value held in the local cache
#[derive(Clone)]
pub enum CacheValue {
    Pool(CachedPool),
    Tls(TlsContext),
}

/// A cached pool. A pool read with a non-empty dead-set is only valid until
/// that dead-set could have expired in the registry.
#[derive(Clone)]
pub struct CachedPool {
    pub pool: SharedPool,
    pub dead_until: Option<Instant>,
}

impl CachedPool {
    fn new(pool: Pool, dead_backend_ttl: Duration) -> Self {
        let dead_until = if pool.dead.is_empty() {
            None
        } else {
            Some(Instant::now() + dead_backend_ttl)
        };
        Self {
            pool: Arc::new(pool),
            dead_until,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.dead_until.is_some_and(|until| Instant::now() >= until)
    }
}

/// Strip a `:port` suffix and lowercase.
/// Bracketed IPv6 literals keep their brackets.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let name = if host.starts_with('[') {
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        match host.find(':') {
            Some(index) if index > 0 => &host[..index],
            _ => host,
        }
    };
    name.to_lowercase()
}

/// Cache and registry key for a server name's TLS credential
pub fn tls_key(server_name: &str) -> String {
    format!("{}{}", TLS_KEY_PREFIX, normalize_host(server_name))
}

/// Caching resolution layer over a [`BackendRegistry`]
pub struct ResolutionCache<R> {
    registry: Arc<R>,
    cache: BoundedCache<String, CacheValue>,
    dead_backend_ttl: Duration,
}

impl<R: BackendRegistry> ResolutionCache<R> {
    pub fn new(
        registry: Arc<R>,
        cache: BoundedCache<String, CacheValue>,
        dead_backend_ttl: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            cache,
            dead_backend_ttl,
        })
    }

    pub fn registry(&self) -> &Arc<R> {
        &self.registry
    }

    /// Whether a pool is currently cached under `key`
    pub fn is_cached(&self, key: &str) -> bool {
        matches!(self.cache.get(key), Some(CacheValue::Pool(cached)) if !cached.is_stale())
    }

    /// Cached pool for `key`, dropping it once its dead-set snapshot is stale
    fn cached_pool(&self, key: &str) -> Option<Pool> {
        match self.cache.get(key) {
            Some(CacheValue::Pool(cached)) if cached.is_stale() => {
                debug!(key, "Dead-set snapshot expired, re-reading pool");
                self.cache.delete(key);
                None
            }
            Some(CacheValue::Pool(cached)) => Some(cached.pool.as_ref().clone()),
            _ => None,
        }
    }

    /// Drop cached entries named by registry reload events until shutdown
    pub fn spawn_reload_listener(
        self: &Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut reloads = self.registry.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = reloads.recv() => match event {
                        Ok(event) => this.handle_reload(&event),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Reload events lagged, clearing local cache");
                            this.cache.clear();
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Reload listener stopped");
        })
    }

    /// Evict the key named by a reload event
    pub fn handle_reload(&self, event: &ReloadEvent) {
        debug!(key = %event.key, "Evicting cached pool after reload event");
        self.cache.delete(event.key.as_str());
    }

    /// Resolve the pool for a lookup key.
    ///
    /// Non-explicit lookups walk the wildcard chain and may be served from
    /// the cache; explicit lookups query exactly `host_key` and always hit the
    /// registry. The returned pool is a copy the caller owns.
    pub async fn resolve_pool(&self, host_key: &str, explicit: bool) -> Result<Pool, ResolveError> {
        if !explicit {
            if let Some(pool) = self.cached_pool(host_key) {
                return Ok(pool);
            }
        }

        let keys = if explicit {
            vec![host_key.to_string()]
        } else {
            domain::keys_for(host_key)
        };

        let read = self.registry.read_pool(&keys, BACKEND_KIND).await?;

        let matched = keys
            .iter()
            .zip(read.pools)
            .find(|(_, entries)| entries.len() > 1);

        let Some((matched_key, entries)) = matched else {
            return Ok(Pool::default());
        };

        let pool = Pool::from_raw(entries, read.dead);
        debug!(
            host_key,
            matched_key = %matched_key,
            backends = pool.real_backend_count(),
            dead = pool.dead.len(),
            "Pool read from registry"
        );

        if !explicit && pool.real_backend_count() > 1 {
            self.cache.set(
                host_key.to_string(),
                CacheValue::Pool(CachedPool::new(pool.clone(), self.dead_backend_ttl)),
            );
        }

        Ok(pool)
    }

    /// Pick a backend for a Host header value
    pub async fn select_backend(&self, host_header: Option<&str>) -> Result<Backend, ResolveError> {
        let host = host_header.ok_or(ResolveError::MissingHostHeader)?;
        let frontend = normalize_host(host);

        let pool = self.resolve_pool(&frontend, false).await?;

        match pool.real_backend_count() {
            0 => return Err(ResolveError::NotConfigured(frontend)),
            1 => return Err(ResolveError::ApplicationOffline(frontend)),
            _ => {}
        }

        let chosen = {
            let live = pool.live_candidates();
            let mut rng = rand::thread_rng();
            live.choose(&mut rng)
                .and_then(|(index, record)| {
                    Backend::from_record(*index, record, pool.info(), &frontend)
                })
        };

        match chosen {
            Some(backend) => Ok(backend),
            None => {
                warn!(frontend = %frontend, "Pool has no decodable backends");
                Err(ResolveError::ApplicationOffline(frontend))
            }
        }
    }

    /// Resolve the TLS context for a server name, building and caching it
    /// on first use
    pub async fn resolve_tls_context(&self, server_name: &str) -> Result<TlsContext, ResolveError> {
        let key = tls_key(server_name);

        if let Some(CacheValue::Tls(context)) = self.cache.get(key.as_str()) {
            return Ok(context);
        }

        let credential = self
            .registry
            .fetch_credential(&key)
            .await?
            .ok_or_else(|| ResolveError::BadDomain(normalize_host(server_name)))?;

        let context = build_tls_context(&credential.certificate, &credential.key).map_err(|e| {
            ResolveError::InvalidCredential {
                name: normalize_host(server_name),
                reason: e.to_string(),
            }
        })?;

        debug!(key = %key, "TLS context built");
        self.cache.set(key, CacheValue::Tls(Arc::clone(&context)));
        Ok(context)
    }

    /// Quarantine a backend in the registry and drop the local pool entry
    /// for its frontend. The local eviction happens even when the registry
    /// write fails.
    pub async fn mark_dead_backend(&self, backend: &Backend) -> Result<(), RegistryError> {
        let notice = DeadNotice {
            frontend: backend.frontend.clone(),
            url: backend.url(),
            id: backend.id.clone(),
            index: backend.index,
        };

        let result = self.registry.mark_dead(&notice, self.dead_backend_ttl).await;
        self.cache.delete(backend.frontend.as_str());

        if result.is_ok() {
            info!(
                frontend = %backend.frontend,
                backend_id = %backend.id,
                url = %notice.url,
                ttl_secs = self.dead_backend_ttl.as_secs(),
                "Backend quarantined"
            );
        }
        result
    }
}
