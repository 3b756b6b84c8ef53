use super::{
    BackendRegistry, Credential, DeadNotice, PoolRead, RegistryError, RegistryResult, ReloadEvent,
    BACKEND_KIND, RELOAD_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Default)]
struct MemoryState {
    /// `<kind>:<key>` -> raw entries
    pools: HashMap<String, Vec<String>>,
    /// frontend -> (ids, expiry)
    dead: HashMap<String, (HashSet<String>, Instant)>,
    credentials: HashMap<String, Credential>,
    notices: Vec<DeadNotice>,
}

/// In-process registry with the same semantics as the Redis one.
///
/// Used for single-process deployments seeded from the configuration file,
/// and as the registry in tests. It counts round trips so callers can tell
/// cache hits from registry reads.
pub struct MemoryRegistry {
    state: Mutex<MemoryState>,
    reload_tx: broadcast::Sender<ReloadEvent>,
    pool_reads: AtomicUsize,
    credential_fetches: AtomicUsize,
    unavailable: AtomicBool,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        let (reload_tx, _) = broadcast::channel(RELOAD_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(MemoryState::default()),
            reload_tx,
            pool_reads: AtomicUsize::new(0),
            credential_fetches: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Build a registry from configuration seeds
    pub fn seeded(
        pools: &HashMap<String, Vec<String>>,
        credentials: &HashMap<String, Credential>,
    ) -> Self {
        let registry = Self::new();
        for (key, entries) in pools {
            registry.set_pool(key, entries.clone());
        }
        for (server_name, credential) in credentials {
            registry.set_credential(&crate::resolver::tls_key(server_name), credential.clone());
        }
        registry
    }

    /// Replace the backend pool stored under a lookup key
    pub fn set_pool(&self, key: &str, entries: Vec<String>) {
        self.state
            .lock()
            .pools
            .insert(format!("{}:{}", BACKEND_KIND, key), entries);
    }

    /// Append one raw entry to a backend pool
    pub fn push_entry(&self, key: &str, entry: impl Into<String>) {
        self.state
            .lock()
            .pools
            .entry(format!("{}:{}", BACKEND_KIND, key))
            .or_default()
            .push(entry.into());
    }

    pub fn set_credential(&self, key: &str, credential: Credential) {
        self.state
            .lock()
            .credentials
            .insert(key.to_string(), credential);
    }

    /// Simulate an outage: every operation fails until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of `read_pool` round trips served
    pub fn pool_reads(&self) -> usize {
        self.pool_reads.load(Ordering::SeqCst)
    }

    /// Number of `fetch_credential` round trips served
    pub fn credential_fetches(&self) -> usize {
        self.credential_fetches.load(Ordering::SeqCst)
    }

    /// Every notice published so far, oldest first
    pub fn notices(&self) -> Vec<DeadNotice> {
        self.state.lock().notices.clone()
    }

    /// Current, unexpired dead-set of a frontend
    pub fn dead_ids(&self, frontend: &str) -> HashSet<String> {
        let mut state = self.state.lock();
        live_dead_set(&mut state, frontend)
    }

    fn check_available(&self) -> RegistryResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable(
                "memory registry switched off".to_string(),
            ));
        }
        Ok(())
    }
}

fn live_dead_set(state: &mut MemoryState, frontend: &str) -> HashSet<String> {
    match state.dead.get(frontend) {
        Some((_, expires)) if *expires <= Instant::now() => {
            state.dead.remove(frontend);
            HashSet::new()
        }
        Some((ids, _)) => ids.clone(),
        None => HashSet::new(),
    }
}

#[async_trait]
impl BackendRegistry for MemoryRegistry {
    async fn read_pool(&self, keys: &[String], kind: &str) -> RegistryResult<PoolRead> {
        self.check_available()?;
        self.pool_reads.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        let pools = keys
            .iter()
            .map(|key| {
                state
                    .pools
                    .get(&format!("{}:{}", kind, key))
                    .cloned()
                    .unwrap_or_default()
            })
            .collect();
        let dead = keys
            .first()
            .map(|first| live_dead_set(&mut state, first))
            .unwrap_or_default();

        Ok(PoolRead { pools, dead })
    }

    async fn mark_dead(&self, notice: &DeadNotice, ttl: Duration) -> RegistryResult<()> {
        self.check_available()?;
        {
            let mut state = self.state.lock();
            let mut ids = live_dead_set(&mut state, &notice.frontend);
            ids.insert(notice.id.clone());
            state
                .dead
                .insert(notice.frontend.clone(), (ids, Instant::now() + ttl));
            state.notices.push(notice.clone());
        }

        debug!(notice = %notice, "Recorded dead backend notice");
        let _ = self.reload_tx.send(ReloadEvent {
            key: notice.frontend.clone(),
        });
        Ok(())
    }

    async fn fetch_credential(&self, key: &str) -> RegistryResult<Option<Credential>> {
        self.check_available()?;
        self.credential_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().credentials.get(key).cloned())
    }

    fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.reload_tx.subscribe()
    }
}
