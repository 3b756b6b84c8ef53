use super::{
    BackendRegistry, Credential, DeadNotice, PoolRead, RegistryError, RegistryResult, ReloadEvent,
    RELOAD_CHANNEL_CAPACITY,
};
use crate::config::RegistryConfig;
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Delay before re-subscribing after the notification feed drops
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Registry backed by a Redis server.
///
/// Layout:
/// - `<prefix><kind>:<key>` list of JSON pool entries
/// - `<prefix>dead:<frontend>` set of quarantined ids, with a TTL
/// - `<prefix><sni key>` hash with `certificate` and `key` fields
/// - the configured channel carries `frontend;url;id;index` notices
pub struct RedisRegistry {
    client: redis::Client,
    conn: MultiplexedConnection,
    prefix: String,
    channel: String,
    reload_tx: broadcast::Sender<ReloadEvent>,
}

impl RedisRegistry {
    /// Connect to Redis and start listening for dead notices. The listener
    /// runs until `shutdown_rx` flips to `true`.
    pub async fn connect(
        config: &RegistryConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> RegistryResult<Self> {
        let client = redis::Client::open(config.connection_info())?;
        let conn = client.get_multiplexed_async_connection().await?;
        let (reload_tx, _) = broadcast::channel(RELOAD_CHANNEL_CAPACITY);

        info!(
            host = %config.host,
            port = config.port,
            db = config.db,
            prefix = %config.prefix,
            "Connected to backend registry"
        );

        let registry = Self {
            client,
            conn,
            prefix: config.prefix.clone(),
            channel: config.channel.clone(),
            reload_tx,
        };

        let client = registry.client.clone();
        let channel = registry.channel.clone();
        let reload_tx = registry.reload_tx.clone();
        tokio::spawn(async move {
            notice_loop(client, channel, reload_tx, shutdown_rx).await;
        });

        Ok(registry)
    }

    fn pool_key(&self, kind: &str, key: &str) -> String {
        format!("{}{}:{}", self.prefix, kind, key)
    }

    fn dead_key(&self, frontend: &str) -> String {
        format!("{}dead:{}", self.prefix, frontend)
    }
}

#[async_trait]
impl BackendRegistry for RedisRegistry {
    async fn read_pool(&self, keys: &[String], kind: &str) -> RegistryResult<PoolRead> {
        let Some(first) = keys.first() else {
            return Ok(PoolRead::default());
        };

        let mut pipe = redis::pipe();
        pipe.atomic();
        for key in keys {
            pipe.lrange(self.pool_key(kind, key), 0, -1);
        }
        pipe.smembers(self.dead_key(first));

        let mut conn = self.conn.clone();
        let mut rows: Vec<Vec<String>> = pipe.query_async(&mut conn).await?;

        if rows.len() != keys.len() + 1 {
            return Err(RegistryError::Unavailable(format!(
                "expected {} replies, got {}",
                keys.len() + 1,
                rows.len()
            )));
        }

        let dead: HashSet<String> = rows.pop().unwrap_or_default().into_iter().collect();
        Ok(PoolRead { pools: rows, dead })
    }

    async fn mark_dead(&self, notice: &DeadNotice, ttl: Duration) -> RegistryResult<()> {
        let dead_key = self.dead_key(&notice.frontend);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .sadd(&dead_key, &notice.id)
            .ignore()
            .cmd("EXPIRE")
            .arg(&dead_key)
            .arg(ttl.as_secs().max(1))
            .ignore()
            .publish(&self.channel, notice.to_string())
            .ignore();

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;

        debug!(notice = %notice, ttl_secs = ttl.as_secs(), "Published dead backend notice");
        Ok(())
    }

    async fn fetch_credential(&self, key: &str) -> RegistryResult<Option<Credential>> {
        let mut conn = self.conn.clone();
        let mut fields: HashMap<String, String> =
            conn.hgetall(format!("{}{}", self.prefix, key)).await?;

        match (fields.remove("certificate"), fields.remove("key")) {
            (Some(certificate), Some(key)) => Ok(Some(Credential { certificate, key })),
            _ => Ok(None),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.reload_tx.subscribe()
    }
}

/// Forward every notice seen on the channel to local subscribers,
/// re-subscribing whenever the feed drops
async fn notice_loop(
    client: redis::Client,
    channel: String,
    reload_tx: broadcast::Sender<ReloadEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listen(&client, &channel, &reload_tx) => {
                if let Err(e) = result {
                    warn!(channel = %channel, error = %e, "Dead notice subscription lost");
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!("Dead notice listener stopping");
                    return;
                }
            }
        }

        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
    }
}

async fn listen(
    client: &redis::Client,
    channel: &str,
    reload_tx: &broadcast::Sender<ReloadEvent>,
) -> RegistryResult<()> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    debug!(channel, "Subscribed to dead backend notices");

    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Unreadable dead notice payload");
                continue;
            }
        };

        match payload.parse::<DeadNotice>() {
            Ok(notice) => {
                debug!(
                    frontend = %notice.frontend,
                    backend_id = %notice.id,
                    "Received dead notice"
                );
                // No receivers just means nothing is cached yet
                let _ = reload_tx.send(ReloadEvent {
                    key: notice.frontend,
                });
            }
            Err(e) => warn!(error = %e, "Ignoring dead notice"),
        }
    }

    Err(RegistryError::Unavailable(
        "notification stream closed".to_string(),
    ))
}
