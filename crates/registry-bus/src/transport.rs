//! Transport adapter: a uniform publish/subscribe/unsubscribe surface over
//! either an in-process broadcast fabric or Redis pub/sub.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::BusError;

/// In-process broadcast capacity per channel. Slow subscribers that fall this
/// far behind miss messages rather than stalling the publisher.
const CHANNEL_CAPACITY: usize = 1024;

/// A handle to a live subscription. Dropping it does not unsubscribe;
/// `TransportAdapter::unsubscribe` must be called explicitly, matching the
/// spec's scope-acquired resource model.
pub struct Subscription {
    pub channel: String,
    receiver: broadcast::Receiver<Vec<u8>>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.receiver.recv().await {
                Ok(bytes) => return Some(bytes),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("subscriber on {} lagged, skipped {} messages", self.channel, skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Uniform transport contract. Two concrete implementations are provided:
/// [`InMemoryTransport`] and [`RedisTransport`]. `connect` runs the runtime
/// probe described in the spec and returns whichever is reachable.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    async fn publish(&self, channel: &str, bytes: Vec<u8>) -> Result<(), BusError>;
    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError>;
    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError>;
    async fn is_healthy(&self) -> bool;
    async fn close(&self) -> Result<(), BusError>;
}

/// Connects to Redis if `redis_url` is reachable; otherwise falls back to
/// in-memory with a loud warning, per the spec's transport-selection probe.
pub async fn connect(redis_url: &str) -> Arc<dyn TransportAdapter> {
    match RedisTransport::connect(redis_url).await {
        Ok(transport) => {
            log::info!("connected to redis transport at {}", redis_url);
            Arc::new(transport)
        }
        Err(e) => {
            log::warn!("redis transport unavailable ({}), falling back to in-memory bus", e);
            Arc::new(InMemoryTransport::new())
        }
    }
}

/// In-process fan-out transport backed by one `tokio::sync::broadcast`
/// channel per topic, created lazily on first publish or subscribe.
pub struct InMemoryTransport {
    topics: RwLock<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }

    async fn get_or_create(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        if let Some(sender) = self.topics.read().await.get(channel) {
            return sender.clone();
        }
        let mut topics = self.topics.write().await;
        topics
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportAdapter for InMemoryTransport {
    async fn publish(&self, channel: &str, bytes: Vec<u8>) -> Result<(), BusError> {
        let sender = self.get_or_create(channel).await;
        // Best-effort fire-and-forget: no subscribers is not an error.
        let _ = sender.send(bytes);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError> {
        let sender = self.get_or_create(channel).await;
        Ok(Subscription {
            channel: channel.to_owned(),
            receiver: sender.subscribe(),
        })
    }

    async fn unsubscribe(&self, _channel: &str) -> Result<(), BusError> {
        // Receivers drop themselves; there is nothing further to release for
        // an in-process broadcast channel.
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<(), BusError> {
        self.topics.write().await.clear();
        Ok(())
    }
}

/// Redis pub/sub transport. Maintains a shared `ConnectionManager` for
/// publishing and one background listener task per subscribed channel, each
/// forwarding into a local broadcast sender so multiple local subscribers can
/// share one Redis subscription.
pub struct RedisTransport {
    client: redis::Client,
    manager: RwLock<Option<redis::aio::ConnectionManager>>,
    local: RwLock<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    listeners: RwLock<HashMap<String, JoinHandle<()>>>,
    healthy: AtomicBool,
}

impl RedisTransport {
    pub async fn connect(redis_url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(redis_url).map_err(|e| BusError::Connection(e.to_string()))?;
        let mut manager = client
            .get_connection_manager()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        redis::cmd("PING")
            .query_async::<String>(&mut manager)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            manager: RwLock::new(Some(manager)),
            local: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            healthy: AtomicBool::new(true),
        })
    }

    async fn get_or_create_local(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        if let Some(sender) = self.local.read().await.get(channel) {
            return sender.clone();
        }
        let mut local = self.local.write().await;
        local
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Spawns the background task that keeps a Redis subscription alive,
    /// reconnecting with exponential backoff on disconnect, and forwards
    /// every message onto the local broadcast sender for `channel`.
    fn spawn_listener(&self, channel: String, sender: broadcast::Sender<Vec<u8>>) -> JoinHandle<()> {
        let client = self.client.clone();
        tokio::spawn(async move {
            let mut backoff_secs = 1u64;
            loop {
                match client.get_async_pubsub().await {
                    Ok(mut pubsub) => {
                        if let Err(e) = pubsub.subscribe(&channel).await {
                            log::warn!("failed to subscribe to {}: {}", channel, e);
                        } else {
                            backoff_secs = 1;
                            let mut stream = pubsub.on_message();
                            use futures::StreamExt;
                            while let Some(message) = stream.next().await {
                                let payload: Vec<u8> = message.get_payload_bytes().to_vec();
                                let _ = sender.send(payload);
                            }
                            log::warn!("redis subscription to {} ended, reconnecting", channel);
                        }
                    }
                    Err(e) => {
                        log::warn!("redis pubsub connect failed for {}: {}", channel, e);
                    }
                }
                tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)).await;
                backoff_secs = (backoff_secs * 2).min(30);
            }
        })
    }
}

#[async_trait]
impl TransportAdapter for RedisTransport {
    async fn publish(&self, channel: &str, bytes: Vec<u8>) -> Result<(), BusError> {
        let mut guard = self.manager.write().await;
        let manager = guard.as_mut().ok_or_else(|| BusError::Unavailable("redis connection closed".into()))?;
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(bytes)
            .query_async::<i64>(manager)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError> {
        let sender = self.get_or_create_local(channel).await;
        let mut listeners = self.listeners.write().await;
        listeners
            .entry(channel.to_owned())
            .or_insert_with(|| self.spawn_listener(channel.to_owned(), sender.clone()));
        Ok(Subscription {
            channel: channel.to_owned(),
            receiver: sender.subscribe(),
        })
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError> {
        if let Some(handle) = self.listeners.write().await.remove(channel) {
            handle.abort();
        }
        self.local.write().await.remove(channel);
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        let mut guard = self.manager.write().await;
        let Some(manager) = guard.as_mut() else {
            return false;
        };
        let healthy = redis::cmd("PING")
            .query_async::<String>(manager)
            .await
            .is_ok();
        self.healthy.store(healthy, Ordering::Relaxed);
        healthy
    }

    async fn close(&self) -> Result<(), BusError> {
        for (_, handle) in self.listeners.write().await.drain() {
            handle.abort();
        }
        self.local.write().await.clear();
        *self.manager.write().await = None;
        Ok(())
    }
}
