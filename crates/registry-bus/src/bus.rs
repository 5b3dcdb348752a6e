//! Message bus: fan-out of envelopes to registered handlers, with channel
//! bookkeeping on top of a [`TransportAdapter`].

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::envelope::MessageEnvelope;
use crate::error::BusError;
use crate::transport::TransportAdapter;

/// A channel the bus never subscribes to itself, even if something calls
/// `subscribe` on it — the registry must not consume its own side-effect
/// announcements (spec §4.C, I-avoid-feedback).
pub fn is_emit_only(channel: &str) -> bool {
    matches!(
        channel,
        "registry:server:removed" | "registry:proxy:removed" | "registry:proxy:unavailable"
    )
}

/// One live handler registration, tracked so `unsubscribe` can cancel the
/// exact task that was started for it.
struct HandlerTask {
    handle: JoinHandle<()>,
}

/// Thin orchestration layer over a [`TransportAdapter`]: decodes bytes into
/// [`MessageEnvelope`]s, dispatches to closures registered per channel, and
/// tracks the tasks doing so for clean unsubscribe/close.
pub struct MessageBus {
    transport: Arc<dyn TransportAdapter>,
    handlers: Mutex<std::collections::HashMap<String, Vec<HandlerTask>>>,
}

impl MessageBus {
    pub fn new(transport: Arc<dyn TransportAdapter>) -> Self {
        Self {
            transport,
            handlers: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Encode and publish `payload` as an envelope of `type_tag` on
    /// `channel`. Best-effort: failures are logged, not propagated, matching
    /// the spec's fire-and-forget publish semantics.
    pub async fn broadcast(&self, channel: &str, envelope: MessageEnvelope) -> Result<(), BusError> {
        let bytes = envelope.to_bytes()?;
        self.transport.publish(channel, bytes).await
    }

    /// Register `handler` to run for every envelope received on `channel`.
    /// Refuses to subscribe a handler to an emit-only channel, enforcing the
    /// no-self-consumption invariant at the one choke point every subscriber
    /// passes through.
    pub async fn subscribe<F, Fut>(&self, channel: &str, handler: F) -> Result<(), BusError>
    where
        F: Fn(MessageEnvelope) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        if is_emit_only(channel) {
            return Err(BusError::Subscription(format!(
                "channel {channel} is emit-only and cannot be subscribed to"
            )));
        }
        let mut subscription = self.transport.subscribe(channel).await?;
        let channel_owned = channel.to_owned();
        let handle = tokio::spawn(async move {
            while let Some(bytes) = subscription.recv().await {
                match MessageEnvelope::from_bytes(&bytes) {
                    Ok(envelope) => handler(envelope).await,
                    Err(e) => log::warn!("dropping undecodable message on {}: {}", channel_owned, e),
                }
            }
        });
        self.handlers
            .lock()
            .await
            .entry(channel.to_owned())
            .or_default()
            .push(HandlerTask { handle });
        Ok(())
    }

    /// Cancel every handler task registered on `channel` and unsubscribe
    /// from the underlying transport.
    pub async fn unsubscribe(&self, channel: &str) -> Result<(), BusError> {
        if let Some(tasks) = self.handlers.lock().await.remove(channel) {
            for task in tasks {
                task.handle.abort();
            }
        }
        self.transport.unsubscribe(channel).await
    }

    pub async fn is_healthy(&self) -> bool {
        self.transport.is_healthy().await
    }

    pub async fn close(&self) -> Result<(), BusError> {
        let mut handlers = self.handlers.lock().await;
        for (_, tasks) in handlers.drain() {
            for task in tasks {
                task.handle.abort();
            }
        }
        self.transport.close().await
    }
}
