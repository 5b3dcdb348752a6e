//! Coordinates multi-target graceful shutdown countdowns: a scheduled
//! `ShutdownStarting`/`ShutdownExecute` pair per intent, with optional
//! cancellation and an evacuation wait unless `force` is set.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use registry_bus::MessageBus;
use registry_bus::MessageEnvelope;
use registry_bus::channels;
use registry_core::NodeIdentifier;
use registry_core::NodeKind;
use registry_core::NodeStatus;
use registry_core::RegistryError;
use registry_membership::BackendRegistry;
use registry_membership::ProxyRegistry;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownIntentState {
    Scheduled,
    Executing,
    Cancelled,
    Done,
}

struct IntentHandle {
    targets: Vec<NodeIdentifier>,
    reason: String,
    force: bool,
    state: Arc<RwLock<ShutdownIntentState>>,
    remaining_seconds: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

#[derive(Debug, Clone)]
pub struct ShutdownIntentSnapshot {
    pub intent_id: String,
    pub targets: Vec<NodeIdentifier>,
    pub reason: String,
    pub force: bool,
    pub state: ShutdownIntentState,
    pub remaining_seconds: u64,
}

/// Evacuation is considered complete for a backend once its player count
/// drops to zero, and for a proxy once its record is gone (it has already
/// drained and left, or timed out — either way nobody is routed through it).
async fn evacuation_complete(id: NodeIdentifier, proxies: &ProxyRegistry, backends: &BackendRegistry) -> bool {
    match id.kind() {
        NodeKind::Proxy => proxies.get(id).await.is_none(),
        NodeKind::Backend => backends.get(id).await.map(|r| r.player_count == 0).unwrap_or(true),
    }
}

pub struct ShutdownManager {
    bus: Arc<MessageBus>,
    proxies: Arc<ProxyRegistry>,
    backends: Arc<BackendRegistry>,
    intents: Mutex<HashMap<String, IntentHandle>>,
}

impl ShutdownManager {
    pub fn new(bus: Arc<MessageBus>, proxies: Arc<ProxyRegistry>, backends: Arc<BackendRegistry>) -> Arc<Self> {
        Arc::new(Self { bus, proxies, backends, intents: Mutex::new(HashMap::new()) })
    }

    pub async fn create_intent(
        self: &Arc<Self>,
        targets: Vec<NodeIdentifier>,
        countdown_seconds: u64,
        reason: String,
        force: bool,
    ) -> String {
        let intent_id = uuid::Uuid::now_v7().to_string();
        let state = Arc::new(RwLock::new(ShutdownIntentState::Scheduled));
        let remaining = Arc::new(AtomicU64::new(countdown_seconds));

        if !force {
            for id in &targets {
                match id.kind() {
                    NodeKind::Proxy => {
                        let _ = self.proxies.update_status(*id, NodeStatus::Evacuating).await;
                    }
                    NodeKind::Backend => {
                        let _ = self.backends.update_status(*id, NodeStatus::Evacuating).await;
                    }
                }
            }
        }

        let _ = self
            .bus
            .broadcast(
                channels::SHUTDOWN_STARTING,
                MessageEnvelope::new(
                    "ShutdownStarting",
                    serde_json::json!({
                        "intentId": intent_id,
                        "targets": targets.iter().map(|t| t.to_string()).collect::<Vec<_>>(),
                        "countdownSeconds": countdown_seconds,
                        "reason": reason,
                        "force": force,
                    }),
                ),
            )
            .await;

        let manager = self.clone();
        let task_intent_id = intent_id.clone();
        let task_state = state.clone();
        let task_remaining = remaining.clone();
        let task_targets = targets.clone();
        let task_reason = reason.clone();
        let task = tokio::spawn(async move {
            manager.run_intent(task_intent_id, task_targets, task_reason, force, task_state, task_remaining).await;
        });

        self.intents.lock().await.insert(
            intent_id.clone(),
            IntentHandle { targets, reason, force, state, remaining_seconds: remaining, task },
        );

        intent_id
    }

    async fn run_intent(
        &self,
        intent_id: String,
        targets: Vec<NodeIdentifier>,
        reason: String,
        force: bool,
        state: Arc<RwLock<ShutdownIntentState>>,
        remaining: Arc<AtomicU64>,
    ) {
        while remaining.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            remaining.fetch_sub(1, Ordering::SeqCst);
        }

        *state.write().await = ShutdownIntentState::Executing;

        if !force {
            loop {
                let mut all_clear = true;
                for id in &targets {
                    if !evacuation_complete(*id, &self.proxies, &self.backends).await {
                        all_clear = false;
                        break;
                    }
                }
                if all_clear {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        let _ = self
            .bus
            .broadcast(
                channels::SHUTDOWN_EXECUTE,
                MessageEnvelope::new(
                    "ShutdownExecute",
                    serde_json::json!({
                        "intentId": intent_id,
                        "targets": targets.iter().map(|t| t.to_string()).collect::<Vec<_>>(),
                        "reason": reason,
                    }),
                ),
            )
            .await;

        *state.write().await = ShutdownIntentState::Done;
    }

    pub async fn cancel_intent(&self, intent_id: &str, requester: &str) -> Result<(), RegistryError> {
        let handle = self
            .intents
            .lock()
            .await
            .remove(intent_id)
            .ok_or_else(|| RegistryError::OperatorError(format!("no such shutdown intent {intent_id}")))?;

        handle.task.abort();
        *handle.state.write().await = ShutdownIntentState::Cancelled;

        let _ = self
            .bus
            .broadcast(
                channels::SHUTDOWN_CANCELLED,
                MessageEnvelope::new(
                    "ShutdownCancelled",
                    serde_json::json!({"intentId": intent_id, "requester": requester}),
                ),
            )
            .await;
        Ok(())
    }

    pub async fn get(&self, intent_id: &str) -> Option<ShutdownIntentSnapshot> {
        let intents = self.intents.lock().await;
        let handle = intents.get(intent_id)?;
        Some(ShutdownIntentSnapshot {
            intent_id: intent_id.to_owned(),
            targets: handle.targets.clone(),
            reason: handle.reason.clone(),
            force: handle.force,
            state: *handle.state.read().await,
            remaining_seconds: handle.remaining_seconds.load(Ordering::SeqCst),
        })
    }

    pub async fn list(&self) -> Vec<ShutdownIntentSnapshot> {
        let intents = self.intents.lock().await;
        let mut out = Vec::with_capacity(intents.len());
        for (id, handle) in intents.iter() {
            out.push(ShutdownIntentSnapshot {
                intent_id: id.clone(),
                targets: handle.targets.clone(),
                reason: handle.reason.clone(),
                force: handle.force,
                state: *handle.state.read().await,
                remaining_seconds: handle.remaining_seconds.load(Ordering::SeqCst),
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry_bus::InMemoryTransport;

    fn identifier(kind: NodeKind) -> NodeIdentifier {
        NodeIdentifier::new(kind, uuid::Uuid::now_v7(), 0, registry_core::identifier::now_millis()).unwrap()
    }

    fn manager() -> Arc<ShutdownManager> {
        let bus = Arc::new(MessageBus::new(Arc::new(InMemoryTransport::new())));
        let proxies = Arc::new(ProxyRegistry::new(bus.clone()));
        let backends = Arc::new(BackendRegistry::new(bus.clone()));
        ShutdownManager::new(bus, proxies, backends)
    }

    #[tokio::test(start_paused = true)]
    async fn forced_intent_executes_without_waiting_for_evacuation() {
        let manager = manager();
        let target = identifier(NodeKind::Backend);
        let intent_id = manager.create_intent(vec![target], 2, "maintenance".into(), true).await;

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }

        let snapshot = manager.get(&intent_id).await.unwrap();
        assert_eq!(snapshot.state, ShutdownIntentState::Done);
    }

    #[tokio::test]
    async fn cancel_marks_intent_cancelled_and_stops_the_task() {
        let manager = manager();
        let target = identifier(NodeKind::Proxy);
        let intent_id = manager.create_intent(vec![target], 30, "maintenance".into(), false).await;
        manager.cancel_intent(&intent_id, "operator").await.unwrap();
        assert!(manager.get(&intent_id).await.is_none());
    }
}
