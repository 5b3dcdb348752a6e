//! Timeout-based failure detection. A periodic sweep declares any node whose
//! last heartbeat has aged past the timeout window `DEAD`, invoking a
//! caller-supplied listener exactly once per occurrence.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::SystemTime;

use registry_core::NodeIdentifier;
use registry_core::NodeKind;
use registry_membership::BackendRegistry;
use registry_membership::ProxyRegistry;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio::time::Instant;

pub type TimeoutListener = Arc<dyn Fn(NodeIdentifier) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub check_interval: Duration,
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(15),
        }
    }
}

/// Tracks last-seen timestamps per node and runs the periodic eviction
/// sweep. Registration of an unknown node is harmless: the monitor starts
/// tracking it and defers to the membership registries for agreement before
/// acting (spec §4.F ordering note).
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    last_seen: Mutex<HashMap<NodeIdentifier, Instant>>,
    proxies: Arc<ProxyRegistry>,
    backends: Arc<BackendRegistry>,
    listener: RwLock<Option<TimeoutListener>>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig, proxies: Arc<ProxyRegistry>, backends: Arc<BackendRegistry>) -> Arc<Self> {
        Arc::new(Self {
            config,
            last_seen: Mutex::new(HashMap::new()),
            proxies,
            backends,
            listener: RwLock::new(None),
            task: StdMutex::new(None),
        })
    }

    pub async fn set_on_timeout(&self, listener: TimeoutListener) {
        *self.listener.write().await = Some(listener);
    }

    /// Records liveness for `node_id`. `SHUTDOWN` heartbeats are surfaced
    /// separately by the registration handler; this monitor only tracks
    /// timestamps and delegates the DEAD transition to the timeout sweep.
    pub async fn record(&self, node_id: NodeIdentifier, player_count: u32, tps: f32) {
        self.last_seen.lock().await.insert(node_id, Instant::now());
        let at = SystemTime::now();
        match node_id.kind() {
            NodeKind::Proxy => {
                self.proxies.record_heartbeat(node_id, at).await;
            }
            NodeKind::Backend => {
                self.backends.record_heartbeat(node_id, player_count, tps, at).await;
            }
        }
    }

    /// Stops tracking `node_id` without invoking the timeout listener — used
    /// by the graceful-shutdown and forced-removal paths so a node that just
    /// left is not also reported as timed out.
    pub async fn forget(&self, node_id: NodeIdentifier) {
        self.last_seen.lock().await.remove(&node_id);
    }

    pub fn start(self: &Arc<Self>) {
        let monitor = self.clone();
        let mut interval = tokio::time::interval(self.config.check_interval);
        let handle = tokio::spawn(async move {
            loop {
                interval.tick().await;
                monitor.sweep().await;
            }
        });
        *self.task.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
    }

    async fn sweep(&self) {
        let now = Instant::now();
        let timed_out: Vec<NodeIdentifier> = {
            let last_seen = self.last_seen.lock().await;
            last_seen
                .iter()
                .filter(|(_, seen)| now.duration_since(**seen) >= self.config.timeout)
                .map(|(id, _)| *id)
                .collect()
        };
        if timed_out.is_empty() {
            return;
        }
        let listener = self.listener.read().await.clone();
        let mut last_seen = self.last_seen.lock().await;
        for id in timed_out {
            last_seen.remove(&id);
            if let Some(listener) = &listener {
                listener(id);
            } else {
                log::warn!("node {id} timed out but no timeout listener is registered");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry_bus::InMemoryTransport;
    use registry_bus::MessageBus;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;

    fn identifier() -> NodeIdentifier {
        NodeIdentifier::new(
            NodeKind::Backend,
            uuid::Uuid::now_v7(),
            0,
            registry_core::identifier::now_millis(),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn declares_node_dead_after_timeout_window() {
        let bus = Arc::new(MessageBus::new(Arc::new(InMemoryTransport::new())));
        let proxies = Arc::new(ProxyRegistry::new(bus.clone()));
        let backends = Arc::new(BackendRegistry::new(bus));
        let monitor = HeartbeatMonitor::new(
            HeartbeatConfig { check_interval: Duration::from_millis(100), timeout: Duration::from_millis(500) },
            proxies,
            backends,
        );

        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        monitor.set_on_timeout(Arc::new(move |_id| fired_clone.store(true, Ordering::SeqCst))).await;

        let id = identifier();
        monitor.record(id, 0, 20.0).await;
        monitor.start();

        tokio::time::advance(Duration::from_millis(700)).await;
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;

        assert!(fired.load(Ordering::SeqCst));
        monitor.stop();
    }

    #[tokio::test]
    async fn forgetting_a_node_suppresses_its_timeout() {
        let bus = Arc::new(MessageBus::new(Arc::new(InMemoryTransport::new())));
        let proxies = Arc::new(ProxyRegistry::new(bus.clone()));
        let backends = Arc::new(BackendRegistry::new(bus));
        let monitor = HeartbeatMonitor::new(HeartbeatConfig::default(), proxies, backends);
        let id = identifier();
        monitor.record(id, 0, 20.0).await;
        monitor.forget(id).await;
        assert!(monitor.last_seen.lock().await.get(&id).is_none());
    }
}
