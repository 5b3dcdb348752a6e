//! Orchestrates the join/leave protocol: dedup, allocation, seeded
//! liveness, response publication, announcement, retry, and timeout.

use std::collections::HashMap;
use std::sync::Arc;

use registry_bus::MessageBus;
use registry_bus::MessageEnvelope;
use registry_bus::channels;
use registry_catalog::SlotCatalog;
use registry_core::Heartbeat;
use registry_core::NodeIdentifier;
use registry_core::NodeKind;
use registry_core::NodeStatus;
use registry_core::RegistryError;
use registry_heartbeat::HeartbeatMonitor;
use registry_identity::IdentifierAllocator;
use registry_membership::BackendRegistrationRequest;
use registry_membership::BackendRegistry;
use registry_membership::ProxyRegistrationRequest;
use registry_membership::ProxyRegistry;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::time::Duration;

use crate::types::FamilyAdvertisement;
use crate::types::RegistrationRequest;
use crate::types::RegistrationResponse;
use crate::types::SlotStatusUpdate;

/// Window within which a repeated request for the same `(address, port)`
/// reuses the existing ID instead of allocating a new one.
const DEDUP_WINDOW: Duration = Duration::from_secs(30);
/// Window during which a repeated request for a resolved `tempId` gets its
/// stored response resent rather than silently ignored.
const RETRY_WINDOW: Duration = Duration::from_secs(30);
/// Overall deadline for an in-flight registration future.
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);
/// Cool-down held on a timed-out node's ID before it becomes reissuable.
const COOLDOWN_TTL: Duration = Duration::from_secs(30);

struct CompletedRegistration {
    response: RegistrationResponse,
    completed_at: tokio::time::Instant,
}

pub struct RegistrationHandler {
    bus: Arc<MessageBus>,
    allocator: Arc<IdentifierAllocator>,
    proxies: Arc<ProxyRegistry>,
    backends: Arc<BackendRegistry>,
    heartbeat: Arc<HeartbeatMonitor>,
    catalog: Arc<SlotCatalog>,
    in_flight: Mutex<HashMap<String, broadcast::Sender<RegistrationResponse>>>,
    completed: Mutex<HashMap<String, CompletedRegistration>>,
}

impl RegistrationHandler {
    pub fn new(
        bus: Arc<MessageBus>,
        allocator: Arc<IdentifierAllocator>,
        proxies: Arc<ProxyRegistry>,
        backends: Arc<BackendRegistry>,
        heartbeat: Arc<HeartbeatMonitor>,
        catalog: Arc<SlotCatalog>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            allocator,
            proxies,
            backends,
            heartbeat,
            catalog,
            in_flight: Mutex::new(HashMap::new()),
            completed: Mutex::new(HashMap::new()),
        })
    }

    fn is_proxy(req: &RegistrationRequest) -> bool {
        req.role.eq_ignore_ascii_case("proxy") || req.server_type.eq_ignore_ascii_case("proxy")
    }

    /// Runs the full registration algorithm (spec §4.G steps 1-5) and
    /// returns the response that was published on both channels.
    pub async fn handle_registration(&self, req: RegistrationRequest) -> RegistrationResponse {
        if let Some(stored) = self.check_retry(&req.temp_id).await {
            self.publish_response(&stored).await;
            return stored;
        }

        let (is_leader, receiver) = self.claim_or_attach(&req.temp_id).await;
        if !is_leader {
            return self.await_attached(req.temp_id, receiver).await;
        }

        let response = tokio::time::timeout(REGISTRATION_TIMEOUT, self.run_registration(&req))
            .await
            .unwrap_or_else(|_| RegistrationResponse::failure(&req.temp_id, "registration timed out"));

        self.publish_response(&response).await;
        self.finish(&req.temp_id, response.clone()).await;
        response
    }

    async fn check_retry(&self, temp_id: &str) -> Option<RegistrationResponse> {
        let completed = self.completed.lock().await;
        completed.get(temp_id).and_then(|entry| {
            if entry.completed_at.elapsed() < RETRY_WINDOW {
                Some(entry.response.clone())
            } else {
                None
            }
        })
    }

    async fn claim_or_attach(&self, temp_id: &str) -> (bool, broadcast::Receiver<RegistrationResponse>) {
        let mut in_flight = self.in_flight.lock().await;
        if let Some(sender) = in_flight.get(temp_id) {
            (false, sender.subscribe())
        } else {
            let (sender, receiver) = broadcast::channel(1);
            in_flight.insert(temp_id.to_owned(), sender);
            (true, receiver)
        }
    }

    async fn await_attached(&self, temp_id: String, mut receiver: broadcast::Receiver<RegistrationResponse>) -> RegistrationResponse {
        match tokio::time::timeout(REGISTRATION_TIMEOUT, receiver.recv()).await {
            Ok(Ok(response)) => response,
            _ => RegistrationResponse::failure(temp_id, "attached registration future timed out"),
        }
    }

    async fn finish(&self, temp_id: &str, response: RegistrationResponse) {
        if let Some(sender) = self.in_flight.lock().await.remove(temp_id) {
            let _ = sender.send(response.clone());
        }
        self.completed.lock().await.insert(
            temp_id.to_owned(),
            CompletedRegistration { response, completed_at: tokio::time::Instant::now() },
        );
    }

    async fn run_registration(&self, req: &RegistrationRequest) -> RegistrationResponse {
        let is_proxy = Self::is_proxy(req);

        let reused = if is_proxy {
            self.proxies.was_recently_registered(&req.address, req.port, DEDUP_WINDOW).await
        } else {
            self.backends.was_recently_registered(&req.address, req.port, DEDUP_WINDOW).await
        };
        if let Some(existing_id) = reused {
            return RegistrationResponse::success(&req.temp_id, existing_id);
        }

        let id = if is_proxy {
            self.allocator.allocate_proxy().await
        } else {
            self.allocator.allocate_backend().await
        };
        let id = match id {
            Ok(id) => id,
            Err(e) => return RegistrationResponse::failure(&req.temp_id, e.to_string()),
        };

        let registered = if is_proxy {
            self.proxies
                .register(id, ProxyRegistrationRequest { role: req.role.clone(), address: req.address.clone(), port: req.port })
                .await
        } else {
            self.backends
                .register(
                    id,
                    BackendRegistrationRequest {
                        server_type: req.server_type.clone(),
                        role: req.role.clone(),
                        address: req.address.clone(),
                        port: req.port,
                        max_capacity: req.max_capacity,
                        version: req.version.clone(),
                    },
                )
                .await
        };
        if let Err(e) = registered {
            self.allocator.release(id).await;
            return RegistrationResponse::failure(&req.temp_id, e.to_string());
        }

        // Seed liveness so the newcomer is not evicted before its first real heartbeat.
        self.heartbeat.record(id, 0, 20.0).await;

        let response = RegistrationResponse::success(&req.temp_id, id);

        let _ = self
            .bus
            .broadcast(
                channels::SERVER_ADDED,
                MessageEnvelope::new(
                    "RegistryServerAdded",
                    serde_json::json!({"assignedId": id.to_string(), "role": req.role, "address": req.address}),
                ),
            )
            .await;

        response
    }

    async fn publish_response(&self, response: &RegistrationResponse) {
        let payload = serde_json::to_value(response).unwrap_or(serde_json::Value::Null);
        let _ = self
            .bus
            .broadcast(channels::REGISTRATION_RESPONSE, MessageEnvelope::new("RegistrationResponse", payload.clone()))
            .await;
        let _ = self
            .bus
            .broadcast(
                &channels::server_registration_response(&response.temp_id),
                MessageEnvelope::new("RegistrationResponse", payload),
            )
            .await;
    }

    /// Graceful and forced termination: update status to STOPPING, remove,
    /// broadcast removal, release the ID. Never invoked from a handler
    /// subscribed to the emitted channel (enforced one layer down by
    /// [`registry_bus::is_emit_only`]).
    pub async fn handle_removal(&self, id: NodeIdentifier, graceful: bool, reason: &str) -> Result<(), RegistryError> {
        self.heartbeat.forget(id).await;
        match id.kind() {
            NodeKind::Proxy => {
                let _ = self.proxies.update_status(id, NodeStatus::Stopping).await;
                self.proxies.remove(id).await;
                let channel = if graceful { channels::PROXY_REMOVED } else { channels::PROXY_UNAVAILABLE };
                let _ = self
                    .bus
                    .broadcast(
                        channel,
                        MessageEnvelope::new(
                            "RegistryProxyRemoved",
                            serde_json::json!({"nodeId": id.to_string(), "gracefulShutdown": graceful, "reason": reason}),
                        ),
                    )
                    .await;
            }
            NodeKind::Backend => {
                let _ = self.backends.update_status(id, NodeStatus::Stopping).await;
                self.backends.remove(id).await;
                self.catalog.remove_backend(id).await;
                let _ = self
                    .bus
                    .broadcast(
                        channels::SERVER_REMOVED,
                        MessageEnvelope::new(
                            "RegistryServerRemoved",
                            serde_json::json!({"nodeId": id.to_string(), "gracefulShutdown": graceful, "reason": reason}),
                        ),
                    )
                    .await;
            }
        }

        if graceful {
            self.allocator.release(id).await;
        } else {
            self.allocator.reserve(id, COOLDOWN_TTL).await;
        }
        Ok(())
    }

    /// Mirrors a single slot advertisement into both the backend registry's
    /// own record and the aggregate slot catalog (spec §4.H: mutated only by
    /// advertisement and status-update handlers).
    async fn handle_slot_status(&self, update: SlotStatusUpdate) {
        if self.backends.update_slot(update.node_id, update.slot.clone()).await.is_err() {
            log::warn!("slot status update for unknown backend {}", update.node_id);
            return;
        }
        self.catalog.update_slot(update.node_id, update.slot).await;
    }

    /// Mirrors a backend's family capacity/variant advertisement into both
    /// the backend registry and the aggregate slot catalog.
    async fn handle_family_advertisement(&self, advertisement: FamilyAdvertisement) {
        if self
            .backends
            .update_family_capabilities(advertisement.node_id, advertisement.family_capacities.clone())
            .await
            .is_err()
        {
            log::warn!("family advertisement for unknown backend {}", advertisement.node_id);
            return;
        }
        let _ = self
            .backends
            .update_family_variants(advertisement.node_id, advertisement.family_variants.clone())
            .await;
        self.catalog
            .advertise_family_capacities(advertisement.node_id, advertisement.family_capacities)
            .await;
        self.catalog
            .advertise_family_variants(advertisement.node_id, advertisement.family_variants)
            .await;
    }

    /// Wires the heartbeat monitor's timeout callback to forced removal, and
    /// subscribes to the heartbeat channel to feed liveness (or trigger a
    /// graceful removal on a `SHUTDOWN` heartbeat).
    pub async fn start(self: &Arc<Self>) -> Result<(), RegistryError> {
        let handler_for_timeout = self.clone();
        self.heartbeat
            .set_on_timeout(Arc::new(move |id| {
                let handler = handler_for_timeout.clone();
                tokio::spawn(async move {
                    let _ = handler.handle_removal(id, false, "timeout").await;
                });
            }))
            .await;

        let handler = self.clone();
        self.bus
            .subscribe(channels::SERVER_HEARTBEAT, move |envelope: MessageEnvelope| {
                let handler = handler.clone();
                async move {
                    let Ok(heartbeat) = envelope.decode::<Heartbeat>() else {
                        log::warn!("dropping undecodable heartbeat");
                        return;
                    };
                    if heartbeat.is_graceful_shutdown() {
                        let _ = handler.handle_removal(heartbeat.node_id, true, "shutdown").await;
                    } else {
                        handler.heartbeat.record(heartbeat.node_id, heartbeat.player_count, heartbeat.tps).await;
                    }
                }
            })
            .await?;

        let handler = self.clone();
        self.bus
            .subscribe(channels::REGISTRATION_REQUEST, move |envelope: MessageEnvelope| {
                let handler = handler.clone();
                async move {
                    let Ok(request) = envelope.decode::<RegistrationRequest>() else {
                        log::warn!("dropping undecodable registration request");
                        return;
                    };
                    handler.handle_registration(request).await;
                }
            })
            .await?;

        let handler = self.clone();
        self.bus
            .subscribe(channels::SLOT_STATUS, move |envelope: MessageEnvelope| {
                let handler = handler.clone();
                async move {
                    let Ok(update) = envelope.decode::<SlotStatusUpdate>() else {
                        log::warn!("dropping undecodable slot status update");
                        return;
                    };
                    handler.handle_slot_status(update).await;
                }
            })
            .await?;

        let handler = self.clone();
        self.bus
            .subscribe(channels::SLOT_FAMILY_ADVERTISEMENT, move |envelope: MessageEnvelope| {
                let handler = handler.clone();
                async move {
                    let Ok(advertisement) = envelope.decode::<FamilyAdvertisement>() else {
                        log::warn!("dropping undecodable family advertisement");
                        return;
                    };
                    handler.handle_family_advertisement(advertisement).await;
                }
            })
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry_bus::InMemoryTransport;

    fn handler() -> Arc<RegistrationHandler> {
        let bus = Arc::new(MessageBus::new(Arc::new(InMemoryTransport::new())));
        let allocator = Arc::new(IdentifierAllocator::new());
        let proxies = Arc::new(ProxyRegistry::new(bus.clone()));
        let backends = Arc::new(BackendRegistry::new(bus.clone()));
        let heartbeat = HeartbeatMonitor::new(registry_heartbeat::HeartbeatConfig::default(), proxies.clone(), backends.clone());
        let catalog = Arc::new(SlotCatalog::new());
        RegistrationHandler::new(bus, allocator, proxies, backends, heartbeat, catalog)
    }

    fn request(temp_id: &str) -> RegistrationRequest {
        RegistrationRequest {
            temp_id: temp_id.into(),
            server_type: "lobby".into(),
            role: "lobby".into(),
            address: "10.0.0.1".into(),
            port: 25001,
            max_capacity: 100,
            version: "1.0".into(),
        }
    }

    #[tokio::test]
    async fn basic_join_succeeds() {
        let handler = handler();
        let response = handler.handle_registration(request("temp-b-1")).await;
        assert!(response.success);
        assert!(response.assigned_id.is_some());
    }

    #[tokio::test]
    async fn duplicate_request_reuses_assigned_id() {
        let handler = handler();
        let first = handler.handle_registration(request("temp-b-1")).await;
        let second = handler.handle_registration(request("temp-b-1")).await;
        assert_eq!(first.assigned_id, second.assigned_id);
    }

    #[tokio::test]
    async fn graceful_removal_releases_id_immediately() {
        let handler = handler();
        let response = handler.handle_registration(request("temp-b-1")).await;
        let id = response.assigned_id.unwrap();
        handler.handle_removal(id, true, "shutdown").await.unwrap();
        assert!(handler.backends.get(id).await.is_none());
    }

    #[tokio::test]
    async fn slot_status_update_populates_backend_and_catalog() {
        let handler = handler();
        let response = handler.handle_registration(request("temp-b-1")).await;
        let id = response.assigned_id.unwrap();

        let slot = registry_core::LogicalSlotRecord {
            slot_id: registry_core::SlotId::new("skywars-1"),
            slot_suffix: None,
            family_id: registry_core::FamilyId::new("skywars"),
            variant_id: None,
            status: registry_core::SlotStatus::Available,
            online_players: 0,
            max_players: 16,
            game_type: None,
            metadata: Default::default(),
            last_updated: std::time::SystemTime::now(),
        };
        handler.handle_slot_status(crate::types::SlotStatusUpdate { node_id: id, slot: slot.clone() }).await;

        let record = handler.backends.get(id).await.unwrap();
        assert_eq!(record.slots.len(), 1);
        let catalog_slots = handler.catalog.slots_of_family(&registry_core::FamilyId::new("skywars"), None).await;
        assert_eq!(catalog_slots.len(), 1);
    }

    #[tokio::test]
    async fn family_advertisement_populates_backend_and_catalog() {
        let handler = handler();
        let response = handler.handle_registration(request("temp-b-1")).await;
        let id = response.assigned_id.unwrap();

        let family = registry_core::FamilyId::new("skywars");
        handler
            .handle_family_advertisement(crate::types::FamilyAdvertisement {
                node_id: id,
                family_capacities: HashMap::from([(family.clone(), 10)]),
                family_variants: Default::default(),
            })
            .await;

        let record = handler.backends.get(id).await.unwrap();
        assert_eq!(record.family_capacities.get(&family), Some(&10));
        assert!(handler.catalog.has_family(&family).await);
    }
}
