//! Player routing: selects a slot via provisioning, then publishes a
//! directed route intent to the owning proxy. Per-player route intents are
//! serialized — an in-flight route suppresses the next until acknowledged.

use std::collections::HashSet;
use std::sync::Arc;

use registry_bus::MessageBus;
use registry_bus::MessageEnvelope;
use registry_bus::channels;
use registry_core::FamilyId;
use registry_core::NodeIdentifier;
use registry_core::RegistryError;
use registry_provisioning::ProvisionRequest;
use registry_provisioning::ProvisionResult;
use registry_provisioning::ProvisioningService;
use tokio::sync::Mutex;

#[derive(Debug, Clone, serde::Serialize)]
pub struct RouteIntent {
    pub player_id: String,
    pub family_id: FamilyId,
    pub server_id: NodeIdentifier,
    pub slot_id: String,
}

pub struct RoutingService {
    provisioning: Arc<ProvisioningService>,
    bus: Arc<MessageBus>,
    in_flight: Mutex<HashSet<String>>,
}

impl RoutingService {
    pub fn new(provisioning: Arc<ProvisioningService>, bus: Arc<MessageBus>) -> Self {
        Self { provisioning, bus, in_flight: Mutex::new(HashSet::new()) }
    }

    pub async fn route(&self, player_id: &str, target_family: FamilyId, proxy_id: NodeIdentifier) -> Result<RouteIntent, RegistryError> {
        {
            let mut in_flight = self.in_flight.lock().await;
            if in_flight.contains(player_id) {
                return Err(RegistryError::InvariantViolation(format!(
                    "route already in flight for player {player_id}"
                )));
            }
            in_flight.insert(player_id.to_owned());
        }

        let result = self
            .provisioning
            .provision(ProvisionRequest {
                family_id: target_family.clone(),
                variant_id: None,
                desired_count: 1,
                affinity_hint: None,
                requester_id: player_id.to_owned(),
            })
            .await;

        let slot = match result {
            ProvisionResult::Full { slots, .. } | ProvisionResult::Partial { slots, .. } if !slots.is_empty() => slots[0].clone(),
            _ => {
                self.in_flight.lock().await.remove(player_id);
                return Err(RegistryError::InvariantViolation(format!(
                    "no slot available for family {target_family}"
                )));
            }
        };

        let intent = RouteIntent {
            player_id: player_id.to_owned(),
            family_id: target_family,
            server_id: slot.backend_id,
            slot_id: slot.slot_id.to_string(),
        };

        let channel = format!("{}:{}", channels::ENVIRONMENT_ROUTE_REQUEST, proxy_id);
        self.bus
            .broadcast(&channel, MessageEnvelope::new("RouteIntent", serde_json::to_value(&intent).unwrap()))
            .await?;

        Ok(intent)
    }

    /// Called once the proxy acknowledges the route, releasing the
    /// per-player serialization lock.
    pub async fn acknowledge(&self, player_id: &str) {
        self.in_flight.lock().await.remove(player_id);
    }
}
