//! Proxy membership registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use registry_bus::MessageBus;
use registry_bus::MessageEnvelope;
use registry_bus::channels;
use registry_core::NodeIdentifier;
use registry_core::NodeStatus;
use registry_core::ProxyRecord;
use registry_core::RegistryError;
use tokio::sync::RwLock;

pub struct ProxyRegistrationRequest {
    pub role: String,
    pub address: String,
    pub port: u16,
}

/// Per-proxy membership records. Mutated only by the registration handler
/// and the heartbeat monitor (spec §3).
pub struct ProxyRegistry {
    records: RwLock<HashMap<NodeIdentifier, ProxyRecord>>,
    bus: Arc<MessageBus>,
}

impl ProxyRegistry {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            bus,
        }
    }

    /// Registers `id` for `req`, enforcing invariant I1: at most one active
    /// record per `(address, port)`. Callers that hit `DuplicateRegistration`
    /// should consult [`ProxyRegistry::wasRecentlyRegistered`]-style lookups
    /// upstream (the registration handler's dedup step) before calling this.
    pub async fn register(&self, id: NodeIdentifier, req: ProxyRegistrationRequest) -> Result<(), RegistryError> {
        let mut records = self.records.write().await;
        let address_taken = records.values().any(|r| {
            r.address == req.address && r.port == req.port && r.status != NodeStatus::Dead
        });
        if address_taken {
            return Err(RegistryError::DuplicateRegistration(format!(
                "{}:{}",
                req.address, req.port
            )));
        }
        let now = SystemTime::now();
        records.insert(
            id,
            ProxyRecord {
                id,
                role: req.role,
                address: req.address,
                port: req.port,
                status: NodeStatus::Running,
                registered_at: now,
                last_heartbeat: now,
            },
        );
        Ok(())
    }

    pub async fn get(&self, id: NodeIdentifier) -> Option<ProxyRecord> {
        self.records.read().await.get(&id).cloned()
    }

    /// Idempotent: removing an absent record is not an error.
    pub async fn remove(&self, id: NodeIdentifier) -> Option<ProxyRecord> {
        self.records.write().await.remove(&id)
    }

    pub async fn update_status(&self, id: NodeIdentifier, status: NodeStatus) -> Result<(), RegistryError> {
        let previous = {
            let mut records = self.records.write().await;
            let record = records
                .get_mut(&id)
                .ok_or_else(|| RegistryError::InvariantViolation(format!("unknown proxy {id}")))?;
            if !record.status.can_transition_to(status) {
                return Err(RegistryError::InvariantViolation(format!(
                    "illegal proxy status transition {:?} -> {:?}",
                    record.status, status
                )));
            }
            let previous = record.status;
            record.status = status;
            previous
        };
        let _ = self
            .bus
            .broadcast(
                channels::STATUS_CHANGE,
                MessageEnvelope::new(
                    "StatusChange",
                    serde_json::json!({"nodeId": id.to_string(), "from": format!("{:?}", previous), "to": format!("{:?}", status)}),
                ),
            )
            .await;
        Ok(())
    }

    pub async fn record_heartbeat(&self, id: NodeIdentifier, at: SystemTime) -> bool {
        let mut records = self.records.write().await;
        match records.get_mut(&id) {
            Some(record) => {
                record.last_heartbeat = at;
                true
            }
            None => false,
        }
    }

    pub async fn list(&self) -> Vec<ProxyRecord> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn list_by_role(&self, role: &str) -> Vec<ProxyRecord> {
        self.records.read().await.values().filter(|r| r.role == role).cloned().collect()
    }

    pub async fn was_recently_registered(&self, address: &str, port: u16, window: std::time::Duration) -> Option<NodeIdentifier> {
        let now = SystemTime::now();
        self.records
            .read()
            .await
            .values()
            .find(|r| {
                r.address == address
                    && r.port == port
                    && r.status != NodeStatus::Dead
                    && now.duration_since(r.registered_at).map(|age| age < window).unwrap_or(true)
            })
            .map(|r| r.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry_bus::InMemoryTransport;

    fn bus() -> Arc<MessageBus> {
        Arc::new(MessageBus::new(Arc::new(InMemoryTransport::new())))
    }

    fn identifier(instance: u16) -> NodeIdentifier {
        NodeIdentifier::new(
            registry_core::NodeKind::Proxy,
            uuid::Uuid::now_v7(),
            instance,
            registry_core::identifier::now_millis(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn rejects_duplicate_address_port() {
        let registry = ProxyRegistry::new(bus());
        let id_a = identifier(0);
        let id_b = identifier(1);
        registry
            .register(id_a, ProxyRegistrationRequest { role: "proxy".into(), address: "10.0.0.1".into(), port: 25001 })
            .await
            .unwrap();
        let result = registry
            .register(id_b, ProxyRegistrationRequest { role: "proxy".into(), address: "10.0.0.1".into(), port: 25001 })
            .await;
        assert!(matches!(result, Err(RegistryError::DuplicateRegistration(_))));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = ProxyRegistry::new(bus());
        let id = identifier(0);
        assert!(registry.remove(id).await.is_none());
        registry
            .register(id, ProxyRegistrationRequest { role: "proxy".into(), address: "10.0.0.1".into(), port: 1 })
            .await
            .unwrap();
        assert!(registry.remove(id).await.is_some());
        assert!(registry.remove(id).await.is_none());
    }

    #[tokio::test]
    async fn rejects_illegal_status_transition() {
        let registry = ProxyRegistry::new(bus());
        let id = identifier(0);
        registry
            .register(id, ProxyRegistrationRequest { role: "proxy".into(), address: "10.0.0.1".into(), port: 1 })
            .await
            .unwrap();
        registry.update_status(id, NodeStatus::Dead).await.unwrap();
        let result = registry.update_status(id, NodeStatus::Running).await;
        assert!(result.is_err());
    }
}
