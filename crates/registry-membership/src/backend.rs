//! Backend membership registry.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::SystemTime;

use registry_bus::MessageBus;
use registry_bus::MessageEnvelope;
use registry_bus::channels;
use registry_core::BackendRecord;
use registry_core::FamilyId;
use registry_core::LogicalSlotRecord;
use registry_core::NodeIdentifier;
use registry_core::NodeStatus;
use registry_core::RegistryError;
use registry_core::SlotId;
use registry_core::VariantId;
use tokio::sync::RwLock;

pub struct BackendRegistrationRequest {
    pub server_type: String,
    pub role: String,
    pub address: String,
    pub port: u16,
    pub max_capacity: u32,
    pub version: String,
}

/// Per-backend membership records, including the slot and family
/// advertisements the catalog mirrors for aggregate queries.
pub struct BackendRegistry {
    records: RwLock<HashMap<NodeIdentifier, BackendRecord>>,
    bus: Arc<MessageBus>,
}

impl BackendRegistry {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            bus,
        }
    }

    pub async fn register(&self, id: NodeIdentifier, req: BackendRegistrationRequest) -> Result<(), RegistryError> {
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
            BackendRecord {
                id,
                server_type: req.server_type,
                role: req.role,
                address: req.address,
                port: req.port,
                max_capacity: req.max_capacity,
                version: req.version,
                status: NodeStatus::Running,
                player_count: 0,
                tps: 20.0,
                last_heartbeat: now,
                slots: HashMap::new(),
                family_capacities: HashMap::new(),
                family_variants: HashMap::new(),
            },
        );
        Ok(())
    }

    pub async fn get(&self, id: NodeIdentifier) -> Option<BackendRecord> {
        self.records.read().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: NodeIdentifier) -> Option<BackendRecord> {
        self.records.write().await.remove(&id)
    }

    pub async fn update_status(&self, id: NodeIdentifier, status: NodeStatus) -> Result<(), RegistryError> {
        let previous = {
            let mut records = self.records.write().await;
            let record = records
                .get_mut(&id)
                .ok_or_else(|| RegistryError::InvariantViolation(format!("unknown backend {id}")))?;
            if !record.status.can_transition_to(status) {
                return Err(RegistryError::InvariantViolation(format!(
                    "illegal backend status transition {:?} -> {:?}",
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

    pub async fn record_heartbeat(&self, id: NodeIdentifier, player_count: u32, tps: f32, at: SystemTime) -> bool {
        let mut records = self.records.write().await;
        match records.get_mut(&id) {
            Some(record) => {
                record.last_heartbeat = at;
                record.player_count = player_count;
                record.tps = tps;
                true
            }
            None => false,
        }
    }

    pub async fn list(&self) -> Vec<BackendRecord> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn list_by_role(&self, role: &str) -> Vec<BackendRecord> {
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
                    && now.duration_since(r.last_heartbeat).map(|age| age < window).unwrap_or(true)
            })
            .map(|r| r.id)
    }

    /// Inserts or replaces the advertisement for `slot.slot_id`. Does not
    /// enforce I3 (agreement with `family_capacities`) directly — callers in
    /// the catalog component cross-check at read time, per the spec's
    /// steady-state (not per-write) framing of that invariant.
    pub async fn update_slot(&self, id: NodeIdentifier, slot: LogicalSlotRecord) -> Result<(), RegistryError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| RegistryError::InvariantViolation(format!("unknown backend {id}")))?;
        record.slots.insert(slot.slot_id.clone(), slot);
        Ok(())
    }

    pub async fn update_family_capabilities(&self, id: NodeIdentifier, capacities: HashMap<FamilyId, u32>) -> Result<(), RegistryError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| RegistryError::InvariantViolation(format!("unknown backend {id}")))?;
        record.family_capacities = capacities;
        Ok(())
    }

    pub async fn update_family_variants(&self, id: NodeIdentifier, variants: HashMap<FamilyId, HashSet<VariantId>>) -> Result<(), RegistryError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| RegistryError::InvariantViolation(format!("unknown backend {id}")))?;
        record.family_variants = variants;
        Ok(())
    }
}
