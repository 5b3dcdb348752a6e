//! Slot and family catalog: per-backend advertisements and the aggregate
//! queries the provisioning and routing services read from.

use std::collections::HashMap;
use std::collections::HashSet;

use registry_core::FamilyId;
use registry_core::LogicalSlotRecord;
use registry_core::NodeIdentifier;
use registry_core::SlotId;
use registry_core::SlotStatus;
use registry_core::VariantId;
use tokio::sync::RwLock;

#[derive(Debug, Default, Clone)]
struct BackendAdvertisement {
    family_capacities: HashMap<FamilyId, u32>,
    family_variants: HashMap<FamilyId, HashSet<VariantId>>,
    slots: HashMap<SlotId, LogicalSlotRecord>,
}

/// Aggregate view over every backend's advertised capacities, variants, and
/// slot statuses. Mutated only by advertisement and status-update handlers;
/// removed atomically when the owning backend leaves the fleet.
pub struct SlotCatalog {
    backends: RwLock<HashMap<NodeIdentifier, BackendAdvertisement>>,
}

impl SlotCatalog {
    pub fn new() -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
        }
    }

    pub async fn advertise_family_capacities(&self, backend_id: NodeIdentifier, capacities: HashMap<FamilyId, u32>) {
        let mut backends = self.backends.write().await;
        backends.entry(backend_id).or_default().family_capacities = capacities;
    }

    pub async fn advertise_family_variants(&self, backend_id: NodeIdentifier, variants: HashMap<FamilyId, HashSet<VariantId>>) {
        let mut backends = self.backends.write().await;
        backends.entry(backend_id).or_default().family_variants = variants;
    }

    pub async fn update_slot(&self, backend_id: NodeIdentifier, slot: LogicalSlotRecord) {
        let mut backends = self.backends.write().await;
        backends.entry(backend_id).or_default().slots.insert(slot.slot_id.clone(), slot);
    }

    /// Atomically drops every advertisement owned by `backend_id`, per the
    /// spec's removal requirement.
    pub async fn remove_backend(&self, backend_id: NodeIdentifier) {
        self.backends.write().await.remove(&backend_id);
    }

    pub async fn has_family(&self, family: &FamilyId) -> bool {
        self.backends
            .read()
            .await
            .values()
            .any(|b| b.family_capacities.contains_key(family))
    }

    pub async fn per_server_capacities(&self) -> HashMap<NodeIdentifier, HashMap<FamilyId, u32>> {
        self.backends
            .read()
            .await
            .iter()
            .map(|(id, adv)| (*id, adv.family_capacities.clone()))
            .collect()
    }

    pub async fn variants_of_family(&self, family: &FamilyId) -> HashSet<VariantId> {
        self.backends
            .read()
            .await
            .values()
            .filter_map(|b| b.family_variants.get(family))
            .flatten()
            .cloned()
            .collect()
    }

    pub async fn slots_of_family(&self, family: &FamilyId, status: Option<SlotStatus>) -> Vec<(NodeIdentifier, LogicalSlotRecord)> {
        self.backends
            .read()
            .await
            .iter()
            .flat_map(|(id, adv)| {
                adv.slots
                    .values()
                    .filter(|slot| &slot.family_id == family)
                    .filter(|slot| status.map(|s| s == slot.status).unwrap_or(true))
                    .map(move |slot| (*id, slot.clone()))
            })
            .collect()
    }

    /// Mutates a specific slot's status in place, returning whether the slot
    /// was found. Used by provisioning confirmation/reversion.
    pub async fn set_slot_status(&self, backend_id: NodeIdentifier, slot_id: &SlotId, status: SlotStatus) -> bool {
        let mut backends = self.backends.write().await;
        let Some(adv) = backends.get_mut(&backend_id) else { return false };
        let Some(slot) = adv.slots.get_mut(slot_id) else { return false };
        slot.status = status;
        slot.last_updated = std::time::SystemTime::now();
        true
    }
}

impl Default for SlotCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn backend_id() -> NodeIdentifier {
        NodeIdentifier::new(
            registry_core::NodeKind::Backend,
            uuid::Uuid::now_v7(),
            0,
            registry_core::identifier::now_millis(),
        )
        .unwrap()
    }

    fn slot(family: &str, status: SlotStatus) -> LogicalSlotRecord {
        LogicalSlotRecord {
            slot_id: SlotId::new(format!("{family}-1")),
            slot_suffix: None,
            family_id: FamilyId::new(family),
            variant_id: None,
            status,
            online_players: 0,
            max_players: 16,
            game_type: None,
            metadata: HashMap::new(),
            last_updated: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn queries_reflect_advertisements() {
        let catalog = SlotCatalog::new();
        let backend = backend_id();
        let family = FamilyId::new("skywars");
        catalog
            .advertise_family_capacities(backend, HashMap::from([(family.clone(), 10)]))
            .await;
        catalog.update_slot(backend, slot("skywars", SlotStatus::Available)).await;

        assert!(catalog.has_family(&family).await);
        let slots = catalog.slots_of_family(&family, Some(SlotStatus::Available)).await;
        assert_eq!(slots.len(), 1);
    }

    #[tokio::test]
    async fn removing_backend_drops_all_its_entries_atomically() {
        let catalog = SlotCatalog::new();
        let backend = backend_id();
        let family = FamilyId::new("skywars");
        catalog.update_slot(backend, slot("skywars", SlotStatus::Available)).await;
        catalog.remove_backend(backend).await;
        assert!(catalog.slots_of_family(&family, None).await.is_empty());
        assert!(!catalog.has_family(&family).await);
    }
}
