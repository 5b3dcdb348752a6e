//! Matches provisioning requests to candidate slots in the catalog,
//! transitioning picks to `PROVISIONING` and reverting unconfirmed picks
//! after a timeout.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use registry_bus::MessageBus;
use registry_bus::MessageEnvelope;
use registry_catalog::SlotCatalog;
use registry_core::FamilyId;
use registry_core::NodeIdentifier;
use registry_core::SlotId;
use registry_core::SlotStatus;
use registry_core::VariantId;
use tokio::sync::Mutex;
use tokio::time::Duration;

#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub family_id: FamilyId,
    pub variant_id: Option<VariantId>,
    pub desired_count: u32,
    pub affinity_hint: Option<NodeIdentifier>,
    pub requester_id: String,
}

#[derive(Debug, Clone)]
pub struct ProvisionedSlot {
    pub backend_id: NodeIdentifier,
    pub slot_id: SlotId,
}

#[derive(Debug, Clone)]
pub enum ProvisionResult {
    Full { token: String, slots: Vec<ProvisionedSlot> },
    Partial { token: String, slots: Vec<ProvisionedSlot>, reason: String },
    Exhausted,
}

struct PendingReservation {
    token: String,
    slots: Vec<ProvisionedSlot>,
    expires_at: tokio::time::Instant,
}

/// Confirmation window after which an unconfirmed `PROVISIONING` slot
/// reverts to `AVAILABLE`.
const DEFAULT_CONFIRMATION_WINDOW: Duration = Duration::from_secs(15);

pub struct ProvisioningService {
    catalog: Arc<SlotCatalog>,
    bus: Arc<MessageBus>,
    confirmation_window: Duration,
    pending: Mutex<HashMap<(String, FamilyId, Option<VariantId>), PendingReservation>>,
}

impl ProvisioningService {
    pub fn new(catalog: Arc<SlotCatalog>, bus: Arc<MessageBus>) -> Self {
        Self {
            catalog,
            bus,
            confirmation_window: DEFAULT_CONFIRMATION_WINDOW,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub async fn provision(&self, req: ProvisionRequest) -> ProvisionResult {
        let key = (req.requester_id.clone(), req.family_id.clone(), req.variant_id.clone());

        {
            let mut pending = self.pending.lock().await;
            self.expire_stale(&mut pending).await;
            if let Some(existing) = pending.get(&key) {
                return ProvisionResult::Full {
                    token: existing.token.clone(),
                    slots: existing.slots.clone(),
                };
            }
        }

        let mut candidates = self
            .catalog
            .slots_of_family(&req.family_id, Some(SlotStatus::Available))
            .await;
        if let Some(variant) = &req.variant_id {
            candidates.retain(|(_, slot)| slot.variant_id.as_ref() == Some(variant));
        }

        if candidates.is_empty() {
            return ProvisionResult::Exhausted;
        }

        let picked = pick_spread(candidates, req.desired_count);

        for (backend_id, slot) in &picked {
            self.catalog.set_slot_status(*backend_id, &slot.slot_id, SlotStatus::Provisioning).await;
            let _ = self
                .bus
                .broadcast(
                    &format!("server:slot:claim:{backend_id}"),
                    MessageEnvelope::new(
                        "SlotClaim",
                        serde_json::json!({"slotId": slot.slot_id.as_str(), "requesterId": req.requester_id}),
                    ),
                )
                .await;
        }

        let token = uuid::Uuid::now_v7().to_string();
        let slots: Vec<ProvisionedSlot> = picked
            .iter()
            .map(|(backend_id, slot)| ProvisionedSlot { backend_id: *backend_id, slot_id: slot.slot_id.clone() })
            .collect();

        self.pending.lock().await.insert(
            key,
            PendingReservation {
                token: token.clone(),
                slots: slots.clone(),
                expires_at: tokio::time::Instant::now() + self.confirmation_window,
            },
        );

        if (slots.len() as u32) < req.desired_count {
            let reason = format!("only {} of {} requested slots available", slots.len(), req.desired_count);
            ProvisionResult::Partial {
                token,
                slots,
                reason,
            }
        } else {
            ProvisionResult::Full { token, slots }
        }
    }

    /// Confirms a reservation so its slots do not revert at the confirmation
    /// deadline.
    pub async fn confirm(&self, token: &str) {
        self.pending.lock().await.retain(|_, reservation| reservation.token != token);
    }

    async fn expire_stale(&self, pending: &mut HashMap<(String, FamilyId, Option<VariantId>), PendingReservation>) {
        let now = tokio::time::Instant::now();
        let expired: Vec<_> = pending
            .iter()
            .filter(|(_, r)| r.expires_at <= now)
            .map(|(k, r)| (k.clone(), r.slots.clone()))
            .collect();
        for (key, slots) in expired {
            for slot in slots {
                self.catalog.set_slot_status(slot.backend_id, &slot.slot_id, SlotStatus::Available).await;
            }
            pending.remove(&key);
        }
    }

    /// Runs the periodic sweep that reverts unconfirmed `PROVISIONING` slots
    /// back to `AVAILABLE` once their confirmation window elapses.
    pub async fn sweep_expired(&self) {
        let mut pending = self.pending.lock().await;
        self.expire_stale(&mut pending).await;
    }
}

/// Scores candidates by `(free-capacity desc, last-updated desc)` then picks
/// the top `desired_count` spreading across distinct backends where
/// possible: one round per backend, highest score first within each round.
fn pick_spread(
    candidates: Vec<(NodeIdentifier, registry_core::LogicalSlotRecord)>,
    desired_count: u32,
) -> Vec<(NodeIdentifier, registry_core::LogicalSlotRecord)> {
    let mut by_backend: HashMap<NodeIdentifier, Vec<registry_core::LogicalSlotRecord>> = HashMap::new();
    for (backend_id, slot) in candidates {
        by_backend.entry(backend_id).or_default().push(slot);
    }
    for slots in by_backend.values_mut() {
        slots.sort_by_key(|s| (Reverse(free_capacity(s)), Reverse(to_millis(s.last_updated))));
    }

    let mut backend_ids: Vec<NodeIdentifier> = by_backend.keys().copied().collect();
    backend_ids.sort();

    let mut picked = Vec::new();
    let mut round = 0;
    while (picked.len() as u32) < desired_count {
        let mut progressed = false;
        for backend_id in &backend_ids {
            if (picked.len() as u32) >= desired_count {
                break;
            }
            if let Some(slot) = by_backend.get(backend_id).and_then(|s| s.get(round)) {
                picked.push((*backend_id, slot.clone()));
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
        round += 1;
    }
    picked
}

fn free_capacity(slot: &registry_core::LogicalSlotRecord) -> u32 {
    slot.max_players.saturating_sub(slot.online_players)
}

fn to_millis(time: SystemTime) -> u128 {
    time.duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or(0)
}
