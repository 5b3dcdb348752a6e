//! Party reservation lifecycle: dispatch tracking, claim results, and
//! rollback on fatal claim failure.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::SystemTime;

use registry_bus::MessageBus;
use registry_bus::MessageEnvelope;
use registry_core::FamilyId;
use registry_core::NodeIdentifier;
use registry_core::PartyReservationAllocation;
use registry_core::RegistryError;
use registry_core::SlotId;
use registry_core::VariantId;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct PartyReservationSnapshot {
    pub reservation_id: String,
    pub family_id: FamilyId,
    pub variant_id: Option<VariantId>,
    pub slot_id: SlotId,
    pub slot_suffix: Option<String>,
    pub server_id: NodeIdentifier,
    pub party_size: u32,
    pub team_index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimProgress {
    pub complete: bool,
    pub success: bool,
    pub failures: usize,
    pub missing: usize,
}

/// Tracks active [`PartyReservationAllocation`]s as members dispatch and
/// claim (or fail to claim) their seats.
pub struct PartyRoutingService {
    bus: Arc<MessageBus>,
    allocations: Mutex<HashMap<String, PartyReservationAllocation>>,
}

impl PartyRoutingService {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus, allocations: Mutex::new(HashMap::new()) }
    }

    pub async fn create(&self, snapshot: PartyReservationSnapshot) -> PartyReservationAllocation {
        let allocation = PartyReservationAllocation {
            reservation_id: snapshot.reservation_id.clone(),
            family_id: snapshot.family_id,
            variant_id: snapshot.variant_id,
            slot_id: snapshot.slot_id,
            slot_suffix: snapshot.slot_suffix,
            server_id: snapshot.server_id,
            party_size: snapshot.party_size,
            team_index: snapshot.team_index,
            tokens: HashMap::new(),
            released: false,
            allocated_at: SystemTime::now(),
            dispatched: HashSet::new(),
            claimed: HashSet::new(),
            failures: HashMap::new(),
        };
        self.allocations.lock().await.insert(snapshot.reservation_id, allocation.clone());
        allocation
    }

    pub async fn mark_dispatched(&self, reservation_id: &str, player_id: &str) -> Result<(), RegistryError> {
        let mut allocations = self.allocations.lock().await;
        let allocation = allocations
            .get_mut(reservation_id)
            .ok_or_else(|| RegistryError::InvariantViolation(format!("unknown reservation {reservation_id}")))?;
        allocation.dispatched.insert(player_id.to_owned());
        if allocation.should_release() {
            allocation.released = true;
        }
        Ok(())
    }

    pub async fn record_claim(&self, reservation_id: &str, player_id: &str, success: bool, reason: Option<String>) -> Result<ClaimProgress, RegistryError> {
        let (progress, rollback) = {
            let mut allocations = self.allocations.lock().await;
            let allocation = allocations
                .get_mut(reservation_id)
                .ok_or_else(|| RegistryError::InvariantViolation(format!("unknown reservation {reservation_id}")))?;

            if success {
                allocation.claimed.insert(player_id.to_owned());
            } else {
                allocation.failures.insert(player_id.to_owned(), reason.unwrap_or_else(|| "claim failed".to_owned()));
            }

            let accounted = allocation.claimed.len() + allocation.failures.len();
            let complete = accounted as u32 >= allocation.party_size;
            let success_overall = allocation.failures.is_empty();
            let progress = ClaimProgress {
                complete,
                success: success_overall,
                failures: allocation.failures.len(),
                missing: allocation.party_size.saturating_sub(accounted as u32) as usize,
            };

            let mut rollback = false;
            if complete && !success_overall && !allocation.released {
                allocation.released = true;
                rollback = true;
            } else if allocation.should_release() {
                allocation.released = true;
            }

            (progress, rollback)
        };

        if rollback {
            let _ = self
                .bus
                .broadcast(
                    "registry:party:rollback",
                    MessageEnvelope::new("PartyReservationRollback", serde_json::json!({"reservationId": reservation_id})),
                )
                .await;
        }

        Ok(progress)
    }

    pub async fn release(&self, reservation_id: &str) -> Result<(), RegistryError> {
        let mut allocations = self.allocations.lock().await;
        let allocation = allocations
            .get_mut(reservation_id)
            .ok_or_else(|| RegistryError::InvariantViolation(format!("unknown reservation {reservation_id}")))?;
        allocation.released = true;
        Ok(())
    }

    pub async fn get(&self, reservation_id: &str) -> Option<PartyReservationAllocation> {
        self.allocations.lock().await.get(reservation_id).cloned()
    }
}
