//! Shared record types mutated by the membership, heartbeat, catalog, and
//! routing components.

use std::collections::HashMap;
use std::collections::HashSet;
use std::time::SystemTime;

use serde::Deserialize;
use serde::Serialize;

use crate::identifier::NodeIdentifier;

/// Newtype over a sanitized slot identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(String);

impl SlotId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(sanitize(&raw.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype over a family (capability/role) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FamilyId(String);

impl FamilyId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(sanitize(&raw.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FamilyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype over a variant identifier, narrowing a family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariantId(String);

impl VariantId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(sanitize(&raw.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VariantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn sanitize(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Lifecycle status shared by proxies and backends, forming the DAG
/// `RUNNING -> EVACUATING -> STOPPING -> DEAD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Running,
    Evacuating,
    Stopping,
    Dead,
}

impl NodeStatus {
    /// Whether `self -> next` is a legal edge in the DAG.
    pub fn can_transition_to(self, next: NodeStatus) -> bool {
        use NodeStatus::*;
        matches!(
            (self, next),
            (Running, Evacuating)
                | (Running, Stopping)
                | (Running, Dead)
                | (Evacuating, Stopping)
                | (Evacuating, Dead)
                | (Stopping, Dead)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub id: NodeIdentifier,
    pub role: String,
    pub address: String,
    pub port: u16,
    pub status: NodeStatus,
    pub registered_at: SystemTime,
    pub last_heartbeat: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SlotStatus {
    Available,
    Provisioning,
    Allocated,
    InGame,
    Cooldown,
    Faulted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalSlotRecord {
    pub slot_id: SlotId,
    pub slot_suffix: Option<String>,
    pub family_id: FamilyId,
    pub variant_id: Option<VariantId>,
    pub status: SlotStatus,
    pub online_players: u32,
    pub max_players: u32,
    pub game_type: Option<String>,
    pub metadata: HashMap<String, String>,
    pub last_updated: SystemTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendRecord {
    pub id: NodeIdentifier,
    pub server_type: String,
    pub role: String,
    pub address: String,
    pub port: u16,
    pub max_capacity: u32,
    pub version: String,
    pub status: NodeStatus,
    pub player_count: u32,
    pub tps: f32,
    pub last_heartbeat: SystemTime,
    pub slots: HashMap<SlotId, LogicalSlotRecord>,
    pub family_capacities: HashMap<FamilyId, u32>,
    pub family_variants: HashMap<FamilyId, HashSet<VariantId>>,
}

impl BackendRecord {
    /// Sum of slots per family currently advertised, for checking against
    /// `family_capacities` (steady-state invariant I3).
    pub fn slots_per_family(&self) -> HashMap<FamilyId, u32> {
        let mut counts = HashMap::new();
        for slot in self.slots.values() {
            *counts.entry(slot.family_id.clone()).or_insert(0) += 1;
        }
        counts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartyReservationAllocation {
    pub reservation_id: String,
    pub family_id: FamilyId,
    pub variant_id: Option<VariantId>,
    pub slot_id: SlotId,
    pub slot_suffix: Option<String>,
    pub server_id: NodeIdentifier,
    pub party_size: u32,
    pub team_index: Option<u32>,
    pub tokens: HashMap<String, String>,
    pub released: bool,
    pub allocated_at: SystemTime,
    pub dispatched: HashSet<String>,
    pub claimed: HashSet<String>,
    pub failures: HashMap<String, String>,
}

impl PartyReservationAllocation {
    /// Invariant I5: released iff enough members dispatched or explicitly released.
    pub fn should_release(&self) -> bool {
        self.released || self.dispatched.len() as u32 >= self.party_size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShutdownHint {
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub node_id: NodeIdentifier,
    pub player_count: u32,
    pub tps: f32,
    pub status: Option<ShutdownHint>,
}

impl Heartbeat {
    pub fn is_graceful_shutdown(&self) -> bool {
        matches!(self.status, Some(ShutdownHint::Shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_slot_id() {
        let id = SlotId::new(" Skywars #7! ");
        assert_eq!(id.as_str(), "skywars--7-");
    }

    #[test]
    fn status_dag_forbids_reverse_transitions() {
        assert!(NodeStatus::Running.can_transition_to(NodeStatus::Evacuating));
        assert!(!NodeStatus::Dead.can_transition_to(NodeStatus::Running));
        assert!(!NodeStatus::Stopping.can_transition_to(NodeStatus::Running));
    }

    #[test]
    fn party_reservation_releases_when_all_dispatched() {
        let mut allocation = PartyReservationAllocation {
            reservation_id: "r1".into(),
            family_id: FamilyId::new("lobby"),
            variant_id: None,
            slot_id: SlotId::new("skywars-7"),
            slot_suffix: None,
            server_id: NodeIdentifier::new(
                crate::identifier::NodeKind::Backend,
                uuid::Uuid::now_v7(),
                0,
                crate::identifier::now_millis(),
            )
            .unwrap(),
            party_size: 2,
            team_index: None,
            tokens: HashMap::new(),
            released: false,
            allocated_at: SystemTime::now(),
            dispatched: HashSet::new(),
            claimed: HashSet::new(),
            failures: HashMap::new(),
        };
        assert!(!allocation.should_release());
        allocation.dispatched.insert("p1".into());
        allocation.dispatched.insert("p2".into());
        assert!(allocation.should_release());
    }
}
