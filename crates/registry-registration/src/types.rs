//! Wire types for the registration protocol.

use std::collections::HashMap;
use std::collections::HashSet;

use registry_core::FamilyId;
use registry_core::NodeIdentifier;
use registry_core::VariantId;
use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub temp_id: String,
    pub server_type: String,
    pub role: String,
    pub address: String,
    pub port: u16,
    pub max_capacity: u32,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    pub temp_id: String,
    pub assigned_id: Option<NodeIdentifier>,
    pub success: bool,
    pub reason: Option<String>,
}

/// Wire shape of a `registry:slot:status` update: a single backend
/// advertising or revising one of its logical slots.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotStatusUpdate {
    pub node_id: NodeIdentifier,
    pub slot: registry_core::LogicalSlotRecord,
}

/// Wire shape of a `registry:slot:family:advertisement` update: a backend's
/// full per-family capacity and variant advertisement, replacing whatever it
/// had previously advertised.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FamilyAdvertisement {
    pub node_id: NodeIdentifier,
    #[serde(default)]
    pub family_capacities: HashMap<FamilyId, u32>,
    #[serde(default)]
    pub family_variants: HashMap<FamilyId, HashSet<VariantId>>,
}

impl RegistrationResponse {
    pub fn failure(temp_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self { temp_id: temp_id.into(), assigned_id: None, success: false, reason: Some(reason.into()) }
    }

    pub fn success(temp_id: impl Into<String>, assigned_id: NodeIdentifier) -> Self {
        Self { temp_id: temp_id.into(), assigned_id: Some(assigned_id), success: true, reason: None }
    }
}
