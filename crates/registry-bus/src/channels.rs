//! Authoritative channel names (spec §6).

pub const REGISTRATION_REQUEST: &str = "registry:registration:request";
pub const REGISTRATION_RESPONSE: &str = "registry:registration:response";
pub const PROXY_REGISTRATION_RESPONSE: &str = "proxy:registration:response";
pub fn server_registration_response(temp_id: &str) -> String {
    format!("server:registration:response:{temp_id}")
}
pub const SERVER_HEARTBEAT: &str = "server:heartbeat";
pub const SLOT_STATUS: &str = "registry:slot:status";
pub const SLOT_FAMILY_ADVERTISEMENT: &str = "registry:slot:family:advertisement";
pub const SERVER_ADDED: &str = "registry:server:added";
pub const SERVER_REMOVED: &str = "registry:server:removed";
pub const PROXY_REMOVED: &str = "registry:proxy:removed";
pub const PROXY_UNAVAILABLE: &str = "registry:proxy:unavailable";
pub const STATUS_CHANGE: &str = "registry:status:change";
pub const REREGISTRATION_REQUEST: &str = "registry:reregistration:request";
pub const PLAYER_LOCATE_REQUEST: &str = "registry:player:locate:request";
pub const PLAYER_LOCATE_RESPONSE: &str = "registry:player:locate:response";
pub const ENVIRONMENT_ROUTE_REQUEST: &str = "registry:environment:route:request";
pub const SHUTDOWN_STARTING: &str = "registry:shutdown:starting";
pub const SHUTDOWN_EXECUTE: &str = "registry:shutdown:execute";
pub const SHUTDOWN_CANCELLED: &str = "registry:shutdown:cancelled";
pub const SERVER_EVACUATION_REQUEST: &str = "server:evacuation:request";
pub const SERVER_EVACUATION_RESPONSE: &str = "server:evacuation:response";
pub const PROXY_UNREGISTER: &str = "proxy:unregister";
