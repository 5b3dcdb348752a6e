//! Error kinds local to the bus crate. `BusError` maps onto
//! `registry_core::RegistryError` at the component boundary.

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to connect to transport: {0}")]
    Connection(String),
    #[error("subscription failed: {0}")]
    Subscription(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("failed to decode payload: {0}")]
    PayloadDecode(String),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

impl From<BusError> for registry_core::RegistryError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::PayloadDecode(msg) => registry_core::RegistryError::PayloadDecodeError(msg),
            other => registry_core::RegistryError::TransportUnavailable(other.to_string()),
        }
    }
}
