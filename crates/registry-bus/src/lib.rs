//! Envelope framing, transport adapters, and the pub/sub bus that every
//! other registry component talks through.

pub mod bus;
pub mod channels;
pub mod envelope;
pub mod error;
pub mod transport;

pub use bus::MessageBus;
pub use bus::is_emit_only;
pub use envelope::MessageEnvelope;
pub use envelope::TypeRegistry;
pub use error::BusError;
pub use transport::InMemoryTransport;
pub use transport::RedisTransport;
pub use transport::Subscription;
pub use transport::TransportAdapter;
pub use transport::connect;
