//! Per-node membership registries for proxies and backends.

pub mod backend;
pub mod proxy;

pub use backend::BackendRegistrationRequest;
pub use backend::BackendRegistry;
pub use proxy::ProxyRegistrationRequest;
pub use proxy::ProxyRegistry;
