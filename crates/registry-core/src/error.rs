//! Typed error kinds shared across every component crate.

/// The error surface for registry components. Library crates return
/// `Result<T, RegistryError>`; only the binary's outermost glue converts to
/// `anyhow::Error`.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("allocation exhausted: no free instance slot in range [0,99]")]
    AllocationExhausted,

    #[error("duplicate registration for {0}")]
    DuplicateRegistration(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("failed to decode payload: {0}")]
    PayloadDecodeError(String),

    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("operator error: {0}")]
    OperatorError(String),
}
