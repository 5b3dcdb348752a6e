mod handler;
mod types;

pub use handler::RegistrationHandler;
pub use types::RegistrationRequest;
pub use types::RegistrationResponse;
