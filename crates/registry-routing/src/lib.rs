//! Player location and routing, including party reservation lifecycles.

pub mod locate;
pub mod party;
pub mod route;

pub use locate::LocateResult;
pub use locate::LocateService;
pub use party::ClaimProgress;
pub use party::PartyReservationSnapshot;
pub use party::PartyRoutingService;
pub use route::RouteIntent;
pub use route::RoutingService;
