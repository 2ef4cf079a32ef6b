pub mod envelope;
pub mod errors;
pub mod ids;
pub mod principal;

pub use envelope::{RequestEnvelope, ResponseEnvelope};
pub use errors::{CommandError, WireError};
pub use ids::ConnectionId;
pub use principal::Principal;
