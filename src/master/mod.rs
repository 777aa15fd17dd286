//! Master-side functionality modules.

mod ring;
mod coordinator;
mod handlers;

pub use ring::{ParticipantInfo, ReplicaRing};
pub use coordinator::{Coordinator, MasterConfig};
pub use handlers::{ClientApiHandler, RegistrationHandler};
