pub mod engine;
pub mod status;
pub mod validation;

pub use engine::{GovernanceEngine, GovernedInstance, Inbox};
pub use status::{derive_status, GovernanceStatus};
pub use validation::Content;
