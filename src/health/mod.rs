pub mod checks;

pub use checks::{run_health_checks, HashMismatch, HealthReport, MissingFile};
