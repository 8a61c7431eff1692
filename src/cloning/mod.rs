pub mod engine;
pub mod profile;

pub use engine::{CloneEngine, CloneRequest};
