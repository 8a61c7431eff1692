pub mod assets;
pub mod cloning;
pub mod config;
pub mod connector;
pub mod error;
pub mod governance;
pub mod health;
pub mod output;
pub mod planning;
pub mod registry;
pub mod retry;
pub mod state;

pub use error::{RegistryError, Result};
pub use registry::Registry;
