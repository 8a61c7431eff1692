pub mod backend;
pub mod kinds;
pub mod lock;
pub mod migration;
pub mod models;
pub(crate) mod replicate;
pub mod rows;
pub mod schema;
pub mod sqlite;
