pub mod external;

pub use external::ExternalFetcher;
