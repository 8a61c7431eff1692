use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Runtime settings, read from `atlas.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// SQLite database file.
    pub database_path: PathBuf,
    /// Root holding one folder per environment.
    pub asset_root: PathBuf,
    pub busy_timeout_ms: u64,
    /// How often a conflicting write is retried before giving up.
    pub conflict_retries: u32,
    pub retry_base_delay_ms: u64,
    pub http_timeout_secs: u64,
    /// Approved external domains: key → base URL.
    pub approved_domains: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            asset_root: default_asset_root(),
            busy_timeout_ms: 5_000,
            conflict_retries: 3,
            retry_base_delay_ms: 50,
            http_timeout_secs: 30,
            approved_domains: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Resolves relative paths against `base`.
    pub fn rooted_at(mut self, base: &std::path::Path) -> Self {
        if self.database_path.is_relative() {
            self.database_path = base.join(&self.database_path);
        }
        if self.asset_root.is_relative() {
            self.asset_root = base.join(&self.asset_root);
        }
        self
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from(".atlas/registry.db")
}

fn default_asset_root() -> PathBuf {
    PathBuf::from(".atlas/environments")
}
