use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// In-process advisory locks, one per (blueprint, environment) slot.
///
/// Serializes the write-file-then-commit sequence of concurrent uploads to
/// the same slot. The database transaction still enforces the invariants;
/// this only keeps two writers from racing each other into a conflict.
#[derive(Default)]
pub struct SlotLocks {
    slots: DashMap<(String, String), Arc<Mutex<()>>>,
}

impl SlotLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and hold the slot lock until the guard is dropped.
    pub async fn acquire(&self, blueprint_id: &str, env_id: &str) -> OwnedMutexGuard<()> {
        let slot = self
            .slots
            .entry((blueprint_id.to_string(), env_id.to_string()))
            .or_default()
            .clone();
        slot.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

