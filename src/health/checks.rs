use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, warn};

use crate::assets::AssetTree;
use crate::error::{RegistryError, Result};
use crate::state::backend::RegistryBackend;
use crate::state::kinds::{EnvStatus, FileRef};
use crate::state::models::InstanceFilter;

#[derive(Debug, Clone, Serialize)]
pub struct MissingFile {
    pub file: FileRef,
    pub env_id: String,
    pub rel_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HashMismatch {
    pub file: FileRef,
    pub env_id: String,
    pub rel_path: String,
    pub recorded: String,
    pub actual: String,
}

/// Standing consistency report between the database and the asset tree.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthReport {
    /// Instance rows whose file is gone.
    pub orphaned_instances: Vec<MissingFile>,
    /// Environment folders with no environment row.
    pub orphaned_folders: Vec<String>,
    pub hash_mismatches: Vec<HashMismatch>,
    /// Active blueprints no environment has ever used.
    pub unused_blueprints: Vec<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.orphaned_instances.is_empty()
            && self.orphaned_folders.is_empty()
            && self.hash_mismatches.is_empty()
    }

    pub fn integrity_errors(&self) -> Vec<RegistryError> {
        self.hash_mismatches
            .iter()
            .map(|m| {
                RegistryError::Integrity(format!(
                    "{} in '{}': recorded {} but file hashes to {}",
                    m.file, m.env_id, m.recorded, m.actual
                ))
            })
            .collect()
    }
}

/// Cross-checks every instance row against the asset tree.
///
/// Archived environments whose folder was pruned are skipped; their rows are
/// kept on purpose.
pub async fn run_health_checks(
    backend: &dyn RegistryBackend,
    assets: &AssetTree,
) -> Result<HealthReport> {
    let mut report = HealthReport::default();
    let environments = backend.list_environments().await?;
    let known: BTreeSet<&str> = environments.iter().map(|e| e.id.as_str()).collect();
    let pruned: BTreeSet<&str> = environments
        .iter()
        .filter(|e| e.status == EnvStatus::Archived && !assets.env_dir(&e.id).is_dir())
        .map(|e| e.id.as_str())
        .collect();

    let instances = backend.list_instances(&InstanceFilter::default()).await?;
    for instance in &instances {
        if pruned.contains(instance.env_id.as_str()) {
            continue;
        }
        if !assets.exists(&instance.env_id, &instance.rel_path) {
            report.orphaned_instances.push(MissingFile {
                file: instance.file_ref(),
                env_id: instance.env_id.clone(),
                rel_path: instance.rel_path.clone(),
            });
            continue;
        }
        let actual = assets.hash_file(&instance.env_id, &instance.rel_path)?;
        if actual != instance.content_hash {
            warn!(file = %instance.file_ref(), env = %instance.env_id, "content hash mismatch");
            report.hash_mismatches.push(HashMismatch {
                file: instance.file_ref(),
                env_id: instance.env_id.clone(),
                rel_path: instance.rel_path.clone(),
                recorded: instance.content_hash.clone(),
                actual,
            });
        }
    }

    for folder in assets.env_folders()? {
        if !known.contains(folder.as_str()) {
            report.orphaned_folders.push(folder);
        }
    }

    report.unused_blueprints = backend
        .unused_blueprints()
        .await?
        .into_iter()
        .map(|b| b.id)
        .collect();

    debug!(
        instances = instances.len(),
        missing = report.orphaned_instances.len(),
        mismatched = report.hash_mismatches.len(),
        orphaned_folders = report.orphaned_folders.len(),
        "health check complete"
    );
    Ok(report)
}
