use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::status::{derive_status, GovernanceStatus, SignOffState};
use super::validation::{validate_content, Content};
use crate::assets::{hash, AssetTree};
use crate::error::{RegistryError, Result};
use crate::state::backend::RegistryBackend;
use crate::state::kinds::*;
use crate::state::lock::SlotLocks;
use crate::state::models::*;

/// An instance together with its derived governance status.
#[derive(Debug, Clone, Serialize)]
pub struct GovernedInstance {
    pub instance: FileInstance,
    pub status: GovernanceStatus,
}

/// Work waiting on one user within a stage of an environment.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Inbox {
    /// Active instances the user may sign as Doer that lack a Doer signature.
    pub pending_doer: Vec<FileInstance>,
    /// Doer-signed instances the user may review that lack a reviewer signature.
    pub pending_reviewer: Vec<FileInstance>,
}

/// Versioned file-instance governance: uploads, sign-offs and status.
pub struct GovernanceEngine {
    backend: Arc<dyn RegistryBackend>,
    assets: AssetTree,
    locks: SlotLocks,
}

impl GovernanceEngine {
    pub fn new(backend: Arc<dyn RegistryBackend>, assets: AssetTree) -> Self {
        Self {
            backend,
            assets,
            locks: SlotLocks::new(),
        }
    }

    /// Registers a new version of `blueprint_id` in `env_id`.
    ///
    /// The file is written before the commit and removed again if the
    /// commit fails, so a failed upload leaves neither rows nor bytes.
    pub async fn create_version(
        &self,
        actor: &Actor,
        env_id: &str,
        blueprint_id: &str,
        content: &Content,
        parents: &[FileRef],
    ) -> Result<FileInstance> {
        let env = self
            .backend
            .get_environment(env_id)
            .await?
            .ok_or_else(|| RegistryError::not_found(format!("environment '{}'", env_id)))?;
        if env.status != EnvStatus::Active {
            return Err(RegistryError::permission(format!(
                "environment '{}' is {} and does not accept uploads",
                env.id, env.status
            )));
        }
        if !env.allowed_roles.allows(actor.role) {
            return Err(RegistryError::permission(format!(
                "role {} has no access to environment '{}'",
                actor.role, env.id
            )));
        }

        let bp = self
            .backend
            .get_blueprint(blueprint_id)
            .await?
            .ok_or_else(|| RegistryError::not_found(format!("blueprint '{}'", blueprint_id)))?;
        if bp.status != BlueprintStatus::Active {
            return Err(RegistryError::validation(format!(
                "blueprint '{}' is {}",
                bp.id, bp.status
            )));
        }
        if !bp.doer_roles.allows(actor.role) {
            return Err(RegistryError::permission(format!(
                "role {} cannot upload for blueprint '{}'",
                actor.role, bp.id
            )));
        }

        if let Some(dup) = repeated_parent(parents) {
            return Err(RegistryError::validation(format!(
                "lineage parent {} is listed more than once",
                dup
            )));
        }

        let summary = validate_content(&bp, content)?;
        let content_hash = hash::sha256_hex(&content.bytes);

        let _slot = self.locks.acquire(&bp.id, &env.id).await;
        if self
            .backend
            .content_hash_exists(&bp.id, &env.id, &content_hash)
            .await?
        {
            return Err(RegistryError::Duplicate(format!(
                "identical content already registered for '{}' in '{}'",
                bp.id, env.id
            )));
        }

        let rel_path = versioned_path(&bp, &content.file_name, &content_hash);
        self.assets.write_new(&env.id, &rel_path, &content.bytes)?;

        let new = NewFileInstance {
            stage: bp.stage,
            blueprint_id: bp.id.clone(),
            env_id: env.id.clone(),
            rel_path: rel_path.clone(),
            content_hash,
            size_bytes: content.bytes.len() as i64,
            structure: content.structure.clone(),
            validation_summary: Some(summary),
            created_by: actor.id.clone(),
            parents: parents.to_vec(),
            comment: None,
        };

        match self.backend.commit_version(&new).await {
            Ok(instance) => {
                info!(
                    file = %instance.file_ref(),
                    env = %env.id,
                    blueprint = %bp.id,
                    "registered new version"
                );
                Ok(instance)
            }
            Err(e) => {
                if let Err(cleanup) = self.assets.remove_file(&env.id, &rel_path) {
                    warn!(path = %rel_path, error = %cleanup, "failed to remove orphaned upload");
                }
                Err(e)
            }
        }
    }

    /// Records a governance decision. Re-signing is allowed and only appends.
    pub async fn sign_off(
        &self,
        actor: &Actor,
        file: FileRef,
        action: SignOffAction,
        capacity: Capacity,
        comment: &str,
    ) -> Result<AuditEntry> {
        if comment.trim().is_empty() {
            return Err(RegistryError::validation("a sign-off comment is required"));
        }

        let instance = self
            .backend
            .get_instance(file)
            .await?
            .ok_or_else(|| RegistryError::not_found(format!("file instance {}", file)))?;
        let bp = self
            .backend
            .get_blueprint(&instance.blueprint_id)
            .await?
            .ok_or_else(|| {
                RegistryError::not_found(format!("blueprint '{}'", instance.blueprint_id))
            })?;
        authorize(actor, capacity, &bp)?;

        let entry = self
            .backend
            .record_signoff(&NewAuditEntry {
                actor: actor.id.clone(),
                action: action.audit_action(),
                target: Target::File(file),
                capacity,
                comment: Some(comment.trim().to_string()),
            })
            .await?;

        info!(
            file = %file,
            action = %action,
            capacity = %capacity,
            actor = %actor.id,
            "sign-off recorded"
        );
        Ok(entry)
    }

    pub async fn status(&self, file: FileRef) -> Result<GovernanceStatus> {
        Ok(self.governed(file).await?.status)
    }

    pub async fn governed(&self, file: FileRef) -> Result<GovernedInstance> {
        let instance = self
            .backend
            .get_instance(file)
            .await?
            .ok_or_else(|| RegistryError::not_found(format!("file instance {}", file)))?;
        let bp = self
            .backend
            .get_blueprint(&instance.blueprint_id)
            .await?
            .ok_or_else(|| {
                RegistryError::not_found(format!("blueprint '{}'", instance.blueprint_id))
            })?;
        let entries = self.backend.audit_for_target(&Target::File(file)).await?;
        let status = derive_status(instance.status, bp.workflow, &entries);
        Ok(GovernedInstance { instance, status })
    }

    /// Every instance of an environment with its status, optionally for one stage.
    pub async fn list(&self, env_id: &str, only: Option<Stage>) -> Result<Vec<GovernedInstance>> {
        let instances = self
            .backend
            .list_instances(&InstanceFilter {
                env_id: Some(env_id.to_string()),
                stage: only,
                ..Default::default()
            })
            .await?;
        let workflows = self.workflows().await?;

        let mut out = Vec::with_capacity(instances.len());
        for stage in Stage::ALL.iter().filter(|s| only.map_or(true, |o| o == **s)) {
            let entries = self.backend.audit_for_env_files(env_id, *stage).await?;
            for instance in instances.iter().filter(|i| i.stage == *stage) {
                let trail: Vec<AuditEntry> = entries
                    .iter()
                    .filter(|e| e.target.as_file() == Some(instance.file_ref()))
                    .cloned()
                    .collect();
                let workflow = workflows
                    .iter()
                    .find(|(id, _)| *id == instance.blueprint_id)
                    .map_or(Workflow::DoerAndReviewer, |(_, w)| *w);
                out.push(GovernedInstance {
                    instance: instance.clone(),
                    status: derive_status(instance.status, workflow, &trail),
                });
            }
        }
        out.sort_by_key(|g| g.instance.id);
        Ok(out)
    }

    /// Work waiting on `actor` in one stage of an environment.
    pub async fn inbox(&self, actor: &Actor, env_id: &str, stage: Stage) -> Result<Inbox> {
        let blueprints = self.backend.list_blueprints(Some(stage)).await?;
        let active = self
            .backend
            .list_instances(&InstanceFilter {
                env_id: Some(env_id.to_string()),
                stage: Some(stage),
                status: Some(InstanceStatus::Active),
                ..Default::default()
            })
            .await?;
        let entries = self.backend.audit_for_env_files(env_id, stage).await?;

        let mut inbox = Inbox::default();
        for instance in active {
            let Some(bp) = blueprints.iter().find(|b| b.id == instance.blueprint_id) else {
                continue;
            };
            let signed = SignOffState::from_entries(
                entries
                    .iter()
                    .filter(|e| e.target.as_file() == Some(instance.file_ref())),
            );
            if !signed.doer && bp.doer_roles.allows(actor.role) {
                inbox.pending_doer.push(instance);
            } else if signed.doer
                && !signed.reviewer
                && bp.workflow == Workflow::DoerAndReviewer
                && bp.reviewer_roles.allows(actor.role)
            {
                inbox.pending_reviewer.push(instance);
            }
        }
        debug!(
            env = env_id,
            stage = %stage,
            doer = inbox.pending_doer.len(),
            reviewer = inbox.pending_reviewer.len(),
            "built inbox"
        );
        Ok(inbox)
    }

    async fn workflows(&self) -> Result<Vec<(String, Workflow)>> {
        Ok(self
            .backend
            .list_blueprints(None)
            .await?
            .into_iter()
            .map(|b| (b.id, b.workflow))
            .collect())
    }
}

/// Checks that `actor` may sign in `capacity` for `bp`.
pub fn authorize(actor: &Actor, capacity: Capacity, bp: &Blueprint) -> Result<()> {
    let allowed = match capacity {
        Capacity::Doer => bp.doer_roles.allows(actor.role),
        Capacity::Reviewer => bp.reviewer_roles.allows(actor.role),
        Capacity::Owner | Capacity::Admin => actor.is_admin(),
        Capacity::System | Capacity::User => {
            return Err(RegistryError::permission(format!(
                "capacity {} cannot sign off files",
                capacity
            )))
        }
    };
    if allowed {
        Ok(())
    } else {
        Err(RegistryError::permission(format!(
            "role {} cannot sign as {} for blueprint '{}'",
            actor.role, capacity, bp.id
        )))
    }
}

/// `<stage folder>/<blueprint>_<UTC timestamp>_<hash prefix><ext>`.
fn versioned_path(bp: &Blueprint, file_name: &str, content_hash: &str) -> String {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_else(|| bp.expected_extension.to_ascii_lowercase());
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
    format!(
        "{}/{}_{}_{}{}",
        bp.stage.folder(),
        bp.id,
        stamp,
        &content_hash[..8],
        ext
    )
}

fn repeated_parent(parents: &[FileRef]) -> Option<FileRef> {
    let mut seen = BTreeSet::new();
    parents.iter().copied().find(|p| !seen.insert(*p))
}
