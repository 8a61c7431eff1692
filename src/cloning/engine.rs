use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::assets::AssetTree;
use crate::error::{RegistryError, Result};
use crate::governance::validation::validate_new_environment;
use crate::state::backend::RegistryBackend;
use crate::state::kinds::*;
use crate::state::models::*;

/// What to clone, where to, and how.
#[derive(Debug, Clone)]
pub struct CloneRequest {
    pub source_env_id: String,
    pub new_env: NewEnvironment,
    pub profile: VersioningProfile,
    pub stages: BTreeSet<Stage>,
    /// Environment whose project plan is copied into the new one, if any.
    pub plan_source_env_id: Option<String>,
    pub comment: Option<String>,
}

impl CloneRequest {
    /// Clone every stage of `source_env_id` with `profile`, no plan.
    pub fn all_stages(
        source_env_id: impl Into<String>,
        new_env: NewEnvironment,
        profile: VersioningProfile,
    ) -> Self {
        Self {
            source_env_id: source_env_id.into(),
            new_env,
            profile,
            stages: Stage::ALL.iter().copied().collect(),
            plan_source_env_id: None,
            comment: None,
        }
    }
}

/// Profile-driven deep copy of environments.
pub struct CloneEngine {
    backend: Arc<dyn RegistryBackend>,
    assets: AssetTree,
}

impl CloneEngine {
    pub fn new(backend: Arc<dyn RegistryBackend>, assets: AssetTree) -> Self {
        Self { backend, assets }
    }

    /// Copies the physical tree, then the records in one transaction. If the
    /// transaction fails the new tree is deleted again.
    pub async fn clone_environment(
        &self,
        actor: &Actor,
        req: &CloneRequest,
    ) -> Result<CloneReport> {
        if !actor.is_admin() {
            return Err(RegistryError::permission("only admins can clone environments"));
        }
        validate_new_environment(&req.new_env)?;

        let source = self
            .backend
            .get_environment(&req.source_env_id)
            .await?
            .ok_or_else(|| {
                RegistryError::not_found(format!("environment '{}'", req.source_env_id))
            })?;
        if self.backend.get_environment(&req.new_env.id).await?.is_some() {
            return Err(RegistryError::validation(format!(
                "environment '{}' already exists",
                req.new_env.id
            )));
        }
        if self
            .backend
            .list_environments()
            .await?
            .iter()
            .any(|e| e.name == req.new_env.name)
        {
            return Err(RegistryError::validation(format!(
                "environment name '{}' is already taken",
                req.new_env.name
            )));
        }
        if let Some(plan_source) = &req.plan_source_env_id {
            if self.backend.get_environment(plan_source).await?.is_none() {
                return Err(RegistryError::not_found(format!(
                    "plan source environment '{}'",
                    plan_source
                )));
            }
        }

        self.assets
            .clone_tree(&source.id, &req.new_env.id, &req.stages)?;

        let records = CloneRecords {
            source_env_id: source.id.clone(),
            new_env: req.new_env.clone(),
            profile: req.profile,
            stages: req.stages.clone(),
            plan_source_env_id: req.plan_source_env_id.clone(),
            comment: req.comment.clone(),
        };
        let mut report = match self.backend.clone_records(actor, &records).await {
            Ok(report) => report,
            Err(e) => {
                if let Err(cleanup) = self.assets.remove_env_tree(&req.new_env.id) {
                    warn!(
                        env = %req.new_env.id,
                        error = %cleanup,
                        "failed to remove partial clone tree"
                    );
                }
                return Err(e);
            }
        };

        // Rows point at files the copied tree should contain.
        let cloned = self
            .backend
            .list_instances(&InstanceFilter {
                env_id: Some(req.new_env.id.clone()),
                ..Default::default()
            })
            .await?;
        for instance in cloned {
            if !self.assets.exists(&instance.env_id, &instance.rel_path) {
                report.warnings.push(format!(
                    "{} has no physical file at {}",
                    instance.file_ref(),
                    instance.rel_path
                ));
            }
        }

        for warning in &report.warnings {
            warn!(env = %req.new_env.id, "{}", warning);
        }
        info!(
            source = %source.id,
            target = %req.new_env.id,
            profile = %req.profile,
            files = report.total_files(),
            lineage = report.lineage_copied,
            replayed = report.audit_replayed,
            "environment cloned"
        );
        Ok(report)
    }

    /// LatestApproved clone of every stage into a locked Reporting environment.
    pub async fn promote_to_reporting(
        &self,
        actor: &Actor,
        source_env_id: &str,
        new_id: &str,
        name: &str,
        comment: Option<&str>,
    ) -> Result<CloneReport> {
        let mut new_env = NewEnvironment::new(new_id, name, Category::Reporting);
        new_env.status = EnvStatus::Locked;
        new_env.purpose = Some(format!("Reporting snapshot of '{}'", source_env_id));

        let mut req =
            CloneRequest::all_stages(source_env_id, new_env, VersioningProfile::LatestApproved);
        req.comment = comment.map(str::to_string);
        self.clone_environment(actor, &req).await
    }
}
