use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::assets::AssetTree;
use crate::cloning::{CloneEngine, CloneRequest};
use crate::config::Settings;
use crate::connector::ExternalFetcher;
use crate::error::{RegistryError, Result};
use crate::governance::validation::{validate_new_blueprint, validate_new_environment};
use crate::governance::{Content, GovernanceEngine, GovernedInstance, Inbox};
use crate::health::{run_health_checks, HealthReport};
use crate::planning::{Planner, Schedule};
use crate::retry::with_retry;
use crate::state::backend::RegistryBackend;
use crate::state::kinds::*;
use crate::state::models::*;
use crate::state::sqlite::SqliteBackend;

/// One database plus one asset tree, with every engine wired to both.
pub struct Registry {
    backend: Arc<dyn RegistryBackend>,
    assets: AssetTree,
    governance: GovernanceEngine,
    cloning: CloneEngine,
    planner: Planner,
    fetcher: ExternalFetcher,
    conflict_retries: u32,
    retry_base_delay_ms: u64,
}

impl Registry {
    /// Opens (creating if needed) the database and asset root from `settings`.
    pub async fn open(settings: &Settings) -> Result<Self> {
        let backend = SqliteBackend::open(
            &settings.database_path,
            Duration::from_millis(settings.busy_timeout_ms),
        )?;
        Self::assemble(Arc::new(backend), settings).await
    }

    /// In-memory database over a real asset tree.
    pub async fn in_memory(asset_root: impl Into<PathBuf>) -> Result<Self> {
        let settings = Settings {
            asset_root: asset_root.into(),
            ..Settings::default()
        };
        Self::assemble(Arc::new(SqliteBackend::open_memory()?), &settings).await
    }

    pub async fn with_backend(
        backend: Arc<dyn RegistryBackend>,
        settings: &Settings,
    ) -> Result<Self> {
        Self::assemble(backend, settings).await
    }

    async fn assemble(backend: Arc<dyn RegistryBackend>, settings: &Settings) -> Result<Self> {
        backend.initialize().await?;
        std::fs::create_dir_all(&settings.asset_root)?;
        let assets = AssetTree::new(&settings.asset_root);
        let fetcher = ExternalFetcher::new(
            settings.approved_domains.clone(),
            Duration::from_secs(settings.http_timeout_secs),
        )?;
        Ok(Self {
            governance: GovernanceEngine::new(backend.clone(), assets.clone()),
            cloning: CloneEngine::new(backend.clone(), assets.clone()),
            planner: Planner::new(backend.clone()),
            backend,
            assets,
            fetcher,
            conflict_retries: settings.conflict_retries,
            retry_base_delay_ms: settings.retry_base_delay_ms,
        })
    }

    pub fn backend(&self) -> &Arc<dyn RegistryBackend> {
        &self.backend
    }

    pub fn assets(&self) -> &AssetTree {
        &self.assets
    }

    pub fn governance(&self) -> &GovernanceEngine {
        &self.governance
    }

    pub fn cloning(&self) -> &CloneEngine {
        &self.cloning
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    pub fn fetcher(&self) -> &ExternalFetcher {
        &self.fetcher
    }

    // ─── Environments ───────────────────────────────────────────────────────

    /// Creates the folder tree first, then the row; the tree is removed if
    /// the row cannot be written.
    pub async fn create_environment(
        &self,
        actor: &Actor,
        env: &NewEnvironment,
        comment: Option<&str>,
    ) -> Result<Environment> {
        require_admin(actor, "create environments")?;
        validate_new_environment(env)?;
        if self.backend.get_environment(&env.id).await?.is_some() {
            return Err(RegistryError::validation(format!(
                "environment '{}' already exists",
                env.id
            )));
        }

        self.assets.create_env_tree(&env.id)?;
        match self.backend.insert_environment(actor, env, comment).await {
            Ok(created) => {
                info!(env = %created.id, category = %created.category, "environment created");
                Ok(created)
            }
            Err(e) => {
                if let Err(cleanup) = self.assets.remove_env_tree(&env.id) {
                    warn!(env = %env.id, error = %cleanup, "failed to remove environment tree");
                }
                Err(e)
            }
        }
    }

    pub async fn get_environment(&self, id: &str) -> Result<Environment> {
        self.backend
            .get_environment(id)
            .await?
            .ok_or_else(|| RegistryError::not_found(format!("environment '{}'", id)))
    }

    pub async fn list_environments(&self) -> Result<Vec<Environment>> {
        self.backend.list_environments().await
    }

    /// Environments `role` may work in. Archived ones are hidden from
    /// everyone but admins.
    pub async fn visible_environments(&self, role: Role) -> Result<Vec<Environment>> {
        Ok(self
            .backend
            .list_environments()
            .await?
            .into_iter()
            .filter(|e| e.allowed_roles.allows(role))
            .filter(|e| role == Role::Admin || e.status != EnvStatus::Archived)
            .collect())
    }

    pub async fn update_environment_status(
        &self,
        actor: &Actor,
        id: &str,
        status: EnvStatus,
        comment: &str,
    ) -> Result<Environment> {
        require_admin(actor, "change environment status")?;
        let env = self
            .backend
            .update_environment_status(actor, id, status, comment)
            .await?;
        info!(env = %env.id, status = %env.status, "environment status updated");
        Ok(env)
    }

    /// Changes name, purpose, allowed roles or status in one audited update.
    /// The asset folder keeps its id-based name.
    pub async fn edit_environment(
        &self,
        actor: &Actor,
        id: &str,
        edit: &EnvironmentEdit,
        comment: &str,
    ) -> Result<Environment> {
        require_admin(actor, "edit environments")?;
        if comment.trim().is_empty() {
            return Err(RegistryError::validation("an edit comment is required"));
        }
        let env = self
            .backend
            .edit_environment(actor, id, edit, comment.trim())
            .await?;
        info!(
            env = %env.id,
            roles = %env.allowed_roles,
            status = %env.status,
            "environment edited"
        );
        Ok(env)
    }

    /// Deletes the physical files of an archived environment. Rows and audit
    /// history are kept.
    pub async fn prune_environment(
        &self,
        actor: &Actor,
        id: &str,
        comment: &str,
    ) -> Result<AuditEntry> {
        require_admin(actor, "prune environments")?;
        let env = self.get_environment(id).await?;
        if env.status != EnvStatus::Archived {
            return Err(RegistryError::validation(format!(
                "only archived environments can be pruned; '{}' is {}",
                env.id, env.status
            )));
        }
        self.assets.remove_env_tree(&env.id)?;
        let entry = self.backend.record_prune(actor, &env.id, comment).await?;
        info!(env = %env.id, "environment files pruned");
        Ok(entry)
    }

    pub async fn environment_stats(&self, id: &str) -> Result<EnvironmentStats> {
        self.backend.environment_stats(id).await
    }

    // ─── Blueprints ─────────────────────────────────────────────────────────

    pub async fn create_blueprint(&self, actor: &Actor, bp: &NewBlueprint) -> Result<Blueprint> {
        require_admin(actor, "create blueprints")?;
        validate_new_blueprint(bp)?;
        let created = self.backend.insert_blueprint(actor, bp).await?;
        info!(blueprint = %created.id, stage = %created.stage, "blueprint created");
        Ok(created)
    }

    pub async fn get_blueprint(&self, id: &str) -> Result<Blueprint> {
        self.backend
            .get_blueprint(id)
            .await?
            .ok_or_else(|| RegistryError::not_found(format!("blueprint '{}'", id)))
    }

    pub async fn list_blueprints(&self, stage: Option<Stage>) -> Result<Vec<Blueprint>> {
        self.backend.list_blueprints(stage).await
    }

    pub async fn archive_blueprint(&self, actor: &Actor, id: &str) -> Result<Blueprint> {
        require_admin(actor, "archive blueprints")?;
        self.backend
            .set_blueprint_status(actor, id, BlueprintStatus::Archived)
            .await
    }

    pub async fn delete_blueprint(&self, actor: &Actor, id: &str) -> Result<()> {
        require_admin(actor, "delete blueprints")?;
        self.backend.delete_blueprint(actor, id).await
    }

    // ─── Files ──────────────────────────────────────────────────────────────

    pub async fn create_version(
        &self,
        actor: &Actor,
        env_id: &str,
        blueprint_id: &str,
        content: &Content,
        parents: &[FileRef],
    ) -> Result<FileInstance> {
        with_retry(
            self.conflict_retries,
            self.retry_base_delay_ms,
            "create_version",
            || {
                self.governance
                    .create_version(actor, env_id, blueprint_id, content, parents)
            },
        )
        .await
    }

    pub async fn sign_off(
        &self,
        actor: &Actor,
        file: FileRef,
        action: SignOffAction,
        capacity: Capacity,
        comment: &str,
    ) -> Result<AuditEntry> {
        with_retry(
            self.conflict_retries,
            self.retry_base_delay_ms,
            "sign_off",
            || self.governance.sign_off(actor, file, action, capacity, comment),
        )
        .await
    }

    /// Downloads an External Connection blueprint and registers the result.
    pub async fn fetch_external(
        &self,
        actor: &Actor,
        env_id: &str,
        blueprint_id: &str,
        parents: &[FileRef],
    ) -> Result<FileInstance> {
        let bp = self.get_blueprint(blueprint_id).await?;
        if !bp.doer_roles.allows(actor.role) {
            return Err(RegistryError::permission(format!(
                "role {} cannot fetch for blueprint '{}'",
                actor.role, bp.id
            )));
        }
        let content = self.fetcher.fetch(&bp).await?;
        self.create_version(actor, env_id, &bp.id, &content, parents)
            .await
    }

    pub async fn governance_status(&self, file: FileRef) -> Result<GovernedInstance> {
        self.governance.governed(file).await
    }

    pub async fn list_files(
        &self,
        env_id: &str,
        stage: Option<Stage>,
    ) -> Result<Vec<GovernedInstance>> {
        self.get_environment(env_id).await?;
        self.governance.list(env_id, stage).await
    }

    pub async fn inbox(&self, actor: &Actor, env_id: &str, stage: Stage) -> Result<Inbox> {
        self.governance.inbox(actor, env_id, stage).await
    }

    pub async fn pending_doer_signoffs(&self, limit: usize) -> Result<Vec<FileInstance>> {
        self.backend.pending_doer_signoffs(limit).await
    }

    // ─── Lineage & audit ────────────────────────────────────────────────────

    pub async fn lineage_upstream(&self, file: FileRef) -> Result<Vec<LineageLink>> {
        self.backend.lineage_upstream(file).await
    }

    pub async fn lineage_downstream(&self, file: FileRef) -> Result<Vec<LineageLink>> {
        self.backend.lineage_downstream(file).await
    }

    pub async fn audit_for(&self, target: &Target) -> Result<Vec<AuditEntry>> {
        self.backend.audit_for_target(target).await
    }

    pub async fn audit_by_actor(&self, actor: &str, limit: usize) -> Result<Vec<AuditEntry>> {
        self.backend.audit_by_actor(actor, limit).await
    }

    pub async fn audit_in_range(&self, from: &str, to: &str) -> Result<Vec<AuditEntry>> {
        self.backend.audit_in_range(from, to).await
    }

    pub async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        self.backend.recent_audit(limit).await
    }

    // ─── Cloning ────────────────────────────────────────────────────────────

    pub async fn clone_environment(
        &self,
        actor: &Actor,
        req: &CloneRequest,
    ) -> Result<CloneReport> {
        with_retry(
            self.conflict_retries,
            self.retry_base_delay_ms,
            "clone_environment",
            || self.cloning.clone_environment(actor, req),
        )
        .await
    }

    pub async fn promote_to_reporting(
        &self,
        actor: &Actor,
        source_env_id: &str,
        new_id: &str,
        name: &str,
        comment: Option<&str>,
    ) -> Result<CloneReport> {
        self.cloning
            .promote_to_reporting(actor, source_env_id, new_id, name, comment)
            .await
    }

    // ─── Planning ───────────────────────────────────────────────────────────

    pub async fn create_milestone(&self, actor: &Actor, new: &NewMilestone) -> Result<i64> {
        self.planner.create_milestone(actor, new).await
    }

    pub async fn add_dependency(
        &self,
        actor: &Actor,
        task_id: i64,
        predecessor_id: i64,
    ) -> Result<()> {
        self.planner
            .add_dependency(actor, task_id, predecessor_id)
            .await
    }

    pub async fn compute_schedule(&self, env_id: &str) -> Result<Schedule> {
        self.get_environment(env_id).await?;
        self.planner.compute_schedule(env_id).await
    }

    // ─── Dashboards ─────────────────────────────────────────────────────────

    pub async fn health(&self) -> Result<HealthReport> {
        run_health_checks(self.backend.as_ref(), &self.assets).await
    }

    pub async fn system_kpis(&self) -> Result<SystemKpis> {
        self.backend.system_kpis().await
    }
}

fn require_admin(actor: &Actor, what: &str) -> Result<()> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(RegistryError::permission(format!("only admins can {}", what)))
    }
}
