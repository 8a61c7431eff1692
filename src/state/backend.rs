use async_trait::async_trait;
use chrono::NaiveDate;

use super::kinds::*;
use super::models::*;
use crate::error::Result;

/// Storage seam for the registry.
///
/// Every method that writes more than one row does so in a single
/// transaction, and every state change appends its audit entry in that same
/// transaction. Reads never observe a half-applied write.
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    // ─── Initialization ─────────────────────────────────────────────────────

    /// Create tables, indexes and triggers, running migrations as needed.
    async fn initialize(&self) -> Result<()>;

    // ─── Environments ───────────────────────────────────────────────────────

    /// Insert an environment and its CREATE audit entry.
    async fn insert_environment(
        &self,
        actor: &Actor,
        env: &NewEnvironment,
        comment: Option<&str>,
    ) -> Result<Environment>;

    async fn get_environment(&self, id: &str) -> Result<Option<Environment>>;

    async fn list_environments(&self) -> Result<Vec<Environment>>;

    /// Change an environment's status and audit it as UPDATE_STATUS.
    async fn update_environment_status(
        &self,
        actor: &Actor,
        id: &str,
        status: EnvStatus,
        comment: &str,
    ) -> Result<Environment>;

    /// Apply metadata changes and audit them as UPDATE.
    async fn edit_environment(
        &self,
        actor: &Actor,
        id: &str,
        edit: &EnvironmentEdit,
        comment: &str,
    ) -> Result<Environment>;

    /// Append a PRUNE_FILES audit entry for an archived environment.
    async fn record_prune(&self, actor: &Actor, env_id: &str, comment: &str) -> Result<AuditEntry>;

    async fn environment_stats(&self, env_id: &str) -> Result<EnvironmentStats>;

    // ─── Blueprints ─────────────────────────────────────────────────────────

    async fn insert_blueprint(&self, actor: &Actor, blueprint: &NewBlueprint) -> Result<Blueprint>;

    async fn get_blueprint(&self, id: &str) -> Result<Option<Blueprint>>;

    async fn list_blueprints(&self, stage: Option<Stage>) -> Result<Vec<Blueprint>>;

    async fn set_blueprint_status(
        &self,
        actor: &Actor,
        id: &str,
        status: BlueprintStatus,
    ) -> Result<Blueprint>;

    /// Delete a blueprint no file instance references.
    async fn delete_blueprint(&self, actor: &Actor, id: &str) -> Result<()>;

    /// Active blueprints with no file instance in any environment.
    async fn unused_blueprints(&self) -> Result<Vec<Blueprint>>;

    // ─── File instances ─────────────────────────────────────────────────────

    /// Supersede the slot's Active row, insert the new version, append its
    /// CREATE audit entry and its lineage links. All or nothing.
    async fn commit_version(&self, new: &NewFileInstance) -> Result<FileInstance>;

    async fn get_instance(&self, file: FileRef) -> Result<Option<FileInstance>>;

    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<FileInstance>>;

    async fn content_hash_exists(
        &self,
        blueprint_id: &str,
        env_id: &str,
        content_hash: &str,
    ) -> Result<bool>;

    /// Append a sign-off decision. A REJECT also flips the instance to
    /// Rejected. Fails with Validation unless the instance is still Active.
    async fn record_signoff(&self, entry: &NewAuditEntry) -> Result<AuditEntry>;

    /// Active instances with no Doer sign-off yet, oldest first.
    async fn pending_doer_signoffs(&self, limit: usize) -> Result<Vec<FileInstance>>;

    // ─── Lineage ────────────────────────────────────────────────────────────

    async fn lineage_upstream(&self, child: FileRef) -> Result<Vec<LineageLink>>;

    async fn lineage_downstream(&self, parent: FileRef) -> Result<Vec<LineageLink>>;

    // ─── Audit ──────────────────────────────────────────────────────────────

    /// Entries for one target in insertion order.
    async fn audit_for_target(&self, target: &Target) -> Result<Vec<AuditEntry>>;

    /// Entries for every file instance of a stage in an environment, in
    /// insertion order.
    async fn audit_for_env_files(&self, env_id: &str, stage: Stage) -> Result<Vec<AuditEntry>>;

    async fn audit_by_actor(&self, actor: &str, limit: usize) -> Result<Vec<AuditEntry>>;

    /// Entries with `from <= timestamp < to`.
    async fn audit_in_range(&self, from: &str, to: &str) -> Result<Vec<AuditEntry>>;

    async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>>;

    // ─── Cloning ────────────────────────────────────────────────────────────

    /// Create the target environment and copy the selected records into it
    /// in one transaction.
    async fn clone_records(&self, actor: &Actor, request: &CloneRecords) -> Result<CloneReport>;

    // ─── Planning ───────────────────────────────────────────────────────────

    async fn insert_milestone(&self, actor: &Actor, milestone: &NewMilestone) -> Result<Milestone>;

    async fn get_milestone(&self, id: i64) -> Result<Option<Milestone>>;

    async fn list_milestones(&self, env_id: &str) -> Result<Vec<Milestone>>;

    async fn milestones_by_owner(
        &self,
        owner: &str,
        status: Option<MilestoneStatus>,
    ) -> Result<Vec<Milestone>>;

    async fn set_milestone_status(
        &self,
        actor: &Actor,
        id: i64,
        status: MilestoneStatus,
    ) -> Result<Milestone>;

    async fn set_milestone_due_date(
        &self,
        actor: &Actor,
        id: i64,
        due_date: Option<NaiveDate>,
    ) -> Result<Milestone>;

    /// Delete a task; its dependency edges cascade.
    async fn delete_milestone(&self, actor: &Actor, id: i64) -> Result<()>;

    /// Add a finish-to-start edge. Fails with Cycle, leaving the table
    /// untouched, if the edge would close a loop.
    async fn add_dependency(&self, actor: &Actor, task_id: i64, predecessor_id: i64) -> Result<()>;

    async fn remove_dependency(
        &self,
        actor: &Actor,
        task_id: i64,
        predecessor_id: i64,
    ) -> Result<()>;

    async fn plan_snapshot(&self, env_id: &str) -> Result<PlanSnapshot>;

    async fn insert_action_item(&self, actor: &Actor, item: &NewActionItem) -> Result<ActionItem>;

    async fn get_action_item(&self, id: i64) -> Result<Option<ActionItem>>;

    async fn close_action_item(&self, actor: &Actor, id: i64, comment: &str) -> Result<ActionItem>;

    async fn list_action_items(
        &self,
        env_id: &str,
        status: Option<ActionStatus>,
    ) -> Result<Vec<ActionItem>>;

    async fn action_items_by_owner(
        &self,
        owner: &str,
        status: Option<ActionStatus>,
    ) -> Result<Vec<ActionItem>>;

    // ─── Dashboards ─────────────────────────────────────────────────────────

    async fn system_kpis(&self) -> Result<SystemKpis>;
}
