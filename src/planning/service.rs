use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{debug, info};

use super::scheduler::{compute_schedule, Schedule};
use crate::error::{RegistryError, Result};
use crate::state::backend::RegistryBackend;
use crate::state::kinds::*;
use crate::state::models::*;

/// Longest task accepted, in days.
pub const MAX_DURATION_DAYS: i64 = 36_500;

/// Project plans and action items for an environment.
pub struct Planner {
    backend: Arc<dyn RegistryBackend>,
}

impl Planner {
    pub fn new(backend: Arc<dyn RegistryBackend>) -> Self {
        Self { backend }
    }

    async fn require_access(&self, actor: &Actor, env_id: &str) -> Result<Environment> {
        let env = self
            .backend
            .get_environment(env_id)
            .await?
            .ok_or_else(|| RegistryError::not_found(format!("environment '{}'", env_id)))?;
        if !env.allowed_roles.allows(actor.role) {
            return Err(RegistryError::permission(format!(
                "role {} has no access to environment '{}'",
                actor.role, env.id
            )));
        }
        Ok(env)
    }

    async fn require_milestone(&self, id: i64) -> Result<Milestone> {
        self.backend
            .get_milestone(id)
            .await?
            .ok_or_else(|| RegistryError::not_found(format!("milestone #{}", id)))
    }

    // ─── Milestones ─────────────────────────────────────────────────────────

    /// Creates a task with its predecessor edges. Returns the new id.
    pub async fn create_milestone(&self, actor: &Actor, new: &NewMilestone) -> Result<i64> {
        self.require_access(actor, &new.env_id).await?;
        if new.title.trim().is_empty() {
            return Err(RegistryError::validation("milestone title is required"));
        }
        if new.owner.trim().is_empty() {
            return Err(RegistryError::validation("milestone owner is required"));
        }
        if new.duration_days < 1 {
            return Err(RegistryError::validation(format!(
                "duration must be at least 1 day, got {}",
                new.duration_days
            )));
        }
        if new.duration_days > MAX_DURATION_DAYS {
            return Err(RegistryError::validation(format!(
                "duration may not exceed {} days, got {}",
                MAX_DURATION_DAYS, new.duration_days
            )));
        }

        let created = self.backend.insert_milestone(actor, new).await?;
        info!(
            env = %created.env_id,
            milestone = created.id,
            predecessors = new.predecessor_ids.len(),
            "milestone created"
        );
        Ok(created.id)
    }

    pub async fn complete(&self, actor: &Actor, id: i64) -> Result<Milestone> {
        self.set_status(actor, id, MilestoneStatus::Complete).await
    }

    pub async fn reopen(&self, actor: &Actor, id: i64) -> Result<Milestone> {
        self.set_status(actor, id, MilestoneStatus::Pending).await
    }

    async fn set_status(
        &self,
        actor: &Actor,
        id: i64,
        status: MilestoneStatus,
    ) -> Result<Milestone> {
        let m = self.require_milestone(id).await?;
        self.require_access(actor, &m.env_id).await?;
        self.backend.set_milestone_status(actor, id, status).await
    }

    pub async fn set_due_date(
        &self,
        actor: &Actor,
        id: i64,
        due_date: Option<NaiveDate>,
    ) -> Result<Milestone> {
        let m = self.require_milestone(id).await?;
        self.require_access(actor, &m.env_id).await?;
        self.backend.set_milestone_due_date(actor, id, due_date).await
    }

    pub async fn delete_milestone(&self, actor: &Actor, id: i64) -> Result<()> {
        let m = self.require_milestone(id).await?;
        self.require_access(actor, &m.env_id).await?;
        self.backend.delete_milestone(actor, id).await
    }

    pub async fn add_dependency(
        &self,
        actor: &Actor,
        task_id: i64,
        predecessor_id: i64,
    ) -> Result<()> {
        let task = self.require_milestone(task_id).await?;
        self.require_access(actor, &task.env_id).await?;
        self.backend
            .add_dependency(actor, task_id, predecessor_id)
            .await?;
        debug!(task = task_id, predecessor = predecessor_id, "dependency added");
        Ok(())
    }

    pub async fn remove_dependency(
        &self,
        actor: &Actor,
        task_id: i64,
        predecessor_id: i64,
    ) -> Result<()> {
        let task = self.require_milestone(task_id).await?;
        self.require_access(actor, &task.env_id).await?;
        self.backend
            .remove_dependency(actor, task_id, predecessor_id)
            .await
    }

    pub async fn list_milestones(&self, env_id: &str) -> Result<Vec<Milestone>> {
        self.backend.list_milestones(env_id).await
    }

    pub async fn milestones_for_owner(
        &self,
        owner: &str,
        status: Option<MilestoneStatus>,
    ) -> Result<Vec<Milestone>> {
        self.backend.milestones_by_owner(owner, status).await
    }

    /// Backward schedule over a single read of the plan.
    pub async fn compute_schedule(&self, env_id: &str) -> Result<Schedule> {
        let snapshot = self.backend.plan_snapshot(env_id).await?;
        let schedule = compute_schedule(&snapshot);
        debug!(
            env = env_id,
            scheduled = schedule.tasks.len(),
            cycles = schedule.cycle_errors.len(),
            warnings = schedule.warnings.len(),
            "schedule computed"
        );
        Ok(schedule)
    }

    // ─── Action items ───────────────────────────────────────────────────────

    pub async fn create_action_item(
        &self,
        actor: &Actor,
        item: &NewActionItem,
    ) -> Result<ActionItem> {
        self.require_access(actor, &item.env_id).await?;
        if item.description.trim().is_empty() {
            return Err(RegistryError::validation("action item description is required"));
        }
        if item.owner.trim().is_empty() {
            return Err(RegistryError::validation("action item owner is required"));
        }
        self.backend.insert_action_item(actor, item).await
    }

    pub async fn close_action_item(
        &self,
        actor: &Actor,
        id: i64,
        comment: &str,
    ) -> Result<ActionItem> {
        let item = self
            .backend
            .get_action_item(id)
            .await?
            .ok_or_else(|| RegistryError::not_found(format!("action item #{}", id)))?;
        self.require_access(actor, &item.env_id).await?;
        if comment.trim().is_empty() {
            return Err(RegistryError::validation("a closing comment is required"));
        }
        self.backend.close_action_item(actor, id, comment.trim()).await
    }

    pub async fn action_items(
        &self,
        env_id: &str,
        status: Option<ActionStatus>,
    ) -> Result<Vec<ActionItem>> {
        self.backend.list_action_items(env_id, status).await
    }

    pub async fn action_items_for_owner(
        &self,
        owner: &str,
        status: Option<ActionStatus>,
    ) -> Result<Vec<ActionItem>> {
        self.backend.action_items_by_owner(owner, status).await
    }
}
