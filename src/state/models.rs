use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::kinds::*;

/// Who is asking. Every mutating operation takes one explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

// ─── Environments ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: String,
    pub name: String,
    pub category: Category,
    pub status: EnvStatus,
    pub allowed_roles: RoleSet,
    pub purpose: Option<String>,
    pub source_environment_id: Option<String>,
    pub created_by: String,
    pub created_at: String,
}

/// Fields supplied when an environment is created or cloned.
#[derive(Debug, Clone)]
pub struct NewEnvironment {
    pub id: String,
    pub name: String,
    pub category: Category,
    pub status: EnvStatus,
    pub allowed_roles: RoleSet,
    pub purpose: Option<String>,
}

impl NewEnvironment {
    pub fn new(id: impl Into<String>, name: impl Into<String>, category: Category) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            category,
            status: EnvStatus::Active,
            allowed_roles: RoleSet::All,
            purpose: None,
        }
    }
}

/// Metadata changes to an existing environment. `None` keeps the stored value.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentEdit {
    pub name: Option<String>,
    pub purpose: Option<String>,
    pub allowed_roles: Option<RoleSet>,
    pub status: Option<EnvStatus>,
}

impl EnvironmentEdit {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.purpose.is_none()
            && self.allowed_roles.is_none()
            && self.status.is_none()
    }
}

/// Per-environment counters for dashboards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentStats {
    pub files_by_stage: BTreeMap<Stage, usize>,
    pub active_files: usize,
    pub plan_tasks: usize,
    pub plan_tasks_complete: usize,
    pub open_action_items: usize,
}

impl EnvironmentStats {
    pub fn total_files(&self) -> usize {
        self.files_by_stage.values().sum()
    }
}

// ─── Blueprints ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blueprint {
    pub id: String,
    pub name: String,
    pub stage: Stage,
    pub purpose: Option<String>,
    pub owner_team: Option<String>,
    pub source_type: Option<SourceType>,
    pub source_name: Option<String>,
    pub source_specifier: Option<String>,
    pub workflow: Workflow,
    pub doer_roles: RoleSet,
    pub reviewer_roles: RoleSet,
    pub expected_extension: String,
    pub min_size_kb: Option<f64>,
    pub max_size_kb: Option<f64>,
    /// `{"columns": [...], "tabs": [...]}`; either key may be absent.
    pub expected_structure: Option<serde_json::Value>,
    pub primary_key_column: Option<String>,
    pub status: BlueprintStatus,
    pub created_by: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewBlueprint {
    pub id: String,
    pub name: String,
    pub stage: Stage,
    pub purpose: Option<String>,
    pub owner_team: Option<String>,
    pub source_type: Option<SourceType>,
    pub source_name: Option<String>,
    pub source_specifier: Option<String>,
    pub workflow: Workflow,
    pub doer_roles: RoleSet,
    pub reviewer_roles: RoleSet,
    pub expected_extension: String,
    pub min_size_kb: Option<f64>,
    pub max_size_kb: Option<f64>,
    pub expected_structure: Option<serde_json::Value>,
    pub primary_key_column: Option<String>,
}

impl NewBlueprint {
    /// A blueprint with admin-only roles, a two-signature workflow and no
    /// size or structure constraints.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        stage: Stage,
        expected_extension: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            stage,
            purpose: None,
            owner_team: None,
            source_type: None,
            source_name: None,
            source_specifier: None,
            workflow: Workflow::DoerAndReviewer,
            doer_roles: RoleSet::default(),
            reviewer_roles: RoleSet::default(),
            expected_extension: expected_extension.into(),
            min_size_kb: None,
            max_size_kb: None,
            expected_structure: None,
            primary_key_column: None,
        }
    }
}

// ─── File instances ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInstance {
    pub id: i64,
    pub stage: Stage,
    pub blueprint_id: String,
    pub env_id: String,
    /// Path relative to the environment folder, e.g. `models/x_20240101T000000_ab12cd34.py`.
    pub rel_path: String,
    pub content_hash: String,
    pub size_bytes: i64,
    pub structure: Option<serde_json::Value>,
    pub validation_summary: Option<String>,
    pub status: InstanceStatus,
    pub created_by: String,
    pub created_at: String,
}

impl FileInstance {
    pub fn file_ref(&self) -> FileRef {
        FileRef::new(self.stage, self.id)
    }
}

/// A validated version ready to be committed.
#[derive(Debug, Clone)]
pub struct NewFileInstance {
    pub stage: Stage,
    pub blueprint_id: String,
    pub env_id: String,
    pub rel_path: String,
    pub content_hash: String,
    pub size_bytes: i64,
    pub structure: Option<serde_json::Value>,
    pub validation_summary: Option<String>,
    pub created_by: String,
    pub parents: Vec<FileRef>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub env_id: Option<String>,
    pub stage: Option<Stage>,
    pub blueprint_id: Option<String>,
    pub status: Option<InstanceStatus>,
}

// ─── Audit & lineage ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: String,
    pub actor: String,
    pub action: AuditAction,
    pub target: Target,
    pub capacity: Capacity,
    pub comment: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub actor: String,
    pub action: AuditAction,
    pub target: Target,
    pub capacity: Capacity,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageLink {
    pub id: i64,
    pub parent: FileRef,
    pub child: FileRef,
    pub created_at: String,
}

// ─── Planning ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub id: i64,
    pub env_id: String,
    pub title: String,
    pub duration_days: i64,
    /// Only meaningful on roots; derived tasks get their dates from the scheduler.
    pub due_date: Option<NaiveDate>,
    pub owner: String,
    pub status: MilestoneStatus,
    pub target: Option<Target>,
    pub created_by: String,
    pub created_at: String,
}

impl Milestone {
    pub fn effective_duration(&self) -> i64 {
        self.duration_days.max(1)
    }
}

#[derive(Debug, Clone)]
pub struct NewMilestone {
    pub env_id: String,
    pub title: String,
    pub duration_days: i64,
    pub due_date: Option<NaiveDate>,
    pub owner: String,
    pub predecessor_ids: Vec<i64>,
    pub target: Option<Target>,
}

/// Finish-to-start edge: `task_id` cannot start before `predecessor_task_id` ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dependency {
    pub task_id: i64,
    pub predecessor_task_id: i64,
}

/// Everything the scheduler needs for one environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanSnapshot {
    pub env_id: String,
    pub milestones: Vec<Milestone>,
    pub dependencies: Vec<Dependency>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionItem {
    pub id: i64,
    pub env_id: String,
    pub description: String,
    pub owner: String,
    pub due_date: Option<NaiveDate>,
    pub status: ActionStatus,
    pub target: Option<Target>,
    pub created_by: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewActionItem {
    pub env_id: String,
    pub description: String,
    pub owner: String,
    pub due_date: Option<NaiveDate>,
    pub target: Option<Target>,
}

// ─── Cloning ────────────────────────────────────────────────────────────────

/// Record-level half of an environment clone. The asset tree is copied
/// separately before this runs.
#[derive(Debug, Clone)]
pub struct CloneRecords {
    pub source_env_id: String,
    pub new_env: NewEnvironment,
    pub profile: VersioningProfile,
    pub stages: BTreeSet<Stage>,
    pub plan_source_env_id: Option<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanCloneReport {
    pub source_env_id: String,
    pub tasks_cloned: usize,
    pub dependencies_cloned: usize,
    pub dependencies_dropped: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneReport {
    pub environment: Environment,
    pub profile: VersioningProfile,
    pub files_cloned: BTreeMap<Stage, usize>,
    /// Old instance id -> new instance id.
    pub id_map: BTreeMap<i64, i64>,
    pub lineage_copied: usize,
    pub lineage_dropped: usize,
    pub audit_replayed: usize,
    pub plan: Option<PlanCloneReport>,
    pub warnings: Vec<String>,
}

impl CloneReport {
    pub fn total_files(&self) -> usize {
        self.files_cloned.values().sum()
    }
}

// ─── Dashboards ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemKpis {
    pub environments: usize,
    pub active_environments: usize,
    pub blueprints: usize,
    pub files_by_stage: BTreeMap<Stage, usize>,
    pub active_files: usize,
    pub audit_entries: usize,
    pub milestones: usize,
    pub open_action_items: usize,
}
