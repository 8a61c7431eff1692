use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, SecondsFormat};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::backend::RegistryBackend;
use super::kinds::*;
use super::migration;
use super::models::*;
use super::replicate;
use super::rows::*;
use crate::error::{RegistryError, Result};
use crate::planning::graph;

/// SQLite-backed registry store.
///
/// A single connection behind a mutex; every multi-row write runs in an
/// IMMEDIATE transaction so the write lock is taken up front and a busy
/// database surfaces as a retryable conflict instead of a mid-write failure.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open or create the registry database.
    pub fn open(db_path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(dir) = db_path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| RegistryError::Storage("connection mutex poisoned".to_string()))
    }
}

/// UTC timestamp with microseconds; sorts lexicographically.
pub(crate) fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn append_audit(
    conn: &Connection,
    timestamp: &str,
    actor: &str,
    action: AuditAction,
    target: &Target,
    capacity: Capacity,
    comment: Option<&str>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO audit_log (timestamp, actor, action, target_kind, target_id, capacity, comment)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            timestamp,
            actor,
            action,
            target.kind(),
            target.id_text(),
            capacity,
            comment
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn fetch_audit(conn: &Connection, id: i64) -> Result<AuditEntry> {
    let sql = format!("SELECT {} FROM audit_log WHERE id = ?1", AUDIT_COLUMNS);
    Ok(conn.query_row(&sql, params![id], audit_from_row)?)
}

pub(crate) fn fetch_environment(conn: &Connection, id: &str) -> Result<Option<Environment>> {
    let sql = format!("SELECT {} FROM environments WHERE id = ?1", ENVIRONMENT_COLUMNS);
    Ok(conn
        .query_row(&sql, params![id], environment_from_row)
        .optional()?)
}

fn fetch_blueprint(conn: &Connection, id: &str) -> Result<Option<Blueprint>> {
    let sql = format!("SELECT {} FROM blueprints WHERE id = ?1", BLUEPRINT_COLUMNS);
    Ok(conn
        .query_row(&sql, params![id], blueprint_from_row)
        .optional()?)
}

fn fetch_instance(conn: &Connection, file: FileRef) -> Result<Option<FileInstance>> {
    let sql = format!(
        "SELECT {} FROM file_instances WHERE id = ?1 AND stage = ?2",
        INSTANCE_COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![file.id, file.stage], instance_from_row)
        .optional()?)
}

fn fetch_milestone(conn: &Connection, id: i64) -> Result<Option<Milestone>> {
    let sql = format!("SELECT {} FROM milestones WHERE id = ?1", MILESTONE_COLUMNS);
    Ok(conn
        .query_row(&sql, params![id], milestone_from_row)
        .optional()?)
}

fn fetch_action_item(conn: &Connection, id: i64) -> Result<Option<ActionItem>> {
    let sql = format!("SELECT {} FROM action_items WHERE id = ?1", ACTION_ITEM_COLUMNS);
    Ok(conn
        .query_row(&sql, params![id], action_item_from_row)
        .optional()?)
}

fn require_milestone(conn: &Connection, id: i64) -> Result<Milestone> {
    fetch_milestone(conn, id)?.ok_or_else(|| RegistryError::not_found(format!("milestone #{}", id)))
}

fn count(conn: &Connection, sql: &str, args: impl rusqlite::Params) -> Result<usize> {
    let n: i64 = conn.query_row(sql, args, |row| row.get(0))?;
    Ok(n as usize)
}

fn env_dependencies(conn: &Connection, env_id: &str) -> Result<Vec<Dependency>> {
    let mut stmt = conn.prepare(
        "SELECT d.task_id, d.predecessor_task_id FROM dependencies d
         JOIN milestones m ON m.id = d.task_id
         WHERE m.env_id = ?1 ORDER BY d.id",
    )?;
    let rows = stmt
        .query_map(params![env_id], |row| {
            Ok(Dependency {
                task_id: row.get(0)?,
                predecessor_task_id: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn query_audit(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<AuditEntry>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(args, audit_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn stage_counts(conn: &Connection, env_id: Option<&str>) -> Result<BTreeMap<Stage, usize>> {
    let mut counts = BTreeMap::new();
    let mut stmt = conn.prepare(
        "SELECT stage, COUNT(*) FROM file_instances
         WHERE ?1 IS NULL OR env_id = ?1 GROUP BY stage",
    )?;
    let rows = stmt.query_map(params![env_id], |row| {
        Ok((row.get::<_, Stage>(0)?, row.get::<_, i64>(1)?))
    })?;
    for row in rows {
        let (stage, n) = row?;
        counts.insert(stage, n as usize);
    }
    Ok(counts)
}

#[async_trait]
impl RegistryBackend for SqliteBackend {
    // ─── Initialization ─────────────────────────────────────────────────────

    async fn initialize(&self) -> Result<()> {
        let conn = self.lock()?;
        migration::check_and_migrate(&conn)
    }

    // ─── Environments ───────────────────────────────────────────────────────

    async fn insert_environment(
        &self,
        actor: &Actor,
        env: &NewEnvironment,
        comment: Option<&str>,
    ) -> Result<Environment> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if fetch_environment(&tx, &env.id)?.is_some() {
            return Err(RegistryError::validation(format!(
                "environment '{}' already exists",
                env.id
            )));
        }
        if count(
            &tx,
            "SELECT COUNT(*) FROM environments WHERE name = ?1",
            params![env.name],
        )? > 0
        {
            return Err(RegistryError::validation(format!(
                "environment name '{}' is already taken",
                env.name
            )));
        }

        let ts = now();
        tx.execute(
            "INSERT INTO environments (id, name, category, status, allowed_roles, purpose,
                 source_environment_id, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8)",
            params![
                env.id,
                env.name,
                env.category,
                env.status,
                env.allowed_roles,
                env.purpose,
                actor.id,
                ts
            ],
        )?;
        append_audit(
            &tx,
            &ts,
            &actor.id,
            AuditAction::Create,
            &Target::Environment(env.id.clone()),
            Capacity::Admin,
            Some(comment.unwrap_or("Environment created")),
        )?;

        let created = fetch_environment(&tx, &env.id)?
            .ok_or_else(|| RegistryError::Storage("environment vanished after insert".into()))?;
        tx.commit()?;
        Ok(created)
    }

    async fn get_environment(&self, id: &str) -> Result<Option<Environment>> {
        let conn = self.lock()?;
        fetch_environment(&conn, id)
    }

    async fn list_environments(&self) -> Result<Vec<Environment>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM environments ORDER BY id", ENVIRONMENT_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], environment_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn edit_environment(
        &self,
        actor: &Actor,
        id: &str,
        edit: &EnvironmentEdit,
        comment: &str,
    ) -> Result<Environment> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = fetch_environment(&tx, id)?
            .ok_or_else(|| RegistryError::not_found(format!("environment '{}'", id)))?;
        if current.status == EnvStatus::Archived {
            return Err(RegistryError::validation(format!(
                "environment '{}' is archived and cannot be edited",
                id
            )));
        }

        let mut changes = Vec::new();
        let name = match &edit.name {
            Some(name) if name.trim().is_empty() => {
                return Err(RegistryError::validation("environment name is required"));
            }
            Some(name) if name.trim() != current.name => {
                let name = name.trim().to_string();
                if count(
                    &tx,
                    "SELECT COUNT(*) FROM environments WHERE name = ?1 AND id <> ?2",
                    params![name, id],
                )? > 0
                {
                    return Err(RegistryError::validation(format!(
                        "environment name '{}' is already taken",
                        name
                    )));
                }
                changes.push(format!("name '{}' -> '{}'", current.name, name));
                name
            }
            _ => current.name.clone(),
        };
        let purpose = match &edit.purpose {
            Some(p) => {
                let p = p.trim();
                let p = (!p.is_empty()).then(|| p.to_string());
                if p != current.purpose {
                    changes.push("purpose".to_string());
                }
                p
            }
            None => current.purpose.clone(),
        };
        let allowed_roles = match &edit.allowed_roles {
            Some(RoleSet::Only(roles)) if roles.is_empty() => {
                return Err(RegistryError::validation(
                    "an environment needs at least one allowed role",
                ));
            }
            Some(roles) => {
                if *roles != current.allowed_roles {
                    changes.push(format!("roles {} -> {}", current.allowed_roles, roles));
                }
                roles.clone()
            }
            None => current.allowed_roles.clone(),
        };
        let status = edit.status.unwrap_or(current.status);
        if status != current.status {
            changes.push(format!("status {} -> {}", current.status, status));
        }
        if changes.is_empty() {
            return Err(RegistryError::validation(format!(
                "no changes to environment '{}'",
                id
            )));
        }

        tx.execute(
            "UPDATE environments SET name = ?1, purpose = ?2, allowed_roles = ?3, status = ?4
             WHERE id = ?5",
            params![name, purpose, allowed_roles, status, id],
        )?;
        append_audit(
            &tx,
            &now(),
            &actor.id,
            AuditAction::Update,
            &Target::Environment(id.to_string()),
            Capacity::Admin,
            Some(&format!("{}: {}", changes.join("; "), comment)),
        )?;

        let updated = fetch_environment(&tx, id)?
            .ok_or_else(|| RegistryError::not_found(format!("environment '{}'", id)))?;
        tx.commit()?;
        Ok(updated)
    }

    async fn update_environment_status(
        &self,
        actor: &Actor,
        id: &str,
        status: EnvStatus,
        comment: &str,
    ) -> Result<Environment> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = fetch_environment(&tx, id)?
            .ok_or_else(|| RegistryError::not_found(format!("environment '{}'", id)))?;
        if current.status == EnvStatus::Archived && status != EnvStatus::Archived {
            return Err(RegistryError::validation(format!(
                "environment '{}' is archived and cannot be reopened",
                id
            )));
        }

        let ts = now();
        tx.execute(
            "UPDATE environments SET status = ?1 WHERE id = ?2",
            params![status, id],
        )?;
        append_audit(
            &tx,
            &ts,
            &actor.id,
            AuditAction::UpdateStatus,
            &Target::Environment(id.to_string()),
            Capacity::Admin,
            Some(&format!("{} -> {}: {}", current.status, status, comment)),
        )?;

        let updated = fetch_environment(&tx, id)?
            .ok_or_else(|| RegistryError::not_found(format!("environment '{}'", id)))?;
        tx.commit()?;
        Ok(updated)
    }

    async fn record_prune(&self, actor: &Actor, env_id: &str, comment: &str) -> Result<AuditEntry> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let env = fetch_environment(&tx, env_id)?
            .ok_or_else(|| RegistryError::not_found(format!("environment '{}'", env_id)))?;
        if env.status != EnvStatus::Archived {
            return Err(RegistryError::validation(format!(
                "only archived environments can be pruned; '{}' is {}",
                env_id, env.status
            )));
        }

        let id = append_audit(
            &tx,
            &now(),
            &actor.id,
            AuditAction::PruneFiles,
            &Target::Environment(env_id.to_string()),
            Capacity::Admin,
            Some(comment),
        )?;
        let entry = fetch_audit(&tx, id)?;
        tx.commit()?;
        Ok(entry)
    }

    async fn environment_stats(&self, env_id: &str) -> Result<EnvironmentStats> {
        let conn = self.lock()?;
        if fetch_environment(&conn, env_id)?.is_none() {
            return Err(RegistryError::not_found(format!("environment '{}'", env_id)));
        }
        Ok(EnvironmentStats {
            files_by_stage: stage_counts(&conn, Some(env_id))?,
            active_files: count(
                &conn,
                "SELECT COUNT(*) FROM file_instances WHERE env_id = ?1 AND current_status = ?2",
                params![env_id, InstanceStatus::Active],
            )?,
            plan_tasks: count(
                &conn,
                "SELECT COUNT(*) FROM milestones WHERE env_id = ?1",
                params![env_id],
            )?,
            plan_tasks_complete: count(
                &conn,
                "SELECT COUNT(*) FROM milestones WHERE env_id = ?1 AND status = ?2",
                params![env_id, MilestoneStatus::Complete],
            )?,
            open_action_items: count(
                &conn,
                "SELECT COUNT(*) FROM action_items WHERE env_id = ?1 AND status = ?2",
                params![env_id, ActionStatus::Open],
            )?,
        })
    }

    // ─── Blueprints ─────────────────────────────────────────────────────────

    async fn insert_blueprint(&self, actor: &Actor, bp: &NewBlueprint) -> Result<Blueprint> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if fetch_blueprint(&tx, &bp.id)?.is_some() {
            return Err(RegistryError::validation(format!(
                "blueprint '{}' already exists",
                bp.id
            )));
        }
        if count(
            &tx,
            "SELECT COUNT(*) FROM blueprints WHERE name = ?1",
            params![bp.name],
        )? > 0
        {
            return Err(RegistryError::validation(format!(
                "blueprint name '{}' is already taken",
                bp.name
            )));
        }

        let structure = bp
            .expected_structure
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let ts = now();
        tx.execute(
            "INSERT INTO blueprints (id, name, stage, purpose, owner_team, source_type, source_name,
                 source_specifier, workflow, doer_roles, reviewer_roles, expected_extension,
                 min_size_kb, max_size_kb, expected_structure, primary_key_column, status,
                 created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                bp.id,
                bp.name,
                bp.stage,
                bp.purpose,
                bp.owner_team,
                bp.source_type,
                bp.source_name,
                bp.source_specifier,
                bp.workflow,
                bp.doer_roles,
                bp.reviewer_roles,
                bp.expected_extension,
                bp.min_size_kb,
                bp.max_size_kb,
                structure,
                bp.primary_key_column,
                BlueprintStatus::Active,
                actor.id,
                ts
            ],
        )?;
        append_audit(
            &tx,
            &ts,
            &actor.id,
            AuditAction::Create,
            &Target::Blueprint(bp.id.clone()),
            Capacity::Admin,
            Some("Blueprint created"),
        )?;

        let created = fetch_blueprint(&tx, &bp.id)?
            .ok_or_else(|| RegistryError::Storage("blueprint vanished after insert".into()))?;
        tx.commit()?;
        Ok(created)
    }

    async fn get_blueprint(&self, id: &str) -> Result<Option<Blueprint>> {
        let conn = self.lock()?;
        fetch_blueprint(&conn, id)
    }

    async fn list_blueprints(&self, stage: Option<Stage>) -> Result<Vec<Blueprint>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM blueprints WHERE ?1 IS NULL OR stage = ?1 ORDER BY stage, id",
            BLUEPRINT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![stage], blueprint_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn set_blueprint_status(
        &self,
        actor: &Actor,
        id: &str,
        status: BlueprintStatus,
    ) -> Result<Blueprint> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = fetch_blueprint(&tx, id)?
            .ok_or_else(|| RegistryError::not_found(format!("blueprint '{}'", id)))?;
        tx.execute(
            "UPDATE blueprints SET status = ?1 WHERE id = ?2",
            params![status, id],
        )?;
        append_audit(
            &tx,
            &now(),
            &actor.id,
            AuditAction::Update,
            &Target::Blueprint(id.to_string()),
            Capacity::Admin,
            Some(&format!("status {} -> {}", current.status, status)),
        )?;

        let updated = fetch_blueprint(&tx, id)?
            .ok_or_else(|| RegistryError::not_found(format!("blueprint '{}'", id)))?;
        tx.commit()?;
        Ok(updated)
    }

    async fn delete_blueprint(&self, actor: &Actor, id: &str) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if fetch_blueprint(&tx, id)?.is_none() {
            return Err(RegistryError::not_found(format!("blueprint '{}'", id)));
        }
        let referenced = count(
            &tx,
            "SELECT COUNT(*) FROM file_instances WHERE blueprint_id = ?1",
            params![id],
        )?;
        if referenced > 0 {
            return Err(RegistryError::validation(format!(
                "blueprint '{}' is referenced by {} file instance(s); archive it instead",
                id, referenced
            )));
        }

        tx.execute("DELETE FROM blueprints WHERE id = ?1", params![id])?;
        append_audit(
            &tx,
            &now(),
            &actor.id,
            AuditAction::Delete,
            &Target::Blueprint(id.to_string()),
            Capacity::Admin,
            Some("Blueprint deleted"),
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn unused_blueprints(&self) -> Result<Vec<Blueprint>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM blueprints b
             WHERE b.status = ?1
               AND NOT EXISTS (SELECT 1 FROM file_instances f WHERE f.blueprint_id = b.id)
             ORDER BY b.id",
            prefixed(BLUEPRINT_COLUMNS, "b")
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![BlueprintStatus::Active], blueprint_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ─── File instances ─────────────────────────────────────────────────────

    async fn commit_version(&self, new: &NewFileInstance) -> Result<FileInstance> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if count(
            &tx,
            "SELECT COUNT(*) FROM file_instances
             WHERE blueprint_id = ?1 AND env_id = ?2 AND content_hash = ?3",
            params![new.blueprint_id, new.env_id, new.content_hash],
        )? > 0
        {
            return Err(RegistryError::Duplicate(format!(
                "identical content already registered for '{}' in '{}'",
                new.blueprint_id, new.env_id
            )));
        }
        let mut seen = BTreeSet::new();
        for parent in &new.parents {
            if !seen.insert(*parent) {
                return Err(RegistryError::validation(format!(
                    "lineage parent {} is listed more than once",
                    parent
                )));
            }
            if fetch_instance(&tx, *parent)?.is_none() {
                return Err(RegistryError::not_found(format!(
                    "lineage parent {}",
                    parent
                )));
            }
        }

        let superseded = tx.execute(
            "UPDATE file_instances SET current_status = ?1
             WHERE blueprint_id = ?2 AND env_id = ?3 AND current_status = ?4",
            params![
                InstanceStatus::Superseded,
                new.blueprint_id,
                new.env_id,
                InstanceStatus::Active
            ],
        )?;

        let structure = new
            .structure
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let ts = now();
        tx.execute(
            "INSERT INTO file_instances (stage, blueprint_id, env_id, rel_path, content_hash,
                 size_bytes, structure, validation_summary, current_status, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                new.stage,
                new.blueprint_id,
                new.env_id,
                new.rel_path,
                new.content_hash,
                new.size_bytes,
                structure,
                new.validation_summary,
                InstanceStatus::Active,
                new.created_by,
                ts
            ],
        )?;
        let file = FileRef::new(new.stage, tx.last_insert_rowid());

        append_audit(
            &tx,
            &ts,
            &new.created_by,
            AuditAction::Create,
            &Target::File(file),
            Capacity::Doer,
            Some(new.comment.as_deref().unwrap_or("New version uploaded")),
        )?;

        for parent in &new.parents {
            tx.execute(
                "INSERT INTO lineage_links (parent_stage, parent_id, child_stage, child_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![parent.stage, parent.id, file.stage, file.id, ts],
            )?;
        }

        let created = fetch_instance(&tx, file)?
            .ok_or_else(|| RegistryError::Storage("file instance vanished after insert".into()))?;
        tx.commit()?;

        tracing::debug!(
            file = %file,
            superseded,
            parents = new.parents.len(),
            "committed file version"
        );
        Ok(created)
    }

    async fn get_instance(&self, file: FileRef) -> Result<Option<FileInstance>> {
        let conn = self.lock()?;
        fetch_instance(&conn, file)
    }

    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<FileInstance>> {
        let conn = self.lock()?;
        let mut sql = format!("SELECT {} FROM file_instances WHERE 1=1", INSTANCE_COLUMNS);
        let mut param_values: Vec<String> = Vec::new();

        if let Some(ref env) = filter.env_id {
            param_values.push(env.clone());
            sql.push_str(&format!(" AND env_id = ?{}", param_values.len()));
        }
        if let Some(stage) = filter.stage {
            param_values.push(stage.as_str().to_string());
            sql.push_str(&format!(" AND stage = ?{}", param_values.len()));
        }
        if let Some(ref bp) = filter.blueprint_id {
            param_values.push(bp.clone());
            sql.push_str(&format!(" AND blueprint_id = ?{}", param_values.len()));
        }
        if let Some(status) = filter.status {
            param_values.push(status.as_str().to_string());
            sql.push_str(&format!(" AND current_status = ?{}", param_values.len()));
        }
        sql.push_str(" ORDER BY id");

        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> =
            param_values.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), instance_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn content_hash_exists(
        &self,
        blueprint_id: &str,
        env_id: &str,
        content_hash: &str,
    ) -> Result<bool> {
        let conn = self.lock()?;
        Ok(count(
            &conn,
            "SELECT COUNT(*) FROM file_instances
             WHERE blueprint_id = ?1 AND env_id = ?2 AND content_hash = ?3",
            params![blueprint_id, env_id, content_hash],
        )? > 0)
    }

    async fn record_signoff(&self, entry: &NewAuditEntry) -> Result<AuditEntry> {
        let file = entry.target.as_file().ok_or_else(|| {
            RegistryError::validation(format!("{} is not a file instance", entry.target))
        })?;

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let instance = fetch_instance(&tx, file)?
            .ok_or_else(|| RegistryError::not_found(format!("file instance {}", file)))?;
        if instance.status != InstanceStatus::Active {
            return Err(RegistryError::validation(format!(
                "{} is {} and no longer accepts sign-offs",
                file, instance.status
            )));
        }

        let id = append_audit(
            &tx,
            &now(),
            &entry.actor,
            entry.action,
            &entry.target,
            entry.capacity,
            entry.comment.as_deref(),
        )?;
        if entry.action == AuditAction::Reject {
            tx.execute(
                "UPDATE file_instances SET current_status = ?1 WHERE id = ?2",
                params![InstanceStatus::Rejected, file.id],
            )?;
        }

        let recorded = fetch_audit(&tx, id)?;
        tx.commit()?;
        Ok(recorded)
    }

    async fn pending_doer_signoffs(&self, limit: usize) -> Result<Vec<FileInstance>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM file_instances f
             WHERE f.stage = ?1 AND f.current_status = ?2
               AND NOT EXISTS (
                   SELECT 1 FROM audit_log a
                   WHERE a.target_kind = ?3 AND a.target_id = CAST(f.id AS TEXT)
                     AND a.action = ?4 AND a.capacity = ?5)
             ORDER BY f.id",
            prefixed(INSTANCE_COLUMNS, "f")
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut pending = Vec::new();
        for stage in Stage::ALL {
            let rows = stmt
                .query_map(
                    params![
                        stage,
                        InstanceStatus::Active,
                        stage.target_kind(),
                        AuditAction::SignOff,
                        Capacity::Doer
                    ],
                    instance_from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            pending.extend(rows);
        }
        pending.sort_by_key(|f| f.id);
        pending.truncate(limit);
        Ok(pending)
    }

    // ─── Lineage ────────────────────────────────────────────────────────────

    async fn lineage_upstream(&self, child: FileRef) -> Result<Vec<LineageLink>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM lineage_links WHERE child_id = ?1 AND child_stage = ?2 ORDER BY id",
            LINEAGE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![child.id, child.stage], lineage_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn lineage_downstream(&self, parent: FileRef) -> Result<Vec<LineageLink>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM lineage_links WHERE parent_id = ?1 AND parent_stage = ?2 ORDER BY id",
            LINEAGE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![parent.id, parent.stage], lineage_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ─── Audit ──────────────────────────────────────────────────────────────

    async fn audit_for_target(&self, target: &Target) -> Result<Vec<AuditEntry>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM audit_log WHERE target_kind = ?1 AND target_id = ?2 ORDER BY id",
            AUDIT_COLUMNS
        );
        query_audit(&conn, &sql, params![target.kind(), target.id_text()])
    }

    async fn audit_for_env_files(&self, env_id: &str, stage: Stage) -> Result<Vec<AuditEntry>> {
        let conn = self.lock()?;
        replicate::audit_for_env_files(&conn, env_id, stage)
    }

    async fn audit_by_actor(&self, actor: &str, limit: usize) -> Result<Vec<AuditEntry>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM audit_log WHERE actor = ?1 ORDER BY id DESC LIMIT ?2",
            AUDIT_COLUMNS
        );
        query_audit(&conn, &sql, params![actor, limit as i64])
    }

    async fn audit_in_range(&self, from: &str, to: &str) -> Result<Vec<AuditEntry>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM audit_log WHERE timestamp >= ?1 AND timestamp < ?2 ORDER BY id",
            AUDIT_COLUMNS
        );
        query_audit(&conn, &sql, params![from, to])
    }

    async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM audit_log ORDER BY id DESC LIMIT ?1",
            AUDIT_COLUMNS
        );
        query_audit(&conn, &sql, params![limit as i64])
    }

    // ─── Cloning ────────────────────────────────────────────────────────────

    async fn clone_records(&self, actor: &Actor, request: &CloneRecords) -> Result<CloneReport> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let report = replicate::clone_records(&tx, actor, request, &now())?;
        tx.commit()?;
        Ok(report)
    }

    // ─── Planning ───────────────────────────────────────────────────────────

    async fn insert_milestone(&self, actor: &Actor, m: &NewMilestone) -> Result<Milestone> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if fetch_environment(&tx, &m.env_id)?.is_none() {
            return Err(RegistryError::not_found(format!("environment '{}'", m.env_id)));
        }
        for pred in &m.predecessor_ids {
            let p = require_milestone(&tx, *pred)?;
            if p.env_id != m.env_id {
                return Err(RegistryError::validation(format!(
                    "predecessor #{} belongs to environment '{}', not '{}'",
                    pred, p.env_id, m.env_id
                )));
            }
        }

        let (target_kind, target_id) = target_parts(m.target.as_ref());
        let ts = now();
        tx.execute(
            "INSERT INTO milestones (env_id, title, duration_days, due_date, owner, status,
                 target_kind, target_id, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                m.env_id,
                m.title,
                m.duration_days,
                m.due_date,
                m.owner,
                MilestoneStatus::Pending,
                target_kind,
                target_id,
                actor.id,
                ts
            ],
        )?;
        let id = tx.last_insert_rowid();

        let mut preds = m.predecessor_ids.clone();
        preds.sort_unstable();
        preds.dedup();
        for pred in &preds {
            tx.execute(
                "INSERT INTO dependencies (task_id, predecessor_task_id) VALUES (?1, ?2)",
                params![id, pred],
            )?;
            // A predecessor is no longer a root; its dates are derived from now on.
            tx.execute(
                "UPDATE milestones SET due_date = NULL WHERE id = ?1",
                params![pred],
            )?;
        }

        append_audit(
            &tx,
            &ts,
            &actor.id,
            AuditAction::Create,
            &Target::Milestone(id),
            Capacity::User,
            Some(&format!("Task '{}' created", m.title)),
        )?;

        let created = require_milestone(&tx, id)?;
        tx.commit()?;
        Ok(created)
    }

    async fn get_milestone(&self, id: i64) -> Result<Option<Milestone>> {
        let conn = self.lock()?;
        fetch_milestone(&conn, id)
    }

    async fn list_milestones(&self, env_id: &str) -> Result<Vec<Milestone>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM milestones WHERE env_id = ?1 ORDER BY id",
            MILESTONE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![env_id], milestone_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn milestones_by_owner(
        &self,
        owner: &str,
        status: Option<MilestoneStatus>,
    ) -> Result<Vec<Milestone>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM milestones WHERE owner = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY due_date IS NULL, due_date, id",
            MILESTONE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![owner, status], milestone_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn set_milestone_status(
        &self,
        actor: &Actor,
        id: i64,
        status: MilestoneStatus,
    ) -> Result<Milestone> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = require_milestone(&tx, id)?;
        tx.execute(
            "UPDATE milestones SET status = ?1 WHERE id = ?2",
            params![status, id],
        )?;
        append_audit(
            &tx,
            &now(),
            &actor.id,
            AuditAction::UpdateStatus,
            &Target::Milestone(id),
            Capacity::User,
            Some(&format!("{} -> {}", current.status, status)),
        )?;

        let updated = require_milestone(&tx, id)?;
        tx.commit()?;
        Ok(updated)
    }

    async fn set_milestone_due_date(
        &self,
        actor: &Actor,
        id: i64,
        due_date: Option<NaiveDate>,
    ) -> Result<Milestone> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        require_milestone(&tx, id)?;
        let successors = count(
            &tx,
            "SELECT COUNT(*) FROM dependencies WHERE predecessor_task_id = ?1",
            params![id],
        )?;
        if due_date.is_some() && successors > 0 {
            return Err(RegistryError::validation(format!(
                "milestone #{} has successors; its due date is derived",
                id
            )));
        }

        tx.execute(
            "UPDATE milestones SET due_date = ?1 WHERE id = ?2",
            params![due_date, id],
        )?;
        let shown = due_date.map_or_else(|| "none".to_string(), |d| d.to_string());
        append_audit(
            &tx,
            &now(),
            &actor.id,
            AuditAction::Update,
            &Target::Milestone(id),
            Capacity::User,
            Some(&format!("due date set to {}", shown)),
        )?;

        let updated = require_milestone(&tx, id)?;
        tx.commit()?;
        Ok(updated)
    }

    async fn delete_milestone(&self, actor: &Actor, id: i64) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let m = require_milestone(&tx, id)?;
        append_audit(
            &tx,
            &now(),
            &actor.id,
            AuditAction::Delete,
            &Target::Milestone(id),
            Capacity::User,
            Some(&format!("Task '{}' deleted", m.title)),
        )?;
        tx.execute("DELETE FROM milestones WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    async fn add_dependency(&self, actor: &Actor, task_id: i64, predecessor_id: i64) -> Result<()> {
        if task_id == predecessor_id {
            return Err(RegistryError::Cycle(format!(
                "milestone #{} cannot depend on itself",
                task_id
            )));
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let task = require_milestone(&tx, task_id)?;
        let pred = require_milestone(&tx, predecessor_id)?;
        if task.env_id != pred.env_id {
            return Err(RegistryError::validation(format!(
                "milestones #{} and #{} are in different environments",
                task_id, predecessor_id
            )));
        }

        let existing = env_dependencies(&tx, &task.env_id)?;
        let edge = Dependency {
            task_id,
            predecessor_task_id: predecessor_id,
        };
        if existing.contains(&edge) {
            return Err(RegistryError::Duplicate(format!(
                "milestone #{} already depends on #{}",
                task_id, predecessor_id
            )));
        }
        if graph::would_create_cycle(&existing, task_id, predecessor_id) {
            return Err(RegistryError::Cycle(format!(
                "#{} -> #{} would close a loop",
                predecessor_id, task_id
            )));
        }

        tx.execute(
            "INSERT INTO dependencies (task_id, predecessor_task_id) VALUES (?1, ?2)",
            params![task_id, predecessor_id],
        )?;
        tx.execute(
            "UPDATE milestones SET due_date = NULL WHERE id = ?1",
            params![predecessor_id],
        )?;
        append_audit(
            &tx,
            &now(),
            &actor.id,
            AuditAction::AddDependency,
            &Target::Milestone(task_id),
            Capacity::User,
            Some(&format!("depends on #{}", predecessor_id)),
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn remove_dependency(
        &self,
        actor: &Actor,
        task_id: i64,
        predecessor_id: i64,
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let removed = tx.execute(
            "DELETE FROM dependencies WHERE task_id = ?1 AND predecessor_task_id = ?2",
            params![task_id, predecessor_id],
        )?;
        if removed == 0 {
            return Err(RegistryError::not_found(format!(
                "dependency #{} -> #{}",
                predecessor_id, task_id
            )));
        }
        append_audit(
            &tx,
            &now(),
            &actor.id,
            AuditAction::RemoveDependency,
            &Target::Milestone(task_id),
            Capacity::User,
            Some(&format!("no longer depends on #{}", predecessor_id)),
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn plan_snapshot(&self, env_id: &str) -> Result<PlanSnapshot> {
        let conn = self.lock()?;
        if fetch_environment(&conn, env_id)?.is_none() {
            return Err(RegistryError::not_found(format!("environment '{}'", env_id)));
        }
        let sql = format!(
            "SELECT {} FROM milestones WHERE env_id = ?1 ORDER BY id",
            MILESTONE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let milestones = stmt
            .query_map(params![env_id], milestone_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(PlanSnapshot {
            env_id: env_id.to_string(),
            milestones,
            dependencies: env_dependencies(&conn, env_id)?,
        })
    }

    async fn insert_action_item(&self, actor: &Actor, item: &NewActionItem) -> Result<ActionItem> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if fetch_environment(&tx, &item.env_id)?.is_none() {
            return Err(RegistryError::not_found(format!("environment '{}'", item.env_id)));
        }
        let (target_kind, target_id) = target_parts(item.target.as_ref());
        let ts = now();
        tx.execute(
            "INSERT INTO action_items (env_id, description, owner, due_date, status,
                 target_kind, target_id, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                item.env_id,
                item.description,
                item.owner,
                item.due_date,
                ActionStatus::Open,
                target_kind,
                target_id,
                actor.id,
                ts
            ],
        )?;
        let id = tx.last_insert_rowid();
        append_audit(
            &tx,
            &ts,
            &actor.id,
            AuditAction::Create,
            &Target::ActionItem(id),
            Capacity::User,
            Some(&item.description),
        )?;

        let created = fetch_action_item(&tx, id)?
            .ok_or_else(|| RegistryError::Storage("action item vanished after insert".into()))?;
        tx.commit()?;
        Ok(created)
    }

    async fn get_action_item(&self, id: i64) -> Result<Option<ActionItem>> {
        let conn = self.lock()?;
        fetch_action_item(&conn, id)
    }

    async fn close_action_item(&self, actor: &Actor, id: i64, comment: &str) -> Result<ActionItem> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let item = fetch_action_item(&tx, id)?
            .ok_or_else(|| RegistryError::not_found(format!("action item #{}", id)))?;
        if item.status == ActionStatus::Closed {
            return Err(RegistryError::validation(format!(
                "action item #{} is already closed",
                id
            )));
        }
        tx.execute(
            "UPDATE action_items SET status = ?1 WHERE id = ?2",
            params![ActionStatus::Closed, id],
        )?;
        append_audit(
            &tx,
            &now(),
            &actor.id,
            AuditAction::Close,
            &Target::ActionItem(id),
            Capacity::User,
            Some(comment),
        )?;

        let closed = fetch_action_item(&tx, id)?
            .ok_or_else(|| RegistryError::not_found(format!("action item #{}", id)))?;
        tx.commit()?;
        Ok(closed)
    }

    async fn list_action_items(
        &self,
        env_id: &str,
        status: Option<ActionStatus>,
    ) -> Result<Vec<ActionItem>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM action_items WHERE env_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY id",
            ACTION_ITEM_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![env_id, status], action_item_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn action_items_by_owner(
        &self,
        owner: &str,
        status: Option<ActionStatus>,
    ) -> Result<Vec<ActionItem>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM action_items WHERE owner = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY due_date IS NULL, due_date, id",
            ACTION_ITEM_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![owner, status], action_item_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ─── Dashboards ─────────────────────────────────────────────────────────

    async fn system_kpis(&self) -> Result<SystemKpis> {
        let conn = self.lock()?;
        Ok(SystemKpis {
            environments: count(&conn, "SELECT COUNT(*) FROM environments", [])?,
            active_environments: count(
                &conn,
                "SELECT COUNT(*) FROM environments WHERE status = ?1",
                params![EnvStatus::Active],
            )?,
            blueprints: count(&conn, "SELECT COUNT(*) FROM blueprints", [])?,
            files_by_stage: stage_counts(&conn, None)?,
            active_files: count(
                &conn,
                "SELECT COUNT(*) FROM file_instances WHERE current_status = ?1",
                params![InstanceStatus::Active],
            )?,
            audit_entries: count(&conn, "SELECT COUNT(*) FROM audit_log", [])?,
            milestones: count(&conn, "SELECT COUNT(*) FROM milestones", [])?,
            open_action_items: count(
                &conn,
                "SELECT COUNT(*) FROM action_items WHERE status = ?1",
                params![ActionStatus::Open],
            )?,
        })
    }
}
