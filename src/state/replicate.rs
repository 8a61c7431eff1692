//! Record-level body of an environment clone, run inside the caller's
//! transaction.

use std::collections::{BTreeMap, BTreeSet};

use rusqlite::{params, Connection, Transaction};

use super::kinds::*;
use super::models::*;
use super::rows::*;
use super::sqlite::{append_audit, fetch_environment};
use crate::cloning::profile;
use crate::error::{RegistryError, Result};

/// Audit entries for every instance of `stage` in `env_id`, in id order.
pub(crate) fn audit_for_env_files(
    conn: &Connection,
    env_id: &str,
    stage: Stage,
) -> Result<Vec<AuditEntry>> {
    let sql = format!(
        "SELECT {} FROM audit_log a
         JOIN file_instances f ON a.target_id = CAST(f.id AS TEXT)
         WHERE a.target_kind = ?1 AND f.env_id = ?2 AND f.stage = ?3
         ORDER BY a.id",
        prefixed(AUDIT_COLUMNS, "a")
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![stage.target_kind(), env_id, stage], audit_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn instances_in(conn: &Connection, env_id: &str, stage: Stage) -> Result<Vec<FileInstance>> {
    let sql = format!(
        "SELECT {} FROM file_instances WHERE env_id = ?1 AND stage = ?2 ORDER BY id",
        INSTANCE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![env_id, stage], instance_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub(crate) fn clone_records(
    tx: &Transaction<'_>,
    actor: &Actor,
    req: &CloneRecords,
    ts: &str,
) -> Result<CloneReport> {
    let source = fetch_environment(tx, &req.source_env_id)?
        .ok_or_else(|| RegistryError::not_found(format!("environment '{}'", req.source_env_id)))?;
    let env = &req.new_env;
    if fetch_environment(tx, &env.id)?.is_some() {
        return Err(RegistryError::validation(format!(
            "environment '{}' already exists",
            env.id
        )));
    }

    tx.execute(
        "INSERT INTO environments (id, name, category, status, allowed_roles, purpose,
             source_environment_id, created_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            env.id,
            env.name,
            env.category,
            env.status,
            env.allowed_roles,
            env.purpose,
            source.id,
            actor.id,
            ts
        ],
    )?;
    let mut note = format!("Cloned from '{}' with profile {}", source.id, req.profile);
    if let Some(comment) = req.comment.as_deref().filter(|c| !c.trim().is_empty()) {
        note.push_str(". ");
        note.push_str(comment);
    }
    append_audit(
        tx,
        ts,
        &actor.id,
        AuditAction::Clone,
        &Target::Environment(env.id.clone()),
        Capacity::Admin,
        Some(&note),
    )?;

    let mut report = CloneReport {
        environment: fetch_environment(tx, &env.id)?
            .ok_or_else(|| RegistryError::Storage("cloned environment vanished".into()))?,
        profile: req.profile,
        files_cloned: BTreeMap::new(),
        id_map: BTreeMap::new(),
        lineage_copied: 0,
        lineage_dropped: 0,
        audit_replayed: 0,
        plan: None,
        warnings: Vec::new(),
    };

    let mut replay: Vec<(AuditEntry, FileRef)> = Vec::new();
    for stage in &req.stages {
        let copied = clone_stage(tx, actor, req, *stage, ts, &mut report.id_map, &mut replay)?;
        report.files_cloned.insert(*stage, copied);
    }

    let (copied, dropped) = clone_lineage(tx, &source.id, &report.id_map, ts)?;
    report.lineage_copied = copied;
    report.lineage_dropped = dropped;
    if dropped > 0 {
        report.warnings.push(format!(
            "{} lineage link(s) dropped because one endpoint was not cloned",
            dropped
        ));
    }

    if profile::replays_audit(req.profile) {
        replay.sort_by_key(|(entry, _)| entry.id);
        for (entry, new_ref) in &replay {
            append_audit(
                tx,
                &entry.timestamp,
                &entry.actor,
                entry.action,
                &Target::File(*new_ref),
                entry.capacity,
                entry.comment.as_deref(),
            )?;
        }
        report.audit_replayed = replay.len();
    }

    if let Some(plan_source) = &req.plan_source_env_id {
        let plan = clone_plan(tx, actor, plan_source, &env.id, ts)?;
        if plan.dependencies_dropped > 0 {
            report.warnings.push(format!(
                "{} plan dependency edge(s) dropped",
                plan.dependencies_dropped
            ));
        }
        report.plan = Some(plan);
    }

    Ok(report)
}

/// Copies the admitted instances of one stage. The newest copy per blueprint
/// becomes Active and every older copy Superseded, keeping one Active row
/// per slot in the new environment.
#[allow(clippy::too_many_arguments)]
fn clone_stage(
    tx: &Transaction<'_>,
    actor: &Actor,
    req: &CloneRecords,
    stage: Stage,
    ts: &str,
    id_map: &mut BTreeMap<i64, i64>,
    replay: &mut Vec<(AuditEntry, FileRef)>,
) -> Result<usize> {
    let instances = instances_in(tx, &req.source_env_id, stage)?;
    let history = audit_for_env_files(tx, &req.source_env_id, stage)?;

    let mut by_instance: BTreeMap<i64, Vec<&AuditEntry>> = BTreeMap::new();
    for entry in &history {
        if let Some(file) = entry.target.as_file() {
            by_instance.entry(file.id).or_default().push(entry);
        }
    }

    let selected: Vec<&FileInstance> = instances
        .iter()
        .filter(|inst| {
            let trail = by_instance.get(&inst.id).map(Vec::as_slice).unwrap_or(&[]);
            profile::admits(req.profile, inst, trail)
        })
        .collect();

    let mut newest: BTreeMap<&str, i64> = BTreeMap::new();
    for inst in &selected {
        let slot = newest.entry(inst.blueprint_id.as_str()).or_insert(inst.id);
        *slot = (*slot).max(inst.id);
    }

    for inst in &selected {
        let status = if newest.get(inst.blueprint_id.as_str()) == Some(&inst.id) {
            InstanceStatus::Active
        } else {
            InstanceStatus::Superseded
        };
        let structure = inst
            .structure
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        tx.execute(
            "INSERT INTO file_instances (stage, blueprint_id, env_id, rel_path, content_hash,
                 size_bytes, structure, validation_summary, current_status, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                stage,
                inst.blueprint_id,
                req.new_env.id,
                inst.rel_path,
                inst.content_hash,
                inst.size_bytes,
                structure,
                inst.validation_summary,
                status,
                actor.id,
                ts
            ],
        )?;
        let new_ref = FileRef::new(stage, tx.last_insert_rowid());
        id_map.insert(inst.id, new_ref.id);

        if profile::replays_audit(req.profile) {
            if let Some(trail) = by_instance.get(&inst.id) {
                replay.extend(trail.iter().map(|e| ((*e).clone(), new_ref)));
            }
        } else {
            append_audit(
                tx,
                ts,
                &actor.id,
                AuditAction::CloneFile,
                &Target::File(new_ref),
                Capacity::System,
                Some(&format!(
                    "Cloned from {} in '{}'",
                    inst.file_ref(),
                    req.source_env_id
                )),
            )?;
        }
    }

    Ok(selected.len())
}

/// Copies lineage links touching the source environment. Returns
/// (copied, dropped); a link is dropped when only one endpoint was cloned.
fn clone_lineage(
    tx: &Transaction<'_>,
    source_env_id: &str,
    id_map: &BTreeMap<i64, i64>,
    ts: &str,
) -> Result<(usize, usize)> {
    let sql = format!(
        "SELECT {} FROM lineage_links l
         JOIN file_instances p ON p.id = l.parent_id
         JOIN file_instances c ON c.id = l.child_id
         WHERE p.env_id = ?1 OR c.env_id = ?1
         ORDER BY l.id",
        prefixed(LINEAGE_COLUMNS, "l")
    );
    let links = {
        let mut stmt = tx.prepare(&sql)?;
        let rows = stmt
            .query_map(params![source_env_id], lineage_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };

    let mut copied = 0;
    let mut dropped = 0;
    for link in links {
        match (id_map.get(&link.parent.id), id_map.get(&link.child.id)) {
            (Some(parent), Some(child)) => {
                tx.execute(
                    "INSERT INTO lineage_links (parent_stage, parent_id, child_stage, child_id, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![link.parent.stage, parent, link.child.stage, child, ts],
                )?;
                copied += 1;
            }
            (None, None) => {}
            _ => {
                tracing::warn!(
                    parent = %link.parent,
                    child = %link.child,
                    "dropping lineage link with an uncloned endpoint"
                );
                dropped += 1;
            }
        }
    }
    Ok((copied, dropped))
}

/// Copies every milestone of `source_env_id` with fresh ids, then every
/// dependency whose endpoints were both copied.
pub(crate) fn clone_plan(
    tx: &Transaction<'_>,
    actor: &Actor,
    source_env_id: &str,
    target_env_id: &str,
    ts: &str,
) -> Result<PlanCloneReport> {
    if fetch_environment(tx, source_env_id)?.is_none() {
        return Err(RegistryError::not_found(format!(
            "plan source environment '{}'",
            source_env_id
        )));
    }

    let milestones = {
        let sql = format!(
            "SELECT {} FROM milestones WHERE env_id = ?1 ORDER BY id",
            MILESTONE_COLUMNS
        );
        let mut stmt = tx.prepare(&sql)?;
        let rows = stmt
            .query_map(params![source_env_id], milestone_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };

    let mut task_map: BTreeMap<i64, i64> = BTreeMap::new();
    for m in &milestones {
        let (target_kind, target_id) = target_parts(m.target.as_ref());
        tx.execute(
            "INSERT INTO milestones (env_id, title, duration_days, due_date, owner, status,
                 target_kind, target_id, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                target_env_id,
                m.title,
                m.duration_days,
                m.due_date,
                m.owner,
                m.status,
                target_kind,
                target_id,
                actor.id,
                ts
            ],
        )?;
        task_map.insert(m.id, tx.last_insert_rowid());
    }

    let edges: BTreeSet<(i64, i64)> = {
        let mut stmt = tx.prepare(
            "SELECT d.task_id, d.predecessor_task_id FROM dependencies d
             WHERE d.task_id IN (SELECT id FROM milestones WHERE env_id = ?1)
                OR d.predecessor_task_id IN (SELECT id FROM milestones WHERE env_id = ?1)",
        )?;
        let rows = stmt
            .query_map(params![source_env_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<BTreeSet<_>>>()?;
        rows
    };

    let mut report = PlanCloneReport {
        source_env_id: source_env_id.to_string(),
        tasks_cloned: task_map.len(),
        ..Default::default()
    };
    for (task, pred) in edges {
        match (task_map.get(&task), task_map.get(&pred)) {
            (Some(t), Some(p)) => {
                tx.execute(
                    "INSERT INTO dependencies (task_id, predecessor_task_id) VALUES (?1, ?2)",
                    params![t, p],
                )?;
                report.dependencies_cloned += 1;
            }
            _ => {
                tracing::warn!(task, pred, "dropping plan dependency with an uncloned endpoint");
                report.dependencies_dropped += 1;
            }
        }
    }

    append_audit(
        tx,
        ts,
        &actor.id,
        AuditAction::ClonePlan,
        &Target::Environment(target_env_id.to_string()),
        Capacity::Admin,
        Some(&format!(
            "Cloned {} task(s) and {} dependency edge(s) from '{}'",
            report.tasks_cloned, report.dependencies_cloned, source_env_id
        )),
    )?;

    Ok(report)
}
