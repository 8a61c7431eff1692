//! Column lists and row mappers shared by the SQLite backend and the clone
//! transaction.

use rusqlite::types::Type;
use rusqlite::Row;

use super::kinds::{FileRef, Stage, Target, TargetKind};
use super::models::*;

pub const ENVIRONMENT_COLUMNS: &str = "id, name, category, status, allowed_roles, purpose, \
     source_environment_id, created_by, created_at";

pub const BLUEPRINT_COLUMNS: &str = "id, name, stage, purpose, owner_team, source_type, \
     source_name, source_specifier, workflow, doer_roles, reviewer_roles, expected_extension, \
     min_size_kb, max_size_kb, expected_structure, primary_key_column, status, created_by, created_at";

pub const INSTANCE_COLUMNS: &str = "id, stage, blueprint_id, env_id, rel_path, content_hash, \
     size_bytes, structure, validation_summary, current_status, created_by, created_at";

pub const AUDIT_COLUMNS: &str =
    "id, timestamp, actor, action, target_kind, target_id, capacity, comment";

pub const LINEAGE_COLUMNS: &str =
    "id, parent_stage, parent_id, child_stage, child_id, created_at";

pub const MILESTONE_COLUMNS: &str = "id, env_id, title, duration_days, due_date, owner, status, \
     target_kind, target_id, created_by, created_at";

pub const ACTION_ITEM_COLUMNS: &str = "id, env_id, description, owner, due_date, status, \
     target_kind, target_id, created_by, created_at";

/// Qualifies every column in a list with a table alias.
pub fn prefixed(columns: &str, alias: &str) -> String {
    columns
        .split(',')
        .map(|c| format!("{}.{}", alias, c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn environment_from_row(row: &Row<'_>) -> rusqlite::Result<Environment> {
    Ok(Environment {
        id: row.get(0)?,
        name: row.get(1)?,
        category: row.get(2)?,
        status: row.get(3)?,
        allowed_roles: row.get(4)?,
        purpose: row.get(5)?,
        source_environment_id: row.get(6)?,
        created_by: row.get(7)?,
        created_at: row.get(8)?,
    })
}

pub fn blueprint_from_row(row: &Row<'_>) -> rusqlite::Result<Blueprint> {
    Ok(Blueprint {
        id: row.get(0)?,
        name: row.get(1)?,
        stage: row.get(2)?,
        purpose: row.get(3)?,
        owner_team: row.get(4)?,
        source_type: row.get(5)?,
        source_name: row.get(6)?,
        source_specifier: row.get(7)?,
        workflow: row.get(8)?,
        doer_roles: row.get(9)?,
        reviewer_roles: row.get(10)?,
        expected_extension: row.get(11)?,
        min_size_kb: row.get(12)?,
        max_size_kb: row.get(13)?,
        expected_structure: json_column(row, 14)?,
        primary_key_column: row.get(15)?,
        status: row.get(16)?,
        created_by: row.get(17)?,
        created_at: row.get(18)?,
    })
}

pub fn instance_from_row(row: &Row<'_>) -> rusqlite::Result<FileInstance> {
    Ok(FileInstance {
        id: row.get(0)?,
        stage: row.get(1)?,
        blueprint_id: row.get(2)?,
        env_id: row.get(3)?,
        rel_path: row.get(4)?,
        content_hash: row.get(5)?,
        size_bytes: row.get(6)?,
        structure: json_column(row, 7)?,
        validation_summary: row.get(8)?,
        status: row.get(9)?,
        created_by: row.get(10)?,
        created_at: row.get(11)?,
    })
}

pub fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    let target = target_column(row, 4, 5)?.ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            Type::Null,
            "audit entry without a target".into(),
        )
    })?;
    Ok(AuditEntry {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        actor: row.get(2)?,
        action: row.get(3)?,
        target,
        capacity: row.get(6)?,
        comment: row.get(7)?,
    })
}

pub fn lineage_from_row(row: &Row<'_>) -> rusqlite::Result<LineageLink> {
    let parent_stage: Stage = row.get(1)?;
    let child_stage: Stage = row.get(3)?;
    Ok(LineageLink {
        id: row.get(0)?,
        parent: FileRef::new(parent_stage, row.get(2)?),
        child: FileRef::new(child_stage, row.get(4)?),
        created_at: row.get(5)?,
    })
}

pub fn milestone_from_row(row: &Row<'_>) -> rusqlite::Result<Milestone> {
    Ok(Milestone {
        id: row.get(0)?,
        env_id: row.get(1)?,
        title: row.get(2)?,
        duration_days: row.get(3)?,
        due_date: row.get(4)?,
        owner: row.get(5)?,
        status: row.get(6)?,
        target: target_column(row, 7, 8)?,
        created_by: row.get(9)?,
        created_at: row.get(10)?,
    })
}

pub fn action_item_from_row(row: &Row<'_>) -> rusqlite::Result<ActionItem> {
    Ok(ActionItem {
        id: row.get(0)?,
        env_id: row.get(1)?,
        description: row.get(2)?,
        owner: row.get(3)?,
        due_date: row.get(4)?,
        status: row.get(5)?,
        target: target_column(row, 6, 7)?,
        created_by: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        serde_json::from_str(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn target_column(
    row: &Row<'_>,
    kind_idx: usize,
    id_idx: usize,
) -> rusqlite::Result<Option<Target>> {
    let kind: Option<TargetKind> = row.get(kind_idx)?;
    let id: Option<String> = row.get(id_idx)?;
    match (kind, id) {
        (Some(kind), Some(id)) => Target::from_parts(kind, &id).map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(id_idx, Type::Text, Box::new(e))
        }),
        _ => Ok(None),
    }
}

/// Splits an optional target into its two stored columns.
pub fn target_parts(target: Option<&Target>) -> (Option<TargetKind>, Option<String>) {
    match target {
        Some(t) => (Some(t.kind()), Some(t.id_text())),
        None => (None, None),
    }
}
