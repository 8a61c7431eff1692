use rusqlite::Connection;

use super::schema;
use crate::error::Result;

/// Bring the registry database up to [`schema::SCHEMA_VERSION`].
pub fn check_and_migrate(conn: &Connection) -> Result<()> {
    let table_exists: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .map(|c| c > 0)?;

    if !table_exists {
        apply_full_schema(conn, "Initial registry schema")?;
        return Ok(());
    }

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    if current_version < schema::SCHEMA_VERSION {
        apply_migrations(conn, current_version)?;
    }

    Ok(())
}

fn apply_full_schema(conn: &Connection, description: &str) -> Result<()> {
    conn.execute_batch(schema::CREATE_TABLES_SQL)?;
    conn.execute_batch(schema::CREATE_INDEXES_SQL)?;
    conn.execute_batch(schema::CREATE_TRIGGERS_SQL)?;
    conn.execute(
        "INSERT OR REPLACE INTO schema_version (version, applied_at, description) VALUES (?1, ?2, ?3)",
        rusqlite::params![schema::SCHEMA_VERSION, chrono::Utc::now().to_rfc3339(), description],
    )?;
    Ok(())
}

fn apply_migrations(conn: &Connection, from_version: i32) -> Result<()> {
    if from_version < 1 {
        apply_full_schema(conn, "Initial registry schema")?;
    }
    Ok(())
}

