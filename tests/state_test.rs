use std::time::Duration;

use atlas_registry::state::backend::RegistryBackend;
use atlas_registry::state::kinds::*;
use atlas_registry::state::lock::SlotLocks;
use atlas_registry::state::models::*;
use atlas_registry::state::sqlite::SqliteBackend;
use rusqlite::Connection;
use tempfile::TempDir;

async fn create_test_backend() -> (TempDir, SqliteBackend) {
    let dir = TempDir::new().unwrap();
    let backend =
        SqliteBackend::open(&dir.path().join("registry.db"), Duration::from_millis(500)).unwrap();
    backend.initialize().await.unwrap();
    (dir, backend)
}

fn admin() -> Actor {
    Actor::new("root", Role::Admin)
}

fn raw(dir: &TempDir) -> Connection {
    Connection::open(dir.path().join("registry.db")).unwrap()
}

async fn seed(backend: &SqliteBackend) -> FileInstance {
    backend
        .insert_environment(
            &admin(),
            &NewEnvironment::new("dev", "Development", Category::Development),
            Some("seed"),
        )
        .await
        .unwrap();
    backend
        .insert_blueprint(
            &admin(),
            &NewBlueprint::new("claims", "Claims extract", Stage::DataInputs, ".csv"),
        )
        .await
        .unwrap();
    backend
        .commit_version(&NewFileInstance {
            stage: Stage::DataInputs,
            blueprint_id: "claims".into(),
            env_id: "dev".into(),
            rel_path: "data_inputs/claims_v1.csv".into(),
            content_hash: "aa".repeat(32),
            size_bytes: 12,
            structure: None,
            validation_summary: None,
            created_by: "root".into(),
            parents: vec![],
            comment: Some("first cut".into()),
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_initialize_is_idempotent() {
    let (dir, backend) = create_test_backend().await;
    // Should not error on second init
    backend.initialize().await.unwrap();

    let versions: i64 = raw(&dir)
        .query_row("SELECT COUNT(*) FROM schema_version", [], |r| r.get(0))
        .unwrap();
    assert_eq!(versions, 1);
}

#[tokio::test]
async fn test_reopen_keeps_records() {
    let (dir, backend) = create_test_backend().await;
    let file = seed(&backend).await;
    drop(backend);

    let reopened =
        SqliteBackend::open(&dir.path().join("registry.db"), Duration::from_millis(500)).unwrap();
    reopened.initialize().await.unwrap();
    let found = reopened.get_instance(file.file_ref()).await.unwrap().unwrap();
    assert_eq!(found.content_hash, file.content_hash);
    assert_eq!(found.status, InstanceStatus::Active);
}

#[tokio::test]
async fn test_audit_log_is_append_only() {
    let (dir, backend) = create_test_backend().await;
    seed(&backend).await;
    let conn = raw(&dir);

    assert!(conn
        .execute("UPDATE audit_log SET actor = 'mallory'", [])
        .is_err());
    assert!(conn.execute("DELETE FROM audit_log", []).is_err());

    let entries = backend.recent_audit(10).await.unwrap();
    assert!(entries.iter().all(|e| e.actor == "root"));
    assert_eq!(entries.len(), 3);
}

#[tokio::test]
async fn test_file_instances_are_immutable_except_status() {
    let (dir, backend) = create_test_backend().await;
    let file = seed(&backend).await;
    let conn = raw(&dir);

    assert!(conn.execute("DELETE FROM file_instances", []).is_err());
    assert!(conn
        .execute(
            "UPDATE file_instances SET content_hash = 'ff' WHERE id = ?1",
            [file.id]
        )
        .is_err());
    conn.execute(
        "UPDATE file_instances SET current_status = 'Superseded' WHERE id = ?1",
        [file.id],
    )
    .unwrap();

    let found = backend.get_instance(file.file_ref()).await.unwrap().unwrap();
    assert_eq!(found.status, InstanceStatus::Superseded);
}

#[tokio::test]
async fn test_environments_cannot_be_deleted() {
    let (dir, backend) = create_test_backend().await;
    seed(&backend).await;

    assert!(raw(&dir).execute("DELETE FROM environments", []).is_err());
    assert_eq!(backend.list_environments().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_audit_queries_by_target_actor_and_range() {
    let (_dir, backend) = create_test_backend().await;
    let file = seed(&backend).await;

    let trail = backend
        .audit_for_target(&Target::File(file.file_ref()))
        .await
        .unwrap();
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].action, AuditAction::Create);
    assert_eq!(trail[0].capacity, Capacity::Doer);
    assert_eq!(trail[0].comment.as_deref(), Some("first cut"));

    assert_eq!(backend.audit_by_actor("root", 10).await.unwrap().len(), 3);
    assert!(backend.audit_by_actor("nobody", 10).await.unwrap().is_empty());

    let all = backend
        .audit_in_range("0000-01-01T00:00:00Z", "9999-12-31T00:00:00Z")
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
    let none = backend
        .audit_in_range("1990-01-01T00:00:00Z", "1990-01-02T00:00:00Z")
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_in_memory_backend_initializes() {
    let backend = SqliteBackend::open_memory().unwrap();
    backend.initialize().await.unwrap();
    assert!(backend.list_environments().await.unwrap().is_empty());
    assert!(backend.list_blueprints(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_slot_locks_serialize_the_same_slot() {
    let locks = SlotLocks::new();
    let guard = locks.acquire("claims", "dev").await;

    // A different slot is free
    let other = tokio::time::timeout(
        Duration::from_millis(100),
        locks.acquire("claims", "prod"),
    )
    .await;
    assert!(other.is_ok());

    // The same slot waits until the guard is dropped
    let blocked = tokio::time::timeout(
        Duration::from_millis(50),
        locks.acquire("claims", "dev"),
    )
    .await;
    assert!(blocked.is_err());

    drop(guard);
    let acquired = tokio::time::timeout(
        Duration::from_millis(100),
        locks.acquire("claims", "dev"),
    )
    .await;
    assert!(acquired.is_ok());
    assert_eq!(locks.len(), 2);
}
