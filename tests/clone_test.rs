use std::collections::BTreeSet;

use atlas_registry::cloning::CloneRequest;
use atlas_registry::config::Settings;
use atlas_registry::governance::{Content, GovernanceStatus};
use atlas_registry::state::kinds::*;
use atlas_registry::state::models::*;
use atlas_registry::{Registry, RegistryError};
use chrono::NaiveDate;
use tempfile::TempDir;

fn admin() -> Actor {
    Actor::new("root", Role::Admin)
}

/// Files seeded into `dev`.
struct Seeded {
    claims: FileRef,
    reserving_old: FileRef,
    reserving_new: FileRef,
    pricing: FileRef,
}

async fn setup() -> (TempDir, Registry, Seeded) {
    let dir = TempDir::new().unwrap();
    let registry = Registry::in_memory(dir.path().join("assets")).await.unwrap();
    let seeded = seed(&registry).await;
    (dir, registry, seeded)
}

async fn seed(registry: &Registry) -> Seeded {
    let env = NewEnvironment::new("dev", "Development", Category::Development);
    registry.create_environment(&admin(), &env, None).await.unwrap();

    let mut claims = NewBlueprint::new("claims", "Claims", Stage::DataInputs, ".csv");
    claims.workflow = Workflow::DoerOnly;
    registry.create_blueprint(&admin(), &claims).await.unwrap();
    for (id, name) in [("reserving", "Reserving"), ("pricing", "Pricing")] {
        let bp = NewBlueprint::new(id, name, Stage::Models, ".py");
        registry.create_blueprint(&admin(), &bp).await.unwrap();
    }

    let claims = upload(registry, "claims", "claims.csv", "id\n1\n", &[]).await;
    let reserving_old = upload(registry, "reserving", "reserving.py", "v = 1\n", &[claims]).await;
    approve(registry, reserving_old).await;
    let reserving_new = upload(registry, "reserving", "reserving.py", "v = 2\n", &[]).await;
    let pricing = upload(registry, "pricing", "pricing.py", "p = 1\n", &[claims]).await;
    approve(registry, pricing).await;

    Seeded {
        claims,
        reserving_old,
        reserving_new,
        pricing,
    }
}

async fn upload(
    registry: &Registry,
    blueprint: &str,
    name: &str,
    body: &str,
    parents: &[FileRef],
) -> FileRef {
    let content = Content::new(name, body.as_bytes().to_vec());
    registry
        .create_version(&admin(), "dev", blueprint, &content, parents)
        .await
        .unwrap()
        .file_ref()
}

async fn approve(registry: &Registry, file: FileRef) {
    registry
        .sign_off(&admin(), file, SignOffAction::SignOff, Capacity::Doer, "built")
        .await
        .unwrap();
    registry
        .sign_off(&admin(), file, SignOffAction::SignOff, Capacity::Reviewer, "reviewed")
        .await
        .unwrap();
}

fn request(id: &str, profile: VersioningProfile) -> CloneRequest {
    CloneRequest::all_stages(
        "dev",
        NewEnvironment::new(id, format!("Clone {}", id), Category::Testing),
        profile,
    )
}

fn remapped(report: &CloneReport, file: FileRef) -> FileRef {
    FileRef::new(file.stage, report.id_map[&file.id])
}

#[tokio::test]
async fn test_latest_approved_copies_only_reviewed_active_files() {
    let (_dir, registry, seeded) = setup().await;

    let report = registry
        .clone_environment(&admin(), &request("snap", VersioningProfile::LatestApproved))
        .await
        .unwrap();

    assert_eq!(report.total_files(), 1);
    assert_eq!(report.files_cloned[&Stage::Models], 1);
    assert_eq!(report.files_cloned[&Stage::DataInputs], 0);
    assert!(report.id_map.contains_key(&seeded.pricing.id));
    assert!(!report.id_map.contains_key(&seeded.reserving_old.id));
    assert!(!report.id_map.contains_key(&seeded.reserving_new.id));
    assert_eq!(report.environment.source_environment_id.as_deref(), Some("dev"));

    // claims -> pricing loses its parent
    assert_eq!(report.lineage_copied, 0);
    assert_eq!(report.lineage_dropped, 1);
    assert!(report.warnings.iter().any(|w| w.contains("lineage")));

    let copy = remapped(&report, seeded.pricing);
    let governed = registry.governance_status(copy).await.unwrap();
    assert_eq!(governed.instance.env_id, "snap");
    assert_eq!(governed.instance.status, InstanceStatus::Active);
    assert_eq!(governed.instance.created_by, "root");
    assert!(registry.assets().exists("snap", &governed.instance.rel_path));

    // Clone entries instead of the source history
    let trail = registry.audit_for(&Target::File(copy)).await.unwrap();
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].action, AuditAction::CloneFile);
    assert_eq!(trail[0].capacity, Capacity::System);
    assert_eq!(governed.status, GovernanceStatus::PendingDoer);

    let env_trail = registry
        .audit_for(&Target::Environment("snap".into()))
        .await
        .unwrap();
    assert_eq!(env_trail[0].action, AuditAction::Clone);
}

#[tokio::test]
async fn test_forensic_clone_replays_history() {
    let (_dir, registry, seeded) = setup().await;

    let report = registry
        .clone_environment(
            &admin(),
            &request("forensic", VersioningProfile::CarbonCopyForensic),
        )
        .await
        .unwrap();

    assert_eq!(report.total_files(), 4);
    assert_eq!(report.lineage_copied, 2);
    assert_eq!(report.lineage_dropped, 0);
    assert_eq!(report.audit_replayed, 8);

    let source_trail = registry
        .audit_for(&Target::File(seeded.pricing))
        .await
        .unwrap();
    let copy = remapped(&report, seeded.pricing);
    let copy_trail = registry.audit_for(&Target::File(copy)).await.unwrap();
    assert_eq!(copy_trail.len(), source_trail.len());
    for (original, replayed) in source_trail.iter().zip(&copy_trail) {
        assert_eq!(replayed.timestamp, original.timestamp);
        assert_eq!(replayed.actor, original.actor);
        assert_eq!(replayed.action, original.action);
        assert_eq!(replayed.capacity, original.capacity);
        assert_eq!(replayed.comment, original.comment);
        assert_eq!(replayed.target, Target::File(copy));
    }

    let files = registry.list_files("forensic", None).await.unwrap();
    let status_of = |file: FileRef| {
        let id = report.id_map[&file.id];
        files.iter().find(|g| g.instance.id == id).unwrap().status
    };
    assert_eq!(status_of(seeded.pricing), GovernanceStatus::FullyApproved);
    assert_eq!(status_of(seeded.reserving_new), GovernanceStatus::PendingDoer);
    assert_eq!(status_of(seeded.reserving_old), GovernanceStatus::Superseded);
    assert_eq!(status_of(seeded.claims), GovernanceStatus::PendingDoer);

    let up = registry
        .lineage_upstream(remapped(&report, seeded.pricing))
        .await
        .unwrap();
    assert_eq!(up.len(), 1);
    assert_eq!(up[0].parent, remapped(&report, seeded.claims));
}

#[tokio::test]
async fn test_full_history_skips_superseded() {
    let (_dir, registry, seeded) = setup().await;

    let report = registry
        .clone_environment(
            &admin(),
            &request("history", VersioningProfile::FullHistoryNoSuperseded),
        )
        .await
        .unwrap();

    assert_eq!(report.total_files(), 3);
    assert!(!report.id_map.contains_key(&seeded.reserving_old.id));
    // claims -> reserving_old is dropped, claims -> pricing survives
    assert_eq!(report.lineage_copied, 1);
    assert_eq!(report.lineage_dropped, 1);
}

#[tokio::test]
async fn test_stage_selection_limits_files_and_folders() {
    let (_dir, registry, _seeded) = setup().await;
    let mut req = request("inputs", VersioningProfile::CarbonCopyForensic);
    req.stages = BTreeSet::from([Stage::DataInputs]);

    let report = registry.clone_environment(&admin(), &req).await.unwrap();
    assert_eq!(report.total_files(), 1);
    assert!(!report.files_cloned.contains_key(&Stage::Models));

    let models = registry.assets().env_dir("inputs").join("models");
    assert!(models.is_dir());
    assert_eq!(std::fs::read_dir(models).unwrap().count(), 0);
}

#[tokio::test]
async fn test_clone_copies_plan() {
    let (_dir, registry, _seeded) = setup().await;
    let due = NaiveDate::from_ymd_opt(2025, 12, 20).unwrap();
    let root = registry
        .create_milestone(
            &admin(),
            &NewMilestone {
                env_id: "dev".into(),
                title: "Sign-off pack".into(),
                duration_days: 1,
                due_date: Some(due),
                owner: "root".into(),
                predecessor_ids: vec![],
                target: None,
            },
        )
        .await
        .unwrap();
    let run = registry
        .create_milestone(
            &admin(),
            &NewMilestone {
                env_id: "dev".into(),
                title: "Run reserving".into(),
                duration_days: 5,
                due_date: None,
                owner: "root".into(),
                predecessor_ids: vec![],
                target: None,
            },
        )
        .await
        .unwrap();
    registry.add_dependency(&admin(), root, run).await.unwrap();

    let mut req = request("planned", VersioningProfile::LatestApproved);
    req.plan_source_env_id = Some("dev".into());
    let report = registry.clone_environment(&admin(), &req).await.unwrap();

    let plan = report.plan.unwrap();
    assert_eq!(plan.tasks_cloned, 2);
    assert_eq!(plan.dependencies_cloned, 1);
    assert_eq!(plan.dependencies_dropped, 0);

    let original = registry.compute_schedule("dev").await.unwrap();
    let copied = registry.compute_schedule("planned").await.unwrap();
    let dates = |s: &atlas_registry::planning::Schedule| {
        s.tasks.values().copied().collect::<Vec<_>>()
    };
    assert_eq!(dates(&copied), dates(&original));
    assert_eq!(copied.kpis.project_start, original.kpis.project_start);
    assert_eq!(copied.kpis.project_end, Some(due));

    assert!(!copied.tasks.contains_key(&root));
    assert!(!copied.tasks.contains_key(&run));
}

#[tokio::test]
async fn test_failed_clone_removes_new_tree() {
    let dir = TempDir::new().unwrap();
    let settings = Settings {
        database_path: dir.path().join("registry.db"),
        asset_root: dir.path().join("assets"),
        ..Settings::default()
    };
    let registry = Registry::open(&settings).await.unwrap();
    seed(&registry).await;

    // Make the record phase fail after the tree has been copied
    let conn = rusqlite::Connection::open(&settings.database_path).unwrap();
    conn.execute_batch(
        "CREATE TRIGGER fail_clone BEFORE INSERT ON environments
         WHEN NEW.source_environment_id IS NOT NULL
         BEGIN SELECT RAISE(ABORT, 'clone refused'); END;",
    )
    .unwrap();
    drop(conn);

    let err = registry
        .cloning()
        .clone_environment(&admin(), &request("broken", VersioningProfile::LatestApproved))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("clone refused"), "{err}");

    assert!(!registry.assets().env_dir("broken").exists());
    let envs = registry.list_environments().await.unwrap();
    assert!(envs.iter().all(|e| e.id != "broken"));
}

#[tokio::test]
async fn test_clone_preconditions() {
    let (_dir, registry, _seeded) = setup().await;

    let developer = Actor::new("dan", Role::Developer);
    let err = registry
        .clone_environment(&developer, &request("x", VersioningProfile::LatestApproved))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Permission(_)));

    let err = registry
        .clone_environment(&admin(), &request("dev", VersioningProfile::LatestApproved))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Validation(_)));

    let mut req = request("y", VersioningProfile::LatestApproved);
    req.source_env_id = "nowhere".into();
    let err = registry.clone_environment(&admin(), &req).await.unwrap_err();
    assert!(matches!(err, RegistryError::NotFound(_)));

    // A pruned source has no tree left to copy
    registry
        .update_environment_status(&admin(), "dev", EnvStatus::Archived, "retired")
        .await
        .unwrap();
    registry
        .prune_environment(&admin(), "dev", "free space")
        .await
        .unwrap();
    let err = registry
        .clone_environment(&admin(), &request("z", VersioningProfile::LatestApproved))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::NotFound(_)));
    assert!(!registry.assets().env_dir("z").exists());
}

#[tokio::test]
async fn test_promote_to_reporting_creates_locked_snapshot() {
    let (_dir, registry, seeded) = setup().await;

    let report = registry
        .promote_to_reporting(&admin(), "dev", "q4-report", "Q4 Reporting", Some("year end"))
        .await
        .unwrap();

    assert_eq!(report.profile, VersioningProfile::LatestApproved);
    assert_eq!(report.environment.category, Category::Reporting);
    assert_eq!(report.environment.status, EnvStatus::Locked);
    assert_eq!(report.total_files(), 1);
    assert!(report.id_map.contains_key(&seeded.pricing.id));

    // Locked: no new uploads
    let content = Content::new("pricing.py", b"p = 2\n".to_vec());
    let err = registry
        .create_version(&admin(), "q4-report", "pricing", &content, &[])
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Permission(_)));
}
