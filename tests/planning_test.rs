use atlas_registry::planning::service::MAX_DURATION_DAYS;
use atlas_registry::planning::ScheduleWarning;
use atlas_registry::state::kinds::*;
use atlas_registry::state::models::*;
use atlas_registry::{Registry, RegistryError};
use chrono::NaiveDate;
use tempfile::TempDir;

async fn setup() -> (TempDir, Registry) {
    let dir = TempDir::new().unwrap();
    let registry = Registry::in_memory(dir.path().join("assets")).await.unwrap();
    let env = NewEnvironment::new("plan", "Year-end plan", Category::Production);
    registry.create_environment(&admin(), &env, None).await.unwrap();
    (dir, registry)
}

fn admin() -> Actor {
    Actor::new("pm", Role::Admin)
}

fn date(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

fn milestone(title: &str, duration: i64, due: Option<&str>, after: &[i64]) -> NewMilestone {
    NewMilestone {
        env_id: "plan".into(),
        title: title.into(),
        duration_days: duration,
        due_date: due.map(date),
        owner: "pm".into(),
        predecessor_ids: after.to_vec(),
        target: None,
    }
}

async fn add(registry: &Registry, m: NewMilestone) -> i64 {
    registry.create_milestone(&admin(), &m).await.unwrap()
}

async fn dependency_count(registry: &Registry) -> usize {
    registry
        .backend()
        .plan_snapshot("plan")
        .await
        .unwrap()
        .dependencies
        .len()
}

#[tokio::test]
async fn test_backward_schedule_from_root_due_date() {
    let (_dir, registry) = setup().await;
    let a = add(&registry, milestone("Build model", 10, None, &[])).await;
    let b = add(&registry, milestone("Collect data", 5, None, &[])).await;
    let r = add(&registry, milestone("Report", 1, Some("2025-12-20"), &[a, b])).await;

    let schedule = registry.compute_schedule("plan").await.unwrap();

    assert!(schedule.cycle_errors.is_empty());
    assert!(schedule.warnings.is_empty());
    assert_eq!(schedule.tasks[&r].start, date("2025-12-20"));
    assert_eq!(schedule.tasks[&r].due, date("2025-12-20"));
    assert_eq!(schedule.tasks[&a].start, date("2025-12-10"));
    assert_eq!(schedule.tasks[&a].due, date("2025-12-19"));
    assert_eq!(schedule.tasks[&b].start, date("2025-12-15"));
    assert_eq!(schedule.tasks[&b].due, date("2025-12-19"));

    let kpis = &schedule.kpis;
    assert_eq!(kpis.project_start, Some(date("2025-12-10")));
    assert_eq!(kpis.project_end, Some(date("2025-12-20")));
    assert_eq!(kpis.total_duration_days, 11);
    assert_eq!(kpis.critical_path, vec![a, r]);
}

#[tokio::test]
async fn test_chain_propagates_through_earliest_successor() {
    let (_dir, registry) = setup().await;
    let data = add(&registry, milestone("Data", 3, None, &[])).await;
    let model = add(&registry, milestone("Model", 4, None, &[data])).await;
    let review = add(&registry, milestone("Review", 2, None, &[data])).await;
    add(&registry, milestone("Board pack", 1, Some("2026-03-31"), &[model, review])).await;

    let schedule = registry.compute_schedule("plan").await.unwrap();
    // model: 03-27..03-30, review: 03-29..03-30, data ends before model starts
    assert_eq!(schedule.tasks[&model].start, date("2026-03-27"));
    assert_eq!(schedule.tasks[&review].start, date("2026-03-29"));
    assert_eq!(schedule.tasks[&data].due, date("2026-03-26"));
    assert_eq!(schedule.tasks[&data].start, date("2026-03-24"));
    assert_eq!(schedule.kpis.critical_path.first(), Some(&data));
}

#[tokio::test]
async fn test_cycle_is_rejected_and_plan_unchanged() {
    let (_dir, registry) = setup().await;
    let a = add(&registry, milestone("A", 1, None, &[])).await;
    let b = add(&registry, milestone("B", 1, None, &[a])).await;
    let c = add(&registry, milestone("C", 1, Some("2025-06-30"), &[b])).await;
    assert_eq!(dependency_count(&registry).await, 2);

    let err = registry.add_dependency(&admin(), a, c).await.unwrap_err();
    assert!(matches!(err, RegistryError::Cycle(_)), "{err}");
    let err = registry.add_dependency(&admin(), b, b).await.unwrap_err();
    assert!(matches!(err, RegistryError::Cycle(_)));
    let err = registry.add_dependency(&admin(), b, a).await.unwrap_err();
    assert!(matches!(err, RegistryError::Duplicate(_)));

    assert_eq!(dependency_count(&registry).await, 2);
    let schedule = registry.compute_schedule("plan").await.unwrap();
    assert!(schedule.cycle_errors.is_empty());
    assert_eq!(schedule.tasks.len(), 3);
}

#[tokio::test]
async fn test_gaining_a_successor_clears_stored_due_date() {
    let (_dir, registry) = setup().await;
    let x = add(&registry, milestone("X", 2, Some("2025-11-01"), &[])).await;
    let y = add(&registry, milestone("Y", 2, Some("2025-11-30"), &[])).await;

    registry.add_dependency(&admin(), y, x).await.unwrap();

    let stored = registry.backend().get_milestone(x).await.unwrap().unwrap();
    assert_eq!(stored.due_date, None);

    let err = registry
        .planner()
        .set_due_date(&admin(), x, Some(date("2025-11-10")))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Validation(_)));

    let schedule = registry.compute_schedule("plan").await.unwrap();
    assert_eq!(schedule.tasks[&x].due, date("2025-11-28"));

    // Removing the edge makes X a root without a date
    registry
        .planner()
        .remove_dependency(&admin(), y, x)
        .await
        .unwrap();
    let schedule = registry.compute_schedule("plan").await.unwrap();
    assert!(schedule
        .warnings
        .contains(&ScheduleWarning::RootWithoutDueDate(x)));
    assert!(!schedule.tasks.contains_key(&x));
}

#[tokio::test]
async fn test_milestone_input_is_validated() {
    let (_dir, registry) = setup().await;

    let err = registry
        .create_milestone(&admin(), &milestone("Zero", 0, None, &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Validation(_)));

    let err = registry
        .create_milestone(&admin(), &milestone("  ", 1, None, &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Validation(_)));

    let mut elsewhere = milestone("Elsewhere", 1, None, &[]);
    elsewhere.env_id = "missing".into();
    let err = registry
        .create_milestone(&admin(), &elsewhere)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::NotFound(_)));

    let err = registry
        .create_milestone(&admin(), &milestone("Orphan", 1, None, &[404]))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::NotFound(_)));

    let mut restricted = NewEnvironment::new("risk-only", "Risk only", Category::Validation);
    restricted.allowed_roles = RoleSet::only([Role::Risk]);
    registry
        .create_environment(&admin(), &restricted, None)
        .await
        .unwrap();
    let mut m = milestone("Stress test", 2, None, &[]);
    m.env_id = "risk-only".into();
    let err = registry
        .create_milestone(&Actor::new("dan", Role::Developer), &m)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Permission(_)));
}

#[tokio::test]
async fn test_oversized_duration_is_rejected() {
    let (_dir, registry) = setup().await;

    for duration in [1_000_000_000, MAX_DURATION_DAYS + 1] {
        let err = registry
            .create_milestone(&admin(), &milestone("Runaway", duration, Some("2025-12-20"), &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)), "{err}");
    }
    let longest = milestone("Century", MAX_DURATION_DAYS, Some("2025-12-20"), &[]);
    let id = add(&registry, longest).await;

    let schedule = registry.compute_schedule("plan").await.unwrap();
    assert!(schedule.warnings.is_empty());
    assert_eq!(schedule.tasks[&id].due, date("2025-12-20"));
}

#[tokio::test]
async fn test_out_of_range_dates_become_warnings() {
    let (_dir, registry) = setup().await;
    let feeder = add(&registry, milestone("Collect data", 5, None, &[])).await;
    let other = add(&registry, milestone("Report", 2, Some("2025-12-20"), &[])).await;
    // Stored directly, as a row written before the create check existed would be
    let runaway = registry
        .backend()
        .insert_milestone(
            &admin(),
            &milestone("Runaway", 1_000_000_000, Some("2025-12-20"), &[feeder]),
        )
        .await
        .unwrap()
        .id;

    let schedule = registry.compute_schedule("plan").await.unwrap();
    assert!(schedule
        .warnings
        .contains(&ScheduleWarning::DateOutOfRange(runaway)));
    assert!(schedule
        .warnings
        .contains(&ScheduleWarning::Unanchored(feeder)));
    assert!(!schedule.tasks.contains_key(&runaway));
    assert!(!schedule.tasks.contains_key(&feeder));
    assert_eq!(schedule.tasks[&other].start, date("2025-12-19"));
    assert_eq!(schedule.kpis.project_end, Some(date("2025-12-20")));
}

#[tokio::test]
async fn test_complete_reopen_and_owner_queries() {
    let (_dir, registry) = setup().await;
    let a = add(&registry, milestone("A", 1, Some("2025-05-01"), &[])).await;
    let mut other = milestone("B", 1, Some("2025-05-02"), &[]);
    other.owner = "sam".into();
    add(&registry, other).await;

    let planner = registry.planner();
    let done = planner.complete(&admin(), a).await.unwrap();
    assert_eq!(done.status, MilestoneStatus::Complete);

    let complete = planner
        .milestones_for_owner("pm", Some(MilestoneStatus::Complete))
        .await
        .unwrap();
    assert_eq!(complete.len(), 1);
    assert_eq!(complete[0].id, a);
    assert_eq!(planner.milestones_for_owner("sam", None).await.unwrap().len(), 1);

    planner.reopen(&admin(), a).await.unwrap();
    assert!(planner
        .milestones_for_owner("pm", Some(MilestoneStatus::Complete))
        .await
        .unwrap()
        .is_empty());

    let stats = registry.environment_stats("plan").await.unwrap();
    assert_eq!(stats.plan_tasks, 2);
    assert_eq!(stats.plan_tasks_complete, 0);
}

#[tokio::test]
async fn test_deleting_a_milestone_drops_its_edges() {
    let (_dir, registry) = setup().await;
    let a = add(&registry, milestone("A", 1, None, &[])).await;
    let b = add(&registry, milestone("B", 1, Some("2025-01-10"), &[a])).await;

    registry.planner().delete_milestone(&admin(), a).await.unwrap();

    assert_eq!(dependency_count(&registry).await, 0);
    let remaining = registry.planner().list_milestones("plan").await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, b);

    let trail = registry.audit_for(&Target::Milestone(a)).await.unwrap();
    assert_eq!(trail.last().unwrap().action, AuditAction::Delete);
}

#[tokio::test]
async fn test_action_item_lifecycle() {
    let (_dir, registry) = setup().await;
    let planner = registry.planner();

    let item = planner
        .create_action_item(
            &admin(),
            &NewActionItem {
                env_id: "plan".into(),
                description: "Chase claims extract".into(),
                owner: "sam".into(),
                due_date: Some(date("2025-10-01")),
                target: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(item.status, ActionStatus::Open);

    let err = planner
        .close_action_item(&admin(), item.id, "")
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Validation(_)));

    let closed = planner
        .close_action_item(&admin(), item.id, "received")
        .await
        .unwrap();
    assert_eq!(closed.status, ActionStatus::Closed);
    let err = planner
        .close_action_item(&admin(), item.id, "again")
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Validation(_)));

    assert!(planner
        .action_items("plan", Some(ActionStatus::Open))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        planner
            .action_items_for_owner("sam", Some(ActionStatus::Closed))
            .await
            .unwrap()
            .len(),
        1
    );
    let trail = registry
        .audit_for(&Target::ActionItem(item.id))
        .await
        .unwrap();
    assert_eq!(trail.last().unwrap().action, AuditAction::Close);
}

#[tokio::test]
async fn test_closing_an_action_item_requires_environment_access() {
    let (_dir, registry) = setup().await;
    let mut restricted = NewEnvironment::new("risk-only", "Risk only", Category::Validation);
    restricted.allowed_roles = RoleSet::only([Role::Risk]);
    registry
        .create_environment(&admin(), &restricted, None)
        .await
        .unwrap();
    let planner = registry.planner();
    let item = planner
        .create_action_item(
            &Actor::new("rita", Role::Risk),
            &NewActionItem {
                env_id: "risk-only".into(),
                description: "Re-run stress scenarios".into(),
                owner: "rita".into(),
                due_date: None,
                target: None,
            },
        )
        .await
        .unwrap();

    let err = planner
        .close_action_item(&Actor::new("dan", Role::Developer), item.id, "done")
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Permission(_)), "{err}");
    let open = planner
        .action_items("risk-only", Some(ActionStatus::Open))
        .await
        .unwrap();
    assert_eq!(open.len(), 1);

    let err = planner
        .close_action_item(&admin(), 404, "done")
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::NotFound(_)));

    planner
        .close_action_item(&Actor::new("rita", Role::Risk), item.id, "done")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_edit_environment_changes_metadata_and_access() {
    let (_dir, registry) = setup().await;
    let developer = Actor::new("dan", Role::Developer);
    add(&registry, milestone("Before", 1, None, &[])).await;
    registry
        .create_milestone(&developer, &milestone("By dan", 1, None, &[]))
        .await
        .unwrap();

    let edit = EnvironmentEdit {
        name: Some("Year-end plan (risk)".into()),
        purpose: Some("Risk sign-off".into()),
        allowed_roles: Some(RoleSet::only([Role::Admin, Role::Risk])),
        ..Default::default()
    };
    let err = registry
        .edit_environment(&developer, "plan", &edit, "restrict")
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Permission(_)));

    let env = registry
        .edit_environment(&admin(), "plan", &edit, "restrict to risk")
        .await
        .unwrap();
    assert_eq!(env.name, "Year-end plan (risk)");
    assert_eq!(env.purpose.as_deref(), Some("Risk sign-off"));
    assert_eq!(env.status, EnvStatus::Active);
    assert!(!env.allowed_roles.allows(Role::Developer));

    // The new role set applies straight away
    let err = registry
        .create_milestone(&developer, &milestone("After", 1, None, &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Permission(_)));

    let trail = registry
        .audit_for(&Target::Environment("plan".into()))
        .await
        .unwrap();
    let last = trail.last().unwrap();
    assert_eq!(last.action, AuditAction::Update);
    assert_eq!(last.capacity, Capacity::Admin);
    assert!(last.comment.as_deref().unwrap().contains("restrict to risk"));

    // Repeating the same edit changes nothing
    let err = registry
        .edit_environment(&admin(), "plan", &edit, "again")
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Validation(_)));
}

#[tokio::test]
async fn test_edit_environment_rules() {
    let (_dir, registry) = setup().await;
    let other = NewEnvironment::new("qa", "QA", Category::Testing);
    registry.create_environment(&admin(), &other, None).await.unwrap();

    let rename = |name: &str| EnvironmentEdit {
        name: Some(name.into()),
        ..Default::default()
    };
    let err = registry
        .edit_environment(&admin(), "plan", &rename("QA"), "clash")
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Validation(_)), "{err}");
    let err = registry
        .edit_environment(&admin(), "plan", &rename(" "), "blank")
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Validation(_)));
    let err = registry
        .edit_environment(&admin(), "plan", &rename("Plan B"), " ")
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Validation(_)));
    let err = registry
        .edit_environment(&admin(), "nowhere", &rename("Plan B"), "missing")
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::NotFound(_)));

    let archive = EnvironmentEdit {
        status: Some(EnvStatus::Archived),
        ..Default::default()
    };
    let env = registry
        .edit_environment(&admin(), "qa", &archive, "done with it")
        .await
        .unwrap();
    assert_eq!(env.status, EnvStatus::Archived);

    // Archived is terminal for edits too
    let reopen = EnvironmentEdit {
        status: Some(EnvStatus::Active),
        ..Default::default()
    };
    let err = registry
        .edit_environment(&admin(), "qa", &reopen, "reopen")
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Validation(_)));
    let err = registry
        .edit_environment(&admin(), "qa", &rename("QA 2"), "rename")
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Validation(_)));
    assert_eq!(registry.get_environment("qa").await.unwrap().name, "QA");
}
