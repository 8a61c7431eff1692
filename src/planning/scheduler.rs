use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use super::graph::{build_task_graph, cyclic_tasks, find_cycles};
use crate::state::models::{Milestone, PlanSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDates {
    pub start: NaiveDate,
    pub due: NaiveDate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleKpis {
    pub project_start: Option<NaiveDate>,
    pub project_end: Option<NaiveDate>,
    pub total_duration_days: i64,
    /// Earliest-starting task first, then each binding successor.
    pub critical_path: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleWarning {
    /// A task with no successors and no stored due date.
    RootWithoutDueDate(i64),
    /// A task none of whose successors could be scheduled.
    Unanchored(i64),
    /// A task whose dates fall outside the calendar chrono can represent.
    DateOutOfRange(i64),
}

impl fmt::Display for ScheduleWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleWarning::RootWithoutDueDate(id) => {
                write!(f, "task #{} has no successors and no due date", id)
            }
            ScheduleWarning::Unanchored(id) => {
                write!(f, "task #{} cannot reach a dated root", id)
            }
            ScheduleWarning::DateOutOfRange(id) => {
                write!(f, "task #{} falls outside the representable date range", id)
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schedule {
    pub tasks: BTreeMap<i64, TaskDates>,
    pub kpis: ScheduleKpis,
    /// Each entry is one cyclic component; its tasks are left unscheduled.
    pub cycle_errors: Vec<Vec<i64>>,
    pub warnings: Vec<ScheduleWarning>,
}

/// Backward-pass schedule of one plan.
///
/// Roots keep their stored due date; every other task finishes the day
/// before its earliest-starting successor. Cyclic components are reported
/// and skipped instead of looping.
pub fn compute_schedule(snapshot: &PlanSnapshot) -> Schedule {
    let by_id: BTreeMap<i64, &Milestone> = snapshot.milestones.iter().map(|m| (m.id, m)).collect();
    let graph = build_task_graph(by_id.keys().copied(), &snapshot.dependencies);
    let cycle_errors = find_cycles(&graph);
    let cyclic = cyclic_tasks(&cycle_errors);

    let mut successors: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
    let mut predecessors: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
    for (pred, task, _) in graph.all_edges() {
        successors.entry(pred).or_default().insert(task);
        predecessors.entry(task).or_default().insert(pred);
    }

    // Successors still to be visited before a task can be resolved.
    let mut remaining: BTreeMap<i64, usize> = by_id
        .keys()
        .filter(|id| !cyclic.contains(id))
        .map(|id| {
            let live = successors
                .get(id)
                .map_or(0, |s| s.iter().filter(|s| !cyclic.contains(s)).count());
            (*id, live)
        })
        .collect();

    let mut queue: VecDeque<i64> = remaining
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut tasks: BTreeMap<i64, TaskDates> = BTreeMap::new();
    let mut warnings = Vec::new();

    while let Some(id) = queue.pop_front() {
        let task = by_id[&id];
        let succs = successors.get(&id);

        let due = match succs {
            None => match task.due_date {
                Some(due) => Some(due),
                None => {
                    warnings.push(ScheduleWarning::RootWithoutDueDate(id));
                    None
                }
            },
            Some(succs) => {
                let earliest = succs.iter().filter_map(|s| tasks.get(s)).map(|d| d.start).min();
                match earliest {
                    Some(start) => match days_before(start, 1) {
                        Some(due) => Some(due),
                        None => {
                            warnings.push(ScheduleWarning::DateOutOfRange(id));
                            None
                        }
                    },
                    None => {
                        warnings.push(ScheduleWarning::Unanchored(id));
                        None
                    }
                }
            }
        };

        if let Some(due) = due {
            match days_before(due, task.effective_duration() - 1) {
                Some(start) => {
                    tasks.insert(id, TaskDates { start, due });
                }
                None => warnings.push(ScheduleWarning::DateOutOfRange(id)),
            }
        }

        for pred in predecessors.get(&id).into_iter().flatten() {
            if let Some(n) = remaining.get_mut(pred) {
                *n -= 1;
                if *n == 0 {
                    queue.push_back(*pred);
                }
            }
        }
    }

    let kpis = compute_kpis(&tasks, &successors);
    Schedule {
        tasks,
        kpis,
        cycle_errors,
        warnings,
    }
}

fn days_before(date: NaiveDate, days: i64) -> Option<NaiveDate> {
    Duration::try_days(days).and_then(|d| date.checked_sub_signed(d))
}

fn compute_kpis(
    tasks: &BTreeMap<i64, TaskDates>,
    successors: &BTreeMap<i64, BTreeSet<i64>>,
) -> ScheduleKpis {
    let project_start = tasks.values().map(|d| d.start).min();
    let project_end = tasks
        .iter()
        .filter(|(id, _)| !successors.contains_key(id))
        .map(|(_, d)| d.due)
        .max();
    let total_duration_days = match (project_start, project_end) {
        (Some(start), Some(end)) => (end - start).num_days() + 1,
        _ => 0,
    };

    let mut critical_path = Vec::new();
    let first = tasks
        .iter()
        .min_by_key(|(id, d)| (d.start, **id))
        .map(|(id, _)| *id);
    let mut current = first;
    while let Some(id) = current {
        critical_path.push(id);
        let due = tasks[&id].due;
        current = successors.get(&id).and_then(|succs| {
            succs
                .iter()
                .filter(|s| tasks.get(s).is_some_and(|d| due.succ_opt() == Some(d.start)))
                .min()
                .copied()
        });
    }

    ScheduleKpis {
        project_start,
        project_end,
        total_duration_days,
        critical_path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::kinds::MilestoneStatus;
    use crate::state::models::Dependency;

    fn task(id: i64, duration: i64, due: Option<&str>) -> Milestone {
        Milestone {
            id,
            env_id: "plan".into(),
            title: format!("task {}", id),
            duration_days: duration,
            due_date: due.map(|d| d.parse().unwrap()),
            owner: "pm".into(),
            status: MilestoneStatus::Pending,
            target: None,
            created_by: "pm".into(),
            created_at: "2025-01-01T00:00:00Z".into(),
        }
    }

    fn dep(task_id: i64, predecessor_task_id: i64) -> Dependency {
        Dependency {
            task_id,
            predecessor_task_id,
        }
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn earliest_successor_constrains_predecessor() {
        // R due 12-31 (2 days); A (10 days) feeds R and B; B (5 days) feeds R.
        let snapshot = PlanSnapshot {
            env_id: "plan".into(),
            milestones: vec![
                task(1, 2, Some("2025-12-31")),
                task(2, 10, None),
                task(3, 5, None),
            ],
            dependencies: vec![dep(1, 2), dep(1, 3), dep(3, 2)],
        };
        let schedule = compute_schedule(&snapshot);

        assert_eq!(
            schedule.tasks[&3],
            TaskDates {
                start: date("2025-12-25"),
                due: date("2025-12-29")
            }
        );
        assert_eq!(
            schedule.tasks[&2],
            TaskDates {
                start: date("2025-12-15"),
                due: date("2025-12-24")
            }
        );
        assert_eq!(schedule.kpis.project_start, Some(date("2025-12-15")));
        assert_eq!(schedule.kpis.project_end, Some(date("2025-12-31")));
        assert_eq!(schedule.kpis.total_duration_days, 17);
        assert_eq!(schedule.kpis.critical_path, vec![2, 3, 1]);
    }

    #[test]
    fn zero_duration_counts_as_one_day() {
        let snapshot = PlanSnapshot {
            env_id: "plan".into(),
            milestones: vec![task(1, 0, Some("2025-03-10"))],
            dependencies: vec![],
        };
        let schedule = compute_schedule(&snapshot);
        assert_eq!(schedule.tasks[&1].start, date("2025-03-10"));
    }

    #[test]
    fn cycles_are_reported_not_followed() {
        let snapshot = PlanSnapshot {
            env_id: "plan".into(),
            milestones: vec![
                task(1, 1, Some("2025-06-30")),
                task(2, 1, None),
                task(3, 1, None),
            ],
            dependencies: vec![dep(2, 3), dep(3, 2)],
        };
        let schedule = compute_schedule(&snapshot);
        assert_eq!(schedule.cycle_errors, vec![vec![2, 3]]);
        assert!(schedule.tasks.contains_key(&1));
        assert!(!schedule.tasks.contains_key(&2));
        assert!(!schedule.tasks.contains_key(&3));
    }

    #[test]
    fn undated_root_is_a_warning() {
        let snapshot = PlanSnapshot {
            env_id: "plan".into(),
            milestones: vec![task(1, 3, None), task(2, 2, None)],
            dependencies: vec![dep(1, 2)],
        };
        let schedule = compute_schedule(&snapshot);
        assert!(schedule.tasks.is_empty());
        assert_eq!(
            schedule.warnings,
            vec![
                ScheduleWarning::RootWithoutDueDate(1),
                ScheduleWarning::Unanchored(2)
            ]
        );
        assert_eq!(schedule.kpis, ScheduleKpis::default());
    }

    #[test]
    fn overflowing_duration_is_left_out() {
        // 2 feeds 1; 3 is independent and still scheduled
        let snapshot = PlanSnapshot {
            env_id: "plan".into(),
            milestones: vec![
                task(1, 1_000_000_000, Some("2025-12-20")),
                task(2, 4, None),
                task(3, 2, Some("2025-12-20")),
            ],
            dependencies: vec![dep(1, 2)],
        };
        let schedule = compute_schedule(&snapshot);
        assert_eq!(
            schedule.warnings,
            vec![
                ScheduleWarning::DateOutOfRange(1),
                ScheduleWarning::Unanchored(2)
            ]
        );
        assert_eq!(schedule.tasks.keys().copied().collect::<Vec<_>>(), vec![3]);
        assert_eq!(schedule.tasks[&3].start, date("2025-12-19"));
    }
}
