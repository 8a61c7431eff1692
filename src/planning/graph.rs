use std::collections::BTreeSet;

use petgraph::algo::{has_path_connecting, tarjan_scc};
use petgraph::graphmap::DiGraphMap;

use crate::state::models::Dependency;

/// Task graph keyed by milestone id.
///
/// An edge from A -> B means B depends on A (A must finish before B starts).
pub type TaskGraph = DiGraphMap<i64, ()>;

/// Build the task graph from a set of task ids and finish-to-start edges.
/// Edges naming an unknown task are ignored.
pub fn build_task_graph(task_ids: impl IntoIterator<Item = i64>, deps: &[Dependency]) -> TaskGraph {
    let mut graph = TaskGraph::new();
    for id in task_ids {
        graph.add_node(id);
    }
    for dep in deps {
        if graph.contains_node(dep.predecessor_task_id) && graph.contains_node(dep.task_id) {
            graph.add_edge(dep.predecessor_task_id, dep.task_id, ());
        }
    }
    graph
}

/// Whether adding `predecessor -> task` to `existing` would close a loop,
/// i.e. `predecessor` is already reachable from `task`.
pub fn would_create_cycle(existing: &[Dependency], task_id: i64, predecessor_id: i64) -> bool {
    if task_id == predecessor_id {
        return true;
    }
    let mut graph = TaskGraph::new();
    for dep in existing {
        graph.add_edge(dep.predecessor_task_id, dep.task_id, ());
    }
    if !graph.contains_node(task_id) || !graph.contains_node(predecessor_id) {
        return false;
    }
    has_path_connecting(&graph, task_id, predecessor_id, None)
}

/// Strongly connected components that form a cycle, each sorted by id.
pub fn find_cycles(graph: &TaskGraph) -> Vec<Vec<i64>> {
    let mut cycles: Vec<Vec<i64>> = tarjan_scc(graph)
        .into_iter()
        .filter(|component| {
            component.len() > 1
                || component
                    .first()
                    .is_some_and(|n| graph.contains_edge(*n, *n))
        })
        .map(|mut component| {
            component.sort_unstable();
            component
        })
        .collect();
    cycles.sort();
    cycles
}

/// Ids of every task that sits on some cycle.
pub fn cyclic_tasks(cycles: &[Vec<i64>]) -> BTreeSet<i64> {
    cycles.iter().flatten().copied().collect()
}
