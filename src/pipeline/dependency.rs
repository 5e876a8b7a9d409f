use std::collections::{BTreeSet, HashMap, HashSet, VecDeque, hash_map::Entry::Occupied};

use super::{PrecedenceEdge, TaskSpec};
use crate::error::{FlowError, Result};

/// Upstream task ids of every task, in edge order.
pub fn upstream_map<'a>(
    tasks: &'a [TaskSpec],
    edges: &'a BTreeSet<PrecedenceEdge>,
) -> HashMap<&'a str, Vec<&'a str>> {
    let mut map: HashMap<&str, Vec<&str>> =
        tasks.iter().map(|t| (t.id.as_str(), Vec::new())).collect();

    for edge in edges {
        map.entry(edge.downstream.as_str())
            .or_default()
            .push(edge.upstream.as_str());
    }

    map
}

/// Kahn's algorithm; ties are broken by task declaration order.
pub fn sort_topologically(tasks: &[TaskSpec], edges: &BTreeSet<PrecedenceEdge>) -> Vec<String> {
    let dependencies = upstream_map(tasks, edges);
    let mut in_degrees: HashMap<&str, usize> = HashMap::new();

    for task in tasks {
        let count = dependencies.get(task.id.as_str()).map_or(0, Vec::len);
        in_degrees.insert(&task.id, count);
    }

    let mut queue: VecDeque<&str> = tasks
        .iter()
        .filter(|t| in_degrees.get(t.id.as_str()) == Some(&0))
        .map(|t| t.id.as_str())
        .collect();

    let mut sorted_tasks: Vec<String> = Vec::new();

    while let Some(task_id) = queue.pop_front() {
        sorted_tasks.push(task_id.to_string());

        for dependent in tasks {
            let depends_on_task = dependencies
                .get(dependent.id.as_str())
                .is_some_and(|deps| deps.contains(&task_id));
            if !depends_on_task {
                continue;
            }

            let entry = in_degrees
                .entry(&dependent.id)
                .and_modify(|c| *c = c.saturating_sub(1));

            if let Occupied(entry) = entry {
                if *entry.get() == 0 {
                    queue.push_back(&dependent.id);
                }
            }
        }
    }

    sorted_tasks
}

pub fn validate_graph(tasks: &[TaskSpec], edges: &BTreeSet<PrecedenceEdge>) -> Result<()> {
    let mut task_ids: HashSet<&str> = HashSet::new();

    for task in tasks {
        if !task_ids.insert(task.id.as_str()) {
            return Err(FlowError::DuplicateTask(task.id.clone()));
        }
    }

    for edge in edges {
        for endpoint in [&edge.upstream, &edge.downstream] {
            if !task_ids.contains(endpoint.as_str()) {
                return Err(FlowError::UnknownTaskReference {
                    upstream: edge.upstream.clone(),
                    downstream: edge.downstream.clone(),
                    missing: endpoint.clone(),
                });
            }
        }

        if edge.upstream == edge.downstream {
            return Err(FlowError::CycleDetected {
                cycle: vec![edge.upstream.clone(), edge.downstream.clone()],
            });
        }
    }

    detect_cycles(tasks, edges)
}

fn detect_cycles(tasks: &[TaskSpec], edges: &BTreeSet<PrecedenceEdge>) -> Result<()> {
    let dependencies = upstream_map(tasks, edges);
    let mut visited = HashSet::new();

    for task in tasks {
        let mut path = Vec::new();

        if let Some(mut cycle) = find_cycle(&task.id, &dependencies, &mut visited, &mut path) {
            // The walk follows dependencies, so flip it into precedence order.
            cycle.reverse();
            return Err(FlowError::CycleDetected { cycle });
        }
    }

    Ok(())
}

fn find_cycle<'a>(
    task_id: &'a str,
    dependencies: &HashMap<&'a str, Vec<&'a str>>,
    visited: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    if let Some(start) = path.iter().position(|id| *id == task_id) {
        let mut cycle: Vec<String> = path[start..].iter().map(|id| id.to_string()).collect();
        cycle.push(task_id.to_string());
        return Some(cycle);
    }

    if !visited.insert(task_id) {
        return None;
    }

    path.push(task_id);

    if let Some(upstream) = dependencies.get(task_id) {
        for dep in upstream {
            if let Some(cycle) = find_cycle(*dep, dependencies, visited, path) {
                return Some(cycle);
            }
        }
    }

    path.pop();

    None
}

/// Tasks that must run, in order, for `target_task_id` to run.
pub fn get_required_tasks(
    tasks: &[TaskSpec],
    edges: &BTreeSet<PrecedenceEdge>,
    target_task_id: &str,
) -> Result<Vec<String>> {
    let dependencies = upstream_map(tasks, edges);

    if !dependencies.contains_key(target_task_id) {
        return Err(FlowError::TaskNotFound(target_task_id.to_string()));
    }

    let mut needed_tasks = HashSet::new();
    let mut queue = VecDeque::new();

    queue.push_back(target_task_id);

    while let Some(current_task_id) = queue.pop_front() {
        if !needed_tasks.insert(current_task_id) {
            continue;
        }

        if let Some(upstream) = dependencies.get(current_task_id) {
            for dep in upstream {
                if !needed_tasks.contains(dep) {
                    queue.push_back(*dep);
                }
            }
        }
    }

    let filtered_tasks: Vec<TaskSpec> = tasks
        .iter()
        .filter(|task| needed_tasks.contains(task.id.as_str()))
        .cloned()
        .collect();
    let filtered_edges: BTreeSet<PrecedenceEdge> = edges
        .iter()
        .filter(|e| needed_tasks.contains(e.downstream.as_str()))
        .cloned()
        .collect();

    Ok(sort_topologically(&filtered_tasks, &filtered_edges))
}

/// Every task reachable by following edges forward from `task_id`.
pub fn downstream_closure(edges: &BTreeSet<PrecedenceEdge>, task_id: &str) -> BTreeSet<String> {
    let mut closure = BTreeSet::new();
    let mut queue = VecDeque::from([task_id]);

    while let Some(current) = queue.pop_front() {
        for edge in edges.iter().filter(|e| e.upstream == current) {
            if closure.insert(edge.downstream.clone()) {
                queue.push_back(&edge.downstream);
            }
        }
    }

    closure
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tasks(ids: &[&str]) -> Vec<TaskSpec> {
        ids.iter().map(|id| TaskSpec::script(*id, "true")).collect()
    }

    fn edges(pairs: &[(&str, &str)]) -> BTreeSet<PrecedenceEdge> {
        pairs
            .iter()
            .map(|(up, down)| PrecedenceEdge::new(*up, *down))
            .collect()
    }

    #[test]
    fn sort_respects_every_edge() {
        let tasks = tasks(&["d", "c", "b", "a"]);
        let edges = edges(&[("a", "b"), ("b", "c"), ("a", "d"), ("c", "d")]);

        let order = sort_topologically(&tasks, &edges);
        let position = |id: &str| order.iter().position(|t| t == id).unwrap();

        assert_eq!(order.len(), 4);
        for edge in &edges {
            assert!(position(&edge.upstream) < position(&edge.downstream));
        }
    }

    #[test]
    fn unconnected_tasks_keep_declaration_order() {
        let tasks = tasks(&["lectura_ehr", "data_2_json", "json_2_struct", "struc_to_omop"]);
        let edges = edges(&[("lectura_ehr", "data_2_json")]);

        assert_eq!(
            sort_topologically(&tasks, &edges),
            vec!["lectura_ehr", "json_2_struct", "struc_to_omop", "data_2_json"]
        );
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let tasks = tasks(&["a", "b", "a"]);
        let err = validate_graph(&tasks, &BTreeSet::new()).unwrap_err();
        assert!(matches!(err, FlowError::DuplicateTask(id) if id == "a"));
    }

    #[test]
    fn unknown_endpoints_are_rejected() {
        let err = validate_graph(&tasks(&["a"]), &edges(&[("a", "ghost")])).unwrap_err();
        assert!(matches!(
            err,
            FlowError::UnknownTaskReference { missing, .. } if missing == "ghost"
        ));
    }

    #[test]
    fn self_edge_is_a_cycle() {
        let err = validate_graph(&tasks(&["a"]), &edges(&[("a", "a")])).unwrap_err();
        assert!(matches!(err, FlowError::CycleDetected { cycle } if cycle == ["a", "a"]));
    }

    #[test]
    fn cycle_is_reported_in_precedence_order() {
        let tasks = tasks(&["a", "b", "c", "x"]);
        let edges = edges(&[("a", "b"), ("b", "c"), ("c", "a"), ("x", "a")]);

        match validate_graph(&tasks, &edges) {
            Err(FlowError::CycleDetected { cycle }) => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
                for pair in cycle.windows(2) {
                    assert!(edges.contains(&PrecedenceEdge::new(&pair[0], &pair[1])));
                }
                assert!(!cycle.contains(&"x".to_string()));
            }
            other => panic!("expected a cycle, got {:?}", other),
        }
    }

    #[test]
    fn required_tasks_follow_upstream_edges_only() {
        let tasks = tasks(&["a", "b", "c", "d"]);
        let edges = edges(&[("a", "b"), ("b", "c"), ("c", "d")]);

        assert_eq!(get_required_tasks(&tasks, &edges, "c").unwrap(), vec!["a", "b", "c"]);
        assert!(matches!(
            get_required_tasks(&tasks, &edges, "zzz"),
            Err(FlowError::TaskNotFound(_))
        ));
    }

    #[test]
    fn downstream_closure_is_transitive() {
        let edges = edges(&[("a", "b"), ("b", "c"), ("x", "y")]);
        let closure = downstream_closure(&edges, "a");
        assert_eq!(closure.into_iter().collect::<Vec<_>>(), vec!["b", "c"]);
    }
}
