use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use super::{
    PipelineDefinition, PrecedenceEdge, TaskSpec,
    dependency::{downstream_closure, get_required_tasks, sort_topologically, upstream_map, validate_graph},
};
use crate::{error::Result, retry::RetryPolicy};

#[derive(Debug)]
pub struct ExecutionLevel {
    pub level: usize,
    pub task_ids: Vec<String>,
}

/// A validated, frozen pipeline: metadata, tasks and the precedence DAG.
///
/// Built only through [`Template::assemble`], so every value of this type has
/// unique task ids, edges between known tasks, and no cycles. Tasks without
/// any edge are legal and run independently of the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    definition: PipelineDefinition,
    tasks: Vec<TaskSpec>,
    edges: BTreeSet<PrecedenceEdge>,
}

impl Template {
    pub fn assemble(
        definition: PipelineDefinition,
        tasks: Vec<TaskSpec>,
        edges: impl IntoIterator<Item = PrecedenceEdge>,
    ) -> Result<Self> {
        definition.validate()?;
        for task in &tasks {
            task.validate()?;
        }

        let edges: BTreeSet<PrecedenceEdge> = edges.into_iter().collect();
        validate_graph(&tasks, &edges)?;

        debug!(
            pipeline = %definition.id,
            tasks = tasks.len(),
            edges = edges.len(),
            "assembled pipeline template"
        );

        Ok(Self {
            definition,
            tasks,
            edges,
        })
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    pub fn tasks(&self) -> &[TaskSpec] {
        &self.tasks
    }

    pub fn edges(&self) -> &BTreeSet<PrecedenceEdge> {
        &self.edges
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn upstream(&self, task_id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.downstream == task_id)
            .map(|e| e.upstream.as_str())
            .collect()
    }

    pub fn downstream(&self, task_id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.upstream == task_id)
            .map(|e| e.downstream.as_str())
            .collect()
    }

    pub fn downstream_closure(&self, task_id: &str) -> BTreeSet<String> {
        downstream_closure(&self.edges, task_id)
    }

    /// `task_id` preceded by everything it transitively waits on, in run order.
    pub fn upstream_closure(&self, task_id: &str) -> Result<Vec<String>> {
        get_required_tasks(&self.tasks, &self.edges, task_id)
    }

    pub fn isolated_tasks(&self) -> Vec<&str> {
        self.tasks
            .iter()
            .map(|t| t.id.as_str())
            .filter(|id| {
                !self
                    .edges
                    .iter()
                    .any(|e| e.upstream == *id || e.downstream == *id)
            })
            .collect()
    }

    pub fn topological_order(&self) -> Vec<String> {
        sort_topologically(&self.tasks, &self.edges)
    }

    pub fn is_valid_linearization(&self, order: &[String]) -> bool {
        if order.len() != self.tasks.len() {
            return false;
        }

        let positions: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        if positions.len() != order.len() || self.tasks.iter().any(|t| !positions.contains_key(t.id.as_str())) {
            return false;
        }

        self.edges
            .iter()
            .all(|e| positions[e.upstream.as_str()] < positions[e.downstream.as_str()])
    }

    /// Groups tasks by longest upstream chain; every task in a level can run together.
    pub fn execution_levels(&self) -> Vec<ExecutionLevel> {
        let dependencies = upstream_map(&self.tasks, &self.edges);
        let mut levels: HashMap<&str, usize> = HashMap::new();

        for task in &self.tasks {
            calculate_task_level(&task.id, &dependencies, &mut levels);
        }

        let mut execution_levels: Vec<ExecutionLevel> = Vec::new();
        for task in &self.tasks {
            let level = levels.get(task.id.as_str()).copied().unwrap_or(0);
            match execution_levels.iter_mut().find(|el| el.level == level) {
                Some(existing) => existing.task_ids.push(task.id.clone()),
                None => execution_levels.push(ExecutionLevel {
                    level,
                    task_ids: vec![task.id.clone()],
                }),
            }
        }

        execution_levels.sort_by_key(|el| el.level);
        execution_levels
    }

    pub fn retry_policy(&self, task_id: &str) -> Option<RetryPolicy> {
        self.task(task_id)
            .map(|task| task.retry_policy(&self.definition))
    }
}

fn calculate_task_level<'a>(
    task_id: &'a str,
    dependencies: &HashMap<&'a str, Vec<&'a str>>,
    levels: &mut HashMap<&'a str, usize>,
) -> usize {
    if let Some(&level) = levels.get(task_id) {
        return level;
    }

    let level = match dependencies.get(task_id) {
        Some(upstream) if !upstream.is_empty() => {
            upstream
                .iter()
                .map(|dep| calculate_task_level(*dep, dependencies, levels))
                .max()
                .unwrap_or(0)
                + 1
        }
        _ => 0,
    };

    levels.insert(task_id, level);
    level
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::NaiveDate;

    use super::*;
    use crate::error::FlowError;

    fn definition() -> PipelineDefinition {
        let mut definition =
            PipelineDefinition::new("EHR_a_estructurado", NaiveDate::from_ymd_opt(2024, 12, 4).unwrap());
        definition.retries = 1;
        definition
    }

    /// A (script) -> B, with C and D left unconnected.
    fn ehr_template() -> Template {
        Template::assemble(
            definition(),
            vec![
                TaskSpec::script("A", "/opt/airflow/lib/scripts/execute_knime.sh"),
                TaskSpec::container("B", "bigan/node:1.0.0", "node index.js"),
                TaskSpec::container("C", "bigan/node:1.0.0", "node index.js"),
                TaskSpec::container("D", "bigan/node:1.0.0", "node index.js"),
            ],
            [PrecedenceEdge::new("A", "B")],
        )
        .unwrap()
    }

    fn order(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn single_edge_pipeline_assembles() {
        let template = ehr_template();
        assert_eq!(template.isolated_tasks(), vec!["C", "D"]);
        assert!(template.is_valid_linearization(&template.topological_order()));
    }

    #[test]
    fn any_order_with_a_before_b_is_valid() {
        let template = ehr_template();

        for valid in [
            ["A", "B", "C", "D"],
            ["A", "C", "B", "D"],
            ["C", "A", "B", "D"],
            ["A", "C", "D", "B"],
            ["D", "C", "A", "B"],
        ] {
            assert!(template.is_valid_linearization(&order(&valid)), "{:?}", valid);
        }

        assert!(!template.is_valid_linearization(&order(&["B", "A", "C", "D"])));
        assert!(!template.is_valid_linearization(&order(&["A", "B", "C"])));
        assert!(!template.is_valid_linearization(&order(&["A", "B", "C", "C"])));
    }

    #[test]
    fn cyclic_edges_produce_no_template() {
        let result = Template::assemble(
            definition(),
            vec![TaskSpec::script("a", "true"), TaskSpec::script("b", "true")],
            [PrecedenceEdge::new("a", "b"), PrecedenceEdge::new("b", "a")],
        );
        assert!(matches!(result, Err(FlowError::CycleDetected { .. })));
    }

    #[test]
    fn empty_pipeline_id_is_rejected() {
        let mut definition = definition();
        definition.id = String::new();
        let result = Template::assemble(definition, vec![], []);
        assert!(matches!(result, Err(FlowError::Definition(_))));
    }

    #[test]
    fn repeated_edges_collapse() {
        let template = Template::assemble(
            definition(),
            vec![TaskSpec::script("a", "true"), TaskSpec::script("b", "true")],
            [PrecedenceEdge::new("a", "b"), PrecedenceEdge::new("a", "b")],
        )
        .unwrap();
        assert_eq!(template.edges().len(), 1);
        assert_eq!(template.upstream("b"), vec!["a"]);
        assert_eq!(template.downstream("a"), vec!["b"]);
    }

    #[test]
    fn levels_follow_longest_chain() {
        let template = Template::assemble(
            definition(),
            vec![
                TaskSpec::script("a", "true"),
                TaskSpec::script("b", "true"),
                TaskSpec::script("c", "true"),
                TaskSpec::script("d", "true"),
            ],
            [
                PrecedenceEdge::new("a", "b"),
                PrecedenceEdge::new("b", "c"),
                PrecedenceEdge::new("a", "c"),
            ],
        )
        .unwrap();

        let levels = template.execution_levels();
        let ids: Vec<(usize, Vec<String>)> =
            levels.into_iter().map(|l| (l.level, l.task_ids)).collect();
        assert_eq!(
            ids,
            vec![
                (0, order(&["a", "d"])),
                (1, order(&["b"])),
                (2, order(&["c"])),
            ]
        );
    }

    #[test]
    fn retry_policy_comes_from_pipeline_defaults() {
        let template = ehr_template();
        let policy = template.retry_policy("B").unwrap();
        assert_eq!(policy.retries, 1);
        assert_eq!(policy.retry_delay, Duration::from_secs(300));
        assert!(template.retry_policy("missing").is_none());
    }
}
