use tracing::info;

use super::Template;

pub fn show_task_relationships(template: &Template, verbose: bool) {
    if !verbose {
        return;
    }

    for note in relationship_notes(template) {
        info!("{}", note);
    }
}

/// Observations about the graph that are legal but worth a second look.
pub fn relationship_notes(template: &Template) -> Vec<String> {
    let mut notes = Vec::new();

    for task_id in template.isolated_tasks() {
        notes.push(format!(
            "Task '{}' has no precedence edges and runs independently of the rest of the pipeline",
            task_id
        ));
    }

    for edge in template.edges() {
        let (Some(upstream), Some(downstream)) =
            (template.task(&edge.upstream), template.task(&edge.downstream))
        else {
            continue;
        };

        if upstream.queue != downstream.queue {
            notes.push(format!(
                "Task '{}' (queue '{}') waits on '{}' (queue '{}') across queues",
                downstream.id, downstream.queue, upstream.id, upstream.queue
            ));
        }
    }

    notes
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::pipeline::{PipelineDefinition, PrecedenceEdge, TaskSpec};

    #[test]
    fn notes_isolated_and_cross_queue_tasks() {
        let template = Template::assemble(
            PipelineDefinition::new("p", NaiveDate::from_ymd_opt(2024, 12, 4).unwrap()),
            vec![
                TaskSpec::script("lectura_ehr", "run.sh").with_queue("syn-01"),
                TaskSpec::container("data_2_json", "node:20", "node index.js").with_queue("syn-02"),
                TaskSpec::container("struc_to_omop", "node:20", "node index.js"),
            ],
            [PrecedenceEdge::new("lectura_ehr", "data_2_json")],
        )
        .unwrap();

        let notes = relationship_notes(&template);
        assert_eq!(notes.len(), 2);
        assert!(notes[0].contains("'struc_to_omop' has no precedence edges"));
        assert!(notes[1].contains("across queues"));
    }

    #[test]
    fn fully_connected_same_queue_graph_has_no_notes() {
        let template = Template::assemble(
            PipelineDefinition::new("p", NaiveDate::from_ymd_opt(2024, 12, 4).unwrap()),
            vec![TaskSpec::script("a", "true"), TaskSpec::script("b", "true")],
            [PrecedenceEdge::new("a", "b")],
        )
        .unwrap();

        assert!(relationship_notes(&template).is_empty());
    }
}
