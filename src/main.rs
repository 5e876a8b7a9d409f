use clap::Parser;
use std::{path::Path, process, sync::Arc};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::Cli;
use ehrflow::{
    FlowError, Result,
    dispatch::{DispatchRequest, ProcessDispatcher},
    execution::TaskRunner,
    output::OutputMode,
    pipeline::{
        PipelineConfiguration, Template, TemplateDocument, analysis::relationship_notes,
        load_pipeline, show_task_relationships,
    },
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Cli::parse();
    init_logging(args.verbose);

    match run_ehrflow(args).await {
        Ok(()) => Ok(()),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // A subscriber may already be installed when embedded; keep the existing one.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

async fn run_ehrflow(args: Cli) -> Result<()> {
    let config = match &args.template {
        Some(path) => {
            let document = TemplateDocument::load(Path::new(path))?;
            PipelineConfiguration::from_template(Template::from_document(document)?)
        }
        None => load_pipeline(&args.file)?,
    };
    let template = Arc::new(config.template);

    show_task_relationships(&template, args.verbose);

    if args.check {
        print_summary(&template);
        return Ok(());
    }

    if let Some(format) = args.export {
        println!("{}", template.to_document().render(format)?);
        return Ok(());
    }

    let task_list = match args.task.as_ref().or(config.default_task.as_ref()) {
        Some(task_id) => template.upstream_closure(task_id)?,
        None => template.topological_order(),
    };

    if args.verbose {
        println!("Task dispatch order: {}", task_list.join(" -> "));
    }

    if args.dry_run {
        print_plan(&template, &task_list);
        return Ok(());
    }

    let queues = if args.queues.is_empty() {
        config.queues
    } else {
        args.queues
    };
    let output_mode = args.output.or(config.output).unwrap_or(OutputMode::Group);

    let runner = TaskRunner::new(
        Arc::clone(&template),
        Arc::new(ProcessDispatcher::new(output_mode)),
        args.workers.or(config.workers),
        queues,
    );
    let report = runner.run_tasks(&task_list).await?;

    for (task_id, record) in &report.records {
        println!(
            "{}: {:?} after {} attempt(s)",
            task_id, record.outcome, record.attempts
        );
    }

    if report.succeeded() {
        Ok(())
    } else {
        Err(FlowError::RunFailed(report.unsuccessful_tasks()))
    }
}

fn print_summary(template: &Template) {
    let definition = template.definition();
    println!("Pipeline '{}' is valid", definition.id);
    println!(
        "  schedule: {} (fires automatically: {})",
        definition.schedule,
        definition.schedule.fires_automatically()
    );
    println!("  start date: {}, catchup: {}", definition.start_date, definition.catchup);
    println!(
        "  retries: {}, retry delay: {}",
        definition.retries,
        humantime::format_duration(definition.retry_delay)
    );
    println!("  tasks: {}, edges: {}", template.tasks().len(), template.edges().len());
    for edge in template.edges() {
        println!("    {}", edge);
    }
    for note in relationship_notes(template) {
        println!("  note: {}", note);
    }
}

fn print_plan(template: &Template, task_list: &[String]) {
    println!("Dry run mode - showing what would be dispatched:");
    for level in template.execution_levels() {
        let in_run: Vec<&str> = level
            .task_ids
            .iter()
            .filter(|id| task_list.contains(id))
            .map(String::as_str)
            .collect();
        if in_run.is_empty() {
            continue;
        }
        println!("  Level {}: {}", level.level, in_run.join(", "));
    }

    for task_id in task_list {
        if let Some(task) = template.task(task_id) {
            let request = DispatchRequest::for_task(task, 1);
            println!(
                "  {} [queue {}] would run: {}",
                task.id,
                task.queue,
                ProcessDispatcher::command_for(&request.payload)
            );
        }
    }
}
