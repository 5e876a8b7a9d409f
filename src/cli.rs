use clap::Parser;

use ehrflow::{output::OutputMode, pipeline::ExportFormat};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Pipeline definition file to use
    #[arg(short = 'f', long = "file", default_value = "ehrflow.toml")]
    pub file: String,

    /// Load an exported template (.json or .toml) instead of a definition file
    #[arg(long = "template", conflicts_with = "file")]
    pub template: Option<String>,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Override the maximum number of concurrent dispatches
    #[arg(short = 'j', long = "workers")]
    pub workers: Option<usize>,

    /// Queue served by this worker (repeatable); replaces the configured list
    #[arg(short = 'q', long = "queue")]
    pub queues: Vec<String>,

    /// How to display task output in the terminal
    #[arg(long = "output", value_enum)]
    pub output: Option<OutputMode>,

    /// Validate the definition and print a summary without running anything
    #[arg(long = "check", conflicts_with_all = ["dry_run", "export"])]
    pub check: bool,

    /// Show what would be dispatched without running tasks
    #[arg(long = "dry-run", conflicts_with = "export")]
    pub dry_run: bool,

    /// Print the assembled template in the given format
    #[arg(long = "export", value_enum)]
    pub export: Option<ExportFormat>,

    /// Task to run together with its upstream tasks; runs the default task or the whole pipeline if not specified
    pub task: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_queue_flags_accumulate() {
        let cli = Cli::parse_from(["ehrflow", "-q", "syn-01", "--queue", "syn-03", "data_2_json"]);
        assert_eq!(cli.queues, vec!["syn-01", "syn-03"]);
        assert_eq!(cli.task.as_deref(), Some("data_2_json"));
        assert_eq!(cli.file, "ehrflow.toml");
    }

    #[test]
    fn check_conflicts_with_export() {
        assert!(Cli::try_parse_from(["ehrflow", "--check", "--export", "json"]).is_err());
    }
}
