use thiserror::Error;

use crate::retry::AttemptState;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Duplicate task id '{0}'")]
    DuplicateTask(String),

    #[error("Edge '{upstream}' -> '{downstream}' references unknown task '{missing}'")]
    UnknownTaskReference {
        upstream: String,
        downstream: String,
        missing: String,
    },

    #[error("Circular dependency: {}", .cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },

    #[error("Definition error: {0}")]
    Definition(String),

    #[error("Task '{0}' not found")]
    TaskNotFound(String),

    #[error("Task '{task}' requires queue '{queue}', which this worker does not serve")]
    UnservedQueue { task: String, queue: String },

    #[error("Task '{task}' cannot move from {from} to {to}")]
    InvalidTransition {
        task: String,
        from: AttemptState,
        to: AttemptState,
    },

    #[error("Failed to execute '{program}': {source}")]
    Command {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Run failed: {}", .0.join(", "))]
    RunFailed(Vec<String>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialize error: {0}")]
    Serialize(String),
}

impl From<toml::de::Error> for FlowError {
    fn from(err: toml::de::Error) -> Self {
        FlowError::Parse(err.to_string())
    }
}

impl From<toml::ser::Error> for FlowError {
    fn from(err: toml::ser::Error) -> Self {
        FlowError::Serialize(err.to_string())
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            FlowError::Parse(err.to_string())
        } else {
            FlowError::Serialize(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
