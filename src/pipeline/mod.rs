pub mod analysis;
pub mod config;
pub mod dependency;
pub mod document;
pub mod template;

pub use analysis::show_task_relationships;
pub use config::{PipelineConfiguration, load_pipeline};
pub use document::{ExportFormat, TemplateDocument};
pub use template::Template;

use std::{collections::BTreeMap, fmt, str::FromStr, time::Duration};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{
    error::{FlowError, Result},
    retry::RetryPolicy,
    util::duration_serde,
};

pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_NETWORK_MODE: &str = "bridge";
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

const CRON_PRESETS: &[&str] = &[
    "@hourly", "@daily", "@midnight", "@weekly", "@monthly", "@yearly", "@annually",
];

/// Pipeline-level metadata shared by every task of a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub schedule: Schedule,
    pub start_date: NaiveDate,
    #[serde(default)]
    pub catchup: bool,
    #[serde(default)]
    pub retries: u32,
    #[serde(default = "default_retry_delay", with = "duration_serde")]
    pub retry_delay: Duration,
}

fn default_retry_delay() -> Duration {
    DEFAULT_RETRY_DELAY
}

impl PipelineDefinition {
    pub fn new(id: impl Into<String>, start_date: NaiveDate) -> Self {
        Self {
            id: id.into(),
            description: None,
            owner: None,
            schedule: Schedule::Manual,
            start_date,
            catchup: false,
            retries: 0,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(FlowError::Definition("pipeline id must not be empty".into()));
        }
        Ok(())
    }
}

/// When the external scheduler may trigger a run on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Schedule {
    /// Only ever triggered by hand.
    #[default]
    Manual,
    Cron(String),
}

impl Schedule {
    pub fn fires_automatically(&self) -> bool {
        matches!(self, Schedule::Cron(_))
    }
}

impl FromStr for Schedule {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();

        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("manual") {
            return Ok(Schedule::Manual);
        }

        if trimmed.starts_with('@') {
            if CRON_PRESETS.contains(&trimmed) {
                return Ok(Schedule::Cron(trimmed.to_string()));
            }
            return Err(FlowError::Definition(format!(
                "unknown schedule preset '{}'",
                trimmed
            )));
        }

        let fields = trimmed.split_whitespace().count();
        if !(5..=6).contains(&fields) {
            return Err(FlowError::Definition(format!(
                "cron expression '{}' has {} fields, expected 5 or 6",
                trimmed, fields
            )));
        }

        Ok(Schedule::Cron(trimmed.split_whitespace().collect::<Vec<_>>().join(" ")))
    }
}

impl TryFrom<String> for Schedule {
    type Error = FlowError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Schedule> for String {
    fn from(schedule: Schedule) -> Self {
        schedule.to_string()
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Manual => write!(f, "manual"),
            Schedule::Cron(expr) => write!(f, "{}", expr),
        }
    }
}

/// One unit of work in a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "duration_serde::option"
    )]
    pub retry_delay: Option<Duration>,
    #[serde(flatten)]
    pub kind: TaskKind,
}

fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TaskKind {
    Script(ScriptTask),
    Container(ContainerTask),
}

/// A shell command run on the worker host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptTask {
    pub command: String,
}

/// A command run inside a throwaway container on a remote daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerTask {
    pub image: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_url: Option<String>,
    #[serde(default = "default_network_mode")]
    pub network_mode: String,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub auto_remove: bool,
}

fn default_network_mode() -> String {
    DEFAULT_NETWORK_MODE.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: String,
    pub target: String,
    #[serde(rename = "type", default)]
    pub mount_type: MountType,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountType {
    #[default]
    Bind,
    Volume,
}

impl fmt::Display for MountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountType::Bind => write!(f, "bind"),
            MountType::Volume => write!(f, "volume"),
        }
    }
}

impl TaskSpec {
    pub fn script(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            queue: default_queue(),
            environment: BTreeMap::new(),
            retries: None,
            retry_delay: None,
            kind: TaskKind::Script(ScriptTask {
                command: command.into(),
            }),
        }
    }

    pub fn container(
        id: impl Into<String>,
        image: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            queue: default_queue(),
            environment: BTreeMap::new(),
            retries: None,
            retry_delay: None,
            kind: TaskKind::Container(ContainerTask {
                image: image.into(),
                command: command.into(),
                docker_url: None,
                network_mode: default_network_mode(),
                mounts: Vec::new(),
                auto_remove: false,
            }),
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn command(&self) -> &str {
        match &self.kind {
            TaskKind::Script(script) => &script.command,
            TaskKind::Container(container) => &container.command,
        }
    }

    /// Task overrides win over the pipeline defaults, field by field.
    pub fn retry_policy(&self, defaults: &PipelineDefinition) -> RetryPolicy {
        RetryPolicy::new(
            self.retries.unwrap_or(defaults.retries),
            self.retry_delay.unwrap_or(defaults.retry_delay),
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(FlowError::Definition("task id must not be empty".into()));
        }
        if self.queue.trim().is_empty() {
            return Err(FlowError::Definition(format!(
                "task '{}' has an empty queue",
                self.id
            )));
        }
        if self.command().trim().is_empty() {
            return Err(FlowError::Definition(format!(
                "task '{}' has an empty command",
                self.id
            )));
        }

        if let TaskKind::Container(container) = &self.kind {
            if container.image.trim().is_empty() {
                return Err(FlowError::Definition(format!(
                    "container task '{}' has an empty image",
                    self.id
                )));
            }
            for mount in &container.mounts {
                if mount.source.is_empty() || !mount.target.starts_with('/') {
                    return Err(FlowError::Definition(format!(
                        "task '{}' mounts '{}' on '{}'; target must be an absolute container path",
                        self.id, mount.source, mount.target
                    )));
                }
            }
        }

        Ok(())
    }
}

/// `upstream` must complete successfully before `downstream` is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PrecedenceEdge {
    pub upstream: String,
    pub downstream: String,
}

impl PrecedenceEdge {
    pub fn new(upstream: impl Into<String>, downstream: impl Into<String>) -> Self {
        Self {
            upstream: upstream.into(),
            downstream: downstream.into(),
        }
    }
}

impl fmt::Display for PrecedenceEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.upstream, self.downstream)
    }
}
