use std::{
    collections::{BTreeMap, HashMap},
    env, fs,
    sync::OnceLock,
    time::Duration,
};

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{
    ContainerTask, DEFAULT_NETWORK_MODE, DEFAULT_QUEUE, Mount, PipelineDefinition,
    PrecedenceEdge, ScriptTask, TaskKind, TaskSpec, Template,
};
use crate::{
    error::{FlowError, Result},
    output::OutputMode,
    util::duration_serde,
};

#[derive(Debug, Deserialize)]
struct Config {
    pipeline: PipelineDefinition,
    #[serde(rename = "task", default)]
    tasks: BTreeMap<String, TaskEntry>,
    #[serde(rename = "edge", default)]
    edges: Vec<PrecedenceEdge>,
    config: Option<ConfigSection>,
    #[serde(default)]
    variables: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigSection {
    default: Option<String>,
    workers: Option<usize>,
    queues: Option<Vec<String>>,
    docker_url: Option<String>,
    output: Option<OutputMode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TaskKindName {
    Script,
    Container,
}

#[derive(Debug, Deserialize)]
struct TaskEntry {
    kind: TaskKindName,
    #[serde(default)]
    id: String,
    queue: Option<String>,
    command: String,
    #[serde(default)]
    environment: BTreeMap<String, String>,
    #[serde(default)]
    dependencies: Vec<String>,
    retries: Option<u32>,
    #[serde(default, with = "duration_serde::option")]
    retry_delay: Option<Duration>,
    image: Option<String>,
    docker_url: Option<String>,
    network_mode: Option<String>,
    #[serde(default)]
    mounts: Vec<Mount>,
    #[serde(default)]
    auto_remove: bool,
}

#[derive(Debug)]
pub struct PipelineConfiguration {
    pub template: Template,
    pub default_task: Option<String>,
    pub workers: Option<usize>,
    pub queues: Vec<String>,
    pub output: Option<OutputMode>,
}

impl PipelineConfiguration {
    /// Configuration for a template imported without a definition file.
    pub fn from_template(template: Template) -> Self {
        Self {
            template,
            default_task: None,
            workers: None,
            queues: vec![DEFAULT_QUEUE.to_string()],
            output: None,
        }
    }
}

pub fn load_pipeline(config_path: &str) -> Result<PipelineConfiguration> {
    let contents = fs::read_to_string(config_path)?;
    let configuration = parse_pipeline(&contents)?;
    debug!(path = config_path, pipeline = %configuration.template.definition().id, "loaded pipeline");
    Ok(configuration)
}

pub fn parse_pipeline(contents: &str) -> Result<PipelineConfiguration> {
    let config: Config = toml::from_str(contents)?;
    process_config(config)
}

fn process_config(config: Config) -> Result<PipelineConfiguration> {
    let section = config.config.unwrap_or_default();

    let mut variables = config.variables;
    add_builtin_variables(&mut variables);

    let mut tasks = Vec::with_capacity(config.tasks.len());
    let mut edges = config.edges;

    for (name, entry) in config.tasks {
        let task = build_task(name, entry, section.docker_url.as_deref(), &variables, &mut edges)?;
        tasks.push(task);
    }

    let template = Template::assemble(config.pipeline, tasks, edges)?;

    Ok(PipelineConfiguration {
        template,
        default_task: section.default,
        workers: section.workers,
        queues: section
            .queues
            .unwrap_or_else(|| vec![DEFAULT_QUEUE.to_string()]),
        output: section.output,
    })
}

fn build_task(
    name: String,
    entry: TaskEntry,
    default_docker_url: Option<&str>,
    variables: &HashMap<String, String>,
    edges: &mut Vec<PrecedenceEdge>,
) -> Result<TaskSpec> {
    let id = if entry.id.is_empty() { name } else { entry.id };

    for upstream in &entry.dependencies {
        edges.push(PrecedenceEdge::new(upstream.clone(), id.clone()));
    }

    let resolve = |field: &str, text: &str| {
        let resolved = substitute_variables(text, variables);
        if has_placeholder(&resolved) {
            warn!(task = %id, field, "unresolved placeholder");
        }
        resolved
    };

    let command = resolve("command", &entry.command);
    let kind = match entry.kind {
        TaskKindName::Script => {
            if entry.image.is_some() || !entry.mounts.is_empty() {
                return Err(FlowError::Definition(format!(
                    "script task '{}' sets container-only fields",
                    id
                )));
            }
            TaskKind::Script(ScriptTask { command })
        }
        TaskKindName::Container => {
            let image = entry.image.ok_or_else(|| {
                FlowError::Definition(format!("container task '{}' has no image", id))
            })?;
            let docker_url = entry
                .docker_url
                .as_deref()
                .or(default_docker_url)
                .map(|url| resolve("docker_url", url));
            let mounts = entry
                .mounts
                .into_iter()
                .map(|mount| Mount {
                    source: resolve("mounts.source", &mount.source),
                    target: resolve("mounts.target", &mount.target),
                    ..mount
                })
                .collect();

            TaskKind::Container(ContainerTask {
                image: resolve("image", &image),
                command,
                docker_url,
                network_mode: entry
                    .network_mode
                    .unwrap_or_else(|| DEFAULT_NETWORK_MODE.to_string()),
                mounts,
                auto_remove: entry.auto_remove,
            })
        }
    };

    // Values may be secrets, so only the key is ever logged.
    let environment: BTreeMap<String, String> = entry
        .environment
        .iter()
        .map(|(key, value)| (key.clone(), resolve(key, value)))
        .collect();

    Ok(TaskSpec {
        id,
        queue: entry.queue.unwrap_or_else(|| DEFAULT_QUEUE.to_string()),
        environment,
        retries: entry.retries,
        retry_delay: entry.retry_delay,
        kind,
    })
}

fn add_builtin_variables(variables: &mut HashMap<String, String>) {
    for (key, value) in env::vars() {
        variables.insert(format!("ENV_{}", key), value);
    }

    if let Ok(pwd) = env::current_dir() {
        variables.insert("PWD".to_string(), pwd.to_string_lossy().to_string());
    }
}

fn braced_regex() -> &'static Regex {
    static BRACED: OnceLock<Regex> = OnceLock::new();
    BRACED.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap())
}

fn simple_regex() -> &'static Regex {
    static SIMPLE: OnceLock<Regex> = OnceLock::new();
    SIMPLE.get_or_init(|| Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b").unwrap())
}

fn has_placeholder(text: &str) -> bool {
    braced_regex().is_match(text)
}

fn substitute_variables(text: &str, variables: &HashMap<String, String>) -> String {
    let result = braced_regex()
        .replace_all(text, |caps: &regex::Captures| {
            let var_name = &caps[1];
            variables
                .get(var_name)
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .to_string();

    simple_regex()
        .replace_all(&result, |caps: &regex::Captures| {
            let var_name = &caps[1];
            variables
                .get(var_name)
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .to_string()
}
