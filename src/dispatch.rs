//! Hand-off between the run driver and whatever actually executes a task.
//!
//! The driver builds one [`DispatchRequest`] per attempt and awaits its
//! [`DispatchStatus`]. [`ProcessDispatcher`] runs scripts through `sh -c` and
//! containers through the `docker` CLI against the task's daemon.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::Result,
    output::OutputMode,
    pipeline::{Mount, TaskKind, TaskSpec},
    util::{ProcessCommand, output_print_lock, run_command},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DispatchPayload {
    Script {
        command: String,
        environment: BTreeMap<String, String>,
    },
    Container {
        image: String,
        command: String,
        docker_url: Option<String>,
        network_mode: String,
        mounts: Vec<Mount>,
        auto_remove: bool,
        environment: BTreeMap<String, String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub task_id: String,
    pub queue: String,
    pub attempt: u32,
    pub payload: DispatchPayload,
}

impl DispatchRequest {
    pub fn for_task(task: &TaskSpec, attempt: u32) -> Self {
        let environment = task.environment.clone();
        let payload = match &task.kind {
            TaskKind::Script(script) => DispatchPayload::Script {
                command: script.command.clone(),
                environment,
            },
            TaskKind::Container(container) => DispatchPayload::Container {
                image: container.image.clone(),
                command: container.command.clone(),
                docker_url: container.docker_url.clone(),
                network_mode: container.network_mode.clone(),
                mounts: container.mounts.clone(),
                auto_remove: container.auto_remove,
                environment,
            },
        };

        Self {
            task_id: task.id.clone(),
            queue: task.queue.clone(),
            attempt,
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    Succeeded,
    Failed { exit_code: Option<i32> },
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Runs one attempt to completion.
    ///
    /// `Err` means the attempt could not be started at all; the driver treats
    /// it like a failed attempt.
    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchStatus>;
}

pub struct ProcessDispatcher {
    output_mode: OutputMode,
}

impl ProcessDispatcher {
    pub fn new(output_mode: OutputMode) -> Self {
        Self { output_mode }
    }

    pub fn command_for(payload: &DispatchPayload) -> ProcessCommand {
        match payload {
            DispatchPayload::Script {
                command,
                environment,
            } => script_command(command, environment),
            DispatchPayload::Container { .. } => docker_command(payload),
        }
    }
}

pub fn script_command(command: &str, environment: &BTreeMap<String, String>) -> ProcessCommand {
    ProcessCommand::new("sh")
        .arg("-c")
        .arg(command)
        .envs(environment)
}

/// Builds `docker run` for a container payload.
///
/// Variables are passed as bare `-e KEY` so the values reach the container
/// through the docker client's environment and never show up in argv.
pub fn docker_command(payload: &DispatchPayload) -> ProcessCommand {
    let DispatchPayload::Container {
        image,
        command,
        docker_url,
        network_mode,
        mounts,
        auto_remove,
        environment,
    } = payload
    else {
        return ProcessCommand::new("docker");
    };

    let mut docker = ProcessCommand::new("docker");
    if let Some(url) = docker_url {
        docker = docker.arg("--host").arg(url);
    }
    docker = docker.arg("run");
    if *auto_remove {
        docker = docker.arg("--rm");
    }
    docker = docker.arg("--network").arg(network_mode);

    for mount in mounts {
        let mut spec = format!(
            "type={},source={},target={}",
            mount.mount_type, mount.source, mount.target
        );
        if mount.read_only {
            spec.push_str(",readonly");
        }
        docker = docker.arg("--mount").arg(spec);
    }

    for key in environment.keys() {
        docker = docker.arg("-e").arg(key);
    }

    docker
        .arg(image)
        .arg("sh")
        .arg("-c")
        .arg(command)
        .envs(environment)
}

#[async_trait]
impl Dispatcher for ProcessDispatcher {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchStatus> {
        let command = Self::command_for(&request.payload);
        debug!(task = %request.task_id, attempt = request.attempt, command = %command, "spawning");

        let stream = matches!(self.output_mode, OutputMode::Stream);
        let output = run_command(&command, stream).await?;

        if !stream {
            let _guard = output_print_lock().lock().await;
            print_group(&request.task_id, request.attempt, &output.stdout, &output.stderr);
        }

        if output.status.success() {
            Ok(DispatchStatus::Succeeded)
        } else {
            Ok(DispatchStatus::Failed {
                exit_code: output.status.code(),
            })
        }
    }
}

fn print_group(task_id: &str, attempt: u32, stdout: &[u8], stderr: &[u8]) {
    if stdout.is_empty() && stderr.is_empty() {
        return;
    }

    println!("--- {} (attempt {}) ---", task_id, attempt);
    if !stdout.is_empty() {
        print!("{}", String::from_utf8_lossy(stdout));
    }
    if !stderr.is_empty() {
        eprint!("{}", String::from_utf8_lossy(stderr));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::MountType;

    fn container_task() -> TaskSpec {
        let mut task = TaskSpec::container(
            "json_2_struct",
            "registry.local:8443/bigan/node:1.0.0",
            "node index.js",
        )
        .with_queue("syn-01")
        .with_env("INPUT", "redis")
        .with_env("DB_PASSWORD", "s3cret");

        if let TaskKind::Container(container) = &mut task.kind {
            container.docker_url = Some("http://10.0.0.5:2375".into());
            container.auto_remove = true;
            container.mounts = vec![
                Mount {
                    source: "/data/ehr2struct/JSON2Struct".into(),
                    target: "/usr/src/app".into(),
                    mount_type: MountType::Bind,
                    read_only: false,
                },
                Mount {
                    source: "rules".into(),
                    target: "/rules".into(),
                    mount_type: MountType::Volume,
                    read_only: true,
                },
            ];
        }
        task
    }

    #[test]
    fn container_request_carries_the_whole_payload() {
        let request = DispatchRequest::for_task(&container_task(), 2);

        assert_eq!(request.queue, "syn-01");
        assert_eq!(request.attempt, 2);
        match request.payload {
            DispatchPayload::Container {
                network_mode,
                auto_remove,
                environment,
                mounts,
                ..
            } => {
                assert_eq!(network_mode, "bridge");
                assert!(auto_remove);
                assert_eq!(environment.len(), 2);
                assert_eq!(mounts.len(), 2);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn docker_command_matches_the_payload() {
        let request = DispatchRequest::for_task(&container_task(), 1);
        let command = docker_command(&request.payload);

        assert_eq!(command.program, "docker");
        assert_eq!(
            command.args,
            vec![
                "--host",
                "http://10.0.0.5:2375",
                "run",
                "--rm",
                "--network",
                "bridge",
                "--mount",
                "type=bind,source=/data/ehr2struct/JSON2Struct,target=/usr/src/app",
                "--mount",
                "type=volume,source=rules,target=/rules,readonly",
                "-e",
                "DB_PASSWORD",
                "-e",
                "INPUT",
                "registry.local:8443/bigan/node:1.0.0",
                "sh",
                "-c",
                "node index.js",
            ]
        );
        assert_eq!(command.env.get("DB_PASSWORD").map(String::as_str), Some("s3cret"));
        assert!(!command.to_string().contains("s3cret"));
    }

    #[test]
    fn docker_command_without_daemon_url_uses_local_default() {
        let task = TaskSpec::container("c", "node:20", "node index.js");
        let command = docker_command(&DispatchRequest::for_task(&task, 1).payload);
        assert_eq!(command.args[0], "run");
        assert!(!command.args.contains(&"--rm".to_string()));
    }

    #[test]
    fn script_command_runs_through_sh() {
        let task = TaskSpec::script("lectura_ehr", "/opt/airflow/lib/scripts/execute_knime.sh")
            .with_env("KNIME_HOME", "/opt/knime");
        let request = DispatchRequest::for_task(&task, 1);
        let command = ProcessDispatcher::command_for(&request.payload);

        assert_eq!(command.program, "sh");
        assert_eq!(command.args, vec!["-c", "/opt/airflow/lib/scripts/execute_knime.sh"]);
        assert_eq!(command.env.get("KNIME_HOME").map(String::as_str), Some("/opt/knime"));
    }

    #[tokio::test]
    async fn exit_code_decides_the_status() {
        let dispatcher = ProcessDispatcher::new(OutputMode::Group);

        let ok = DispatchRequest::for_task(&TaskSpec::script("ok", "exit 0"), 1);
        assert_eq!(dispatcher.dispatch(&ok).await.unwrap(), DispatchStatus::Succeeded);

        let failing = DispatchRequest::for_task(&TaskSpec::script("bad", "exit 7"), 1);
        assert_eq!(
            dispatcher.dispatch(&failing).await.unwrap(),
            DispatchStatus::Failed { exit_code: Some(7) }
        );
    }
}
