use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::Arc,
    thread,
    time::Duration,
};

use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{error, info, warn};

use crate::{
    dispatch::{DispatchRequest, DispatchStatus, Dispatcher},
    error::{FlowError, Result},
    pipeline::{TaskSpec, Template},
    retry::{AttemptState, RetryDecision, RetryPolicy, TaskAttempt},
};

fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Failed,
    /// Never dispatched because `upstream` failed for good.
    UpstreamFailed { upstream: String },
}

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub outcome: TaskOutcome,
    pub attempts: u32,
    pub waits: Vec<Duration>,
    pub history: Vec<AttemptState>,
}

impl TaskRecord {
    fn from_attempt(attempt: &TaskAttempt) -> Self {
        let outcome = match attempt.state() {
            AttemptState::Succeeded => TaskOutcome::Succeeded,
            _ => TaskOutcome::Failed,
        };
        Self {
            outcome,
            attempts: attempt.attempts(),
            waits: attempt.waits().to_vec(),
            history: attempt.history().to_vec(),
        }
    }

    fn upstream_failed(upstream: &str) -> Self {
        Self {
            outcome: TaskOutcome::UpstreamFailed {
                upstream: upstream.to_string(),
            },
            attempts: 0,
            waits: Vec::new(),
            history: vec![AttemptState::Pending],
        }
    }
}

/// What happened to each task of one run.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Task ids in the order they were handed to the dispatcher.
    pub dispatch_order: Vec<String>,
    pub records: BTreeMap<String, TaskRecord>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.records
            .values()
            .all(|r| r.outcome == TaskOutcome::Succeeded)
    }

    pub fn unsuccessful_tasks(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|(_, r)| r.outcome != TaskOutcome::Succeeded)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn record(&self, task_id: &str) -> Option<&TaskRecord> {
        self.records.get(task_id)
    }
}

pub struct TaskRunner {
    template: Arc<Template>,
    dispatcher: Arc<dyn Dispatcher>,
    workers: usize,
    queues: BTreeSet<String>,
}

impl TaskRunner {
    pub fn new(
        template: Arc<Template>,
        dispatcher: Arc<dyn Dispatcher>,
        workers: Option<usize>,
        queues: impl IntoIterator<Item = String>,
    ) -> Self {
        let workers = workers.unwrap_or_else(default_workers).max(1);
        Self {
            template,
            dispatcher,
            workers,
            queues: queues.into_iter().collect(),
        }
    }

    /// Refuses the whole run if any selected task needs a queue this worker does not serve.
    pub fn check_affinity(&self, task_ids: &[String]) -> Result<()> {
        for task_id in task_ids {
            let task = self
                .template
                .task(task_id)
                .ok_or_else(|| FlowError::TaskNotFound(task_id.clone()))?;

            if !self.queues.contains(&task.queue) {
                return Err(FlowError::UnservedQueue {
                    task: task.id.clone(),
                    queue: task.queue.clone(),
                });
            }
        }
        Ok(())
    }

    pub async fn run_tasks(&self, task_ids: &[String]) -> Result<RunReport> {
        self.check_affinity(task_ids)?;

        let mut report = RunReport::default();
        if task_ids.is_empty() {
            return Ok(report);
        }

        let selected: BTreeSet<&str> = task_ids.iter().map(String::as_str).collect();
        let mut waiting_on: HashMap<&str, usize> = task_ids
            .iter()
            .map(|id| {
                let count = self
                    .template
                    .upstream(id)
                    .into_iter()
                    .filter(|up| selected.contains(up))
                    .count();
                (id.as_str(), count)
            })
            .collect();

        let mut ready: VecDeque<&str> = task_ids
            .iter()
            .map(String::as_str)
            .filter(|id| waiting_on.get(id) == Some(&0))
            .collect();

        info!(
            pipeline = %self.template.definition().id,
            tasks = task_ids.len(),
            workers = self.workers,
            "starting run"
        );

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut in_flight: JoinSet<(String, Result<TaskAttempt>)> = JoinSet::new();

        loop {
            while let Some(task_id) = ready.pop_front() {
                let task = self
                    .template
                    .task(task_id)
                    .cloned()
                    .ok_or_else(|| FlowError::TaskNotFound(task_id.to_string()))?;
                let policy = task.retry_policy(self.template.definition());
                let dispatcher = Arc::clone(&self.dispatcher);
                let semaphore = Arc::clone(&semaphore);

                report.dispatch_order.push(task.id.clone());

                in_flight.spawn(async move {
                    let id = task.id.clone();
                    // Run the attempt loop in its own task so a panicking
                    // dispatcher is still attributed to this task id.
                    let outcome = tokio::spawn(drive_task(task, policy, dispatcher, semaphore))
                        .await
                        .unwrap_or_else(|e| Err(FlowError::Execution(e.to_string())));
                    (id, outcome)
                });
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let (task_id, outcome) = joined.map_err(|e| FlowError::Execution(e.to_string()))?;

            let succeeded = match outcome {
                Ok(attempt) => {
                    let record = TaskRecord::from_attempt(&attempt);
                    let succeeded = record.outcome == TaskOutcome::Succeeded;
                    report.records.insert(task_id.clone(), record);
                    succeeded
                }
                Err(e) => {
                    error!(task = %task_id, error = %e, "task could not be driven");
                    report.records.insert(
                        task_id.clone(),
                        TaskRecord {
                            outcome: TaskOutcome::Failed,
                            attempts: 0,
                            waits: Vec::new(),
                            history: Vec::new(),
                        },
                    );
                    false
                }
            };

            if succeeded {
                for dependent in self.template.downstream(&task_id) {
                    if !selected.contains(dependent) || report.records.contains_key(dependent) {
                        continue;
                    }
                    if let Some(count) = waiting_on.get_mut(dependent) {
                        *count = count.saturating_sub(1);
                        if *count == 0 {
                            ready.push_back(dependent);
                        }
                    }
                }
            } else {
                for blocked in self.template.downstream_closure(&task_id) {
                    if !selected.contains(blocked.as_str()) || report.records.contains_key(&blocked) {
                        continue;
                    }
                    warn!(task = %blocked, upstream = %task_id, "not dispatched: upstream failed");
                    report
                        .records
                        .insert(blocked, TaskRecord::upstream_failed(&task_id));
                }
            }
        }

        if report.succeeded() {
            info!(pipeline = %self.template.definition().id, "run succeeded");
        } else {
            error!(
                pipeline = %self.template.definition().id,
                failed = ?report.unsuccessful_tasks(),
                "run failed"
            );
        }

        Ok(report)
    }
}

async fn drive_task(
    task: TaskSpec,
    policy: RetryPolicy,
    dispatcher: Arc<dyn Dispatcher>,
    semaphore: Arc<Semaphore>,
) -> Result<TaskAttempt> {
    let mut attempt = TaskAttempt::new(&task.id, policy);

    loop {
        let status = {
            let _permit = semaphore
                .acquire()
                .await
                .map_err(|e| FlowError::Execution(e.to_string()))?;

            attempt.start()?;
            let request = DispatchRequest::for_task(&task, attempt.attempts());
            info!(
                task = %task.id,
                attempt = attempt.attempts(),
                queue = %task.queue,
                "dispatching"
            );
            dispatcher.dispatch(&request).await
        };

        match status {
            Ok(DispatchStatus::Succeeded) => {
                attempt.succeed()?;
                info!(task = %task.id, attempt = attempt.attempts(), "succeeded");
                return Ok(attempt);
            }
            Ok(DispatchStatus::Failed { exit_code }) => {
                warn!(task = %task.id, attempt = attempt.attempts(), exit_code = ?exit_code, "attempt failed");
            }
            Err(e) => {
                warn!(task = %task.id, attempt = attempt.attempts(), error = %e, "attempt could not run");
            }
        }

        match attempt.fail()? {
            RetryDecision::RetryAfter(delay) => {
                info!(
                    task = %task.id,
                    delay = %humantime::format_duration(delay),
                    "retrying after delay"
                );
                tokio::time::sleep(delay).await;
                attempt.retry()?;
            }
            RetryDecision::GiveUp => {
                error!(task = %task.id, attempts = attempt.attempts(), "retries exhausted");
                return Ok(attempt);
            }
        }
    }
}
