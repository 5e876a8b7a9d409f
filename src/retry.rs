//! Per-task attempt lifecycle.
//!
//! Every task of a run owns one [`TaskAttempt`]. It walks
//! `Pending -> Running -> {Succeeded, Failed}` and, while retries remain,
//! `Failed -> Pending` after the configured delay. Nothing here is shared
//! between tasks.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub retry_delay: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, retry_delay: Duration) -> Self {
        Self {
            retries,
            retry_delay,
        }
    }
}

/// What the driver should do after an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct TaskAttempt {
    task_id: String,
    policy: RetryPolicy,
    state: AttemptState,
    attempts: u32,
    exhausted: bool,
    waits: Vec<Duration>,
    history: Vec<AttemptState>,
}

impl TaskAttempt {
    pub fn new(task_id: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            task_id: task_id.into(),
            policy,
            state: AttemptState::Pending,
            attempts: 0,
            exhausted: false,
            waits: Vec::new(),
            history: vec![AttemptState::Pending],
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    /// Number of times the task has entered `Running`.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn waits(&self) -> &[Duration] {
        &self.waits
    }

    pub fn history(&self) -> &[AttemptState] {
        &self.history
    }

    pub fn is_terminal(&self) -> bool {
        match self.state {
            AttemptState::Succeeded => true,
            AttemptState::Failed => self.exhausted,
            AttemptState::Pending | AttemptState::Running => false,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        self.transition(AttemptState::Pending, AttemptState::Running)?;
        self.attempts += 1;
        Ok(())
    }

    pub fn succeed(&mut self) -> Result<()> {
        self.transition(AttemptState::Running, AttemptState::Succeeded)
    }

    pub fn fail(&mut self) -> Result<RetryDecision> {
        self.transition(AttemptState::Running, AttemptState::Failed)?;

        if self.attempts <= self.policy.retries {
            Ok(RetryDecision::RetryAfter(self.policy.retry_delay))
        } else {
            self.exhausted = true;
            Ok(RetryDecision::GiveUp)
        }
    }

    /// Re-arms a failed attempt once its retry delay has elapsed.
    pub fn retry(&mut self) -> Result<()> {
        if self.exhausted {
            return Err(self.invalid(AttemptState::Pending));
        }
        self.transition(AttemptState::Failed, AttemptState::Pending)?;
        self.waits.push(self.policy.retry_delay);
        Ok(())
    }

    fn transition(&mut self, expected: AttemptState, next: AttemptState) -> Result<()> {
        if self.state != expected {
            return Err(self.invalid(next));
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    fn invalid(&self, to: AttemptState) -> FlowError {
        FlowError::InvalidTransition {
            task: self.task_id.clone(),
            from: self.state,
            to,
        }
    }
}
