//! Task poller - long-running device operations.
//!
//! Backup, restore, sync package preparation and update all follow the same
//! shape: a POST starts the task and returns its id, then GET `{id}` reports
//! `state` until it is `finished` or `error`. [`TaskPoller`] is the single
//! implementation of that loop.
//!
//! ```text
//! running ──► running ──► finished      TaskOutcome::Finished
//!                    └──► error         TaskOutcome::Failed
//! (deadline while running)              TaskOutcome::TimedOut
//! ```

use std::fmt;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use crate::config::{DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT};
use crate::engine::TransactionEngine;
use crate::error::{LinkError, Result};
use crate::protocol::{Endpoint, Method, Response};

/// Reported task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Running,
    Finished,
    Error,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Running)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskState::Running => "running",
            TaskState::Finished => "finished",
            TaskState::Error => "error",
        })
    }
}

/// Body of a task status response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A started task: where to poll, and with which id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    pub endpoint: Endpoint,
    pub id: String,
}

impl TaskHandle {
    pub fn new(endpoint: Endpoint, id: impl Into<String>) -> Self {
        Self {
            endpoint,
            id: id.into(),
        }
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} task {}", self.endpoint, self.id)
    }
}

#[derive(Serialize)]
struct StatusQuery<'a> {
    id: &'a str,
}

/// Response to the initiating POST. Devices spell the id either way and
/// send it as a string or a number.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskStarted {
    #[serde(default, deserialize_with = "deserialize_task_id")]
    task_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_task_id")]
    id: Option<String>,
}

fn deserialize_task_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(de::Error::custom(format!("task id must be a string or number, got {other}"))),
    }
}

/// Polling cadence and deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Wait between status queries.
    pub interval: Duration,
    /// Overall deadline, measured from the start of polling.
    pub timeout: Duration,
    /// Wait before the first query. Counts against `timeout`.
    pub initial_delay: Duration,
}

impl PollPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            initial_delay: Duration::ZERO,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT)
    }
}

/// How polling ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The task reported `finished`; `body` is the final status body.
    Finished { body: Value },
    /// The task reported `error`.
    Failed { reason: Option<String> },
    /// Still `running` at the deadline. The task's fate is unknown.
    TimedOut { elapsed: Duration, polls: u32 },
}

impl TaskOutcome {
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskOutcome::Finished { .. })
    }
}

/// Drives tasks over a borrowed transaction engine.
pub struct TaskPoller<'e, S> {
    engine: &'e mut TransactionEngine<S>,
    policy: PollPolicy,
    request_timeout: Duration,
}

impl<'e, S> TaskPoller<'e, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// `request_timeout` bounds each status transaction; `policy` bounds the
    /// whole wait.
    pub fn new(
        engine: &'e mut TransactionEngine<S>,
        policy: PollPolicy,
        request_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            policy,
            request_timeout,
        }
    }

    /// POST `body` to `endpoint` and read the task id from the response.
    pub async fn start<B: Serialize>(&mut self, endpoint: Endpoint, body: &B) -> Result<TaskHandle> {
        let started: TaskStarted = self
            .engine
            .request(endpoint, Method::Post, body, self.request_timeout)
            .await?
            .require_success(&format!("{endpoint} task start"))?
            .body_as()?;

        let id = started.task_id.or(started.id).ok_or_else(|| {
            LinkError::MalformedResponse(format!("{endpoint} task start carries no taskId"))
        })?;
        let handle = TaskHandle::new(endpoint, id);
        tracing::debug!(task = %handle, "task started");
        Ok(handle)
    }

    /// Query the task once.
    ///
    /// 2xx and 3xx responses carry a state (the device answers a finished
    /// backup with 303); anything else is a `Status` error.
    pub async fn status(&mut self, task: &TaskHandle) -> Result<(TaskStatus, Response)> {
        let response = self
            .engine
            .request(
                task.endpoint,
                Method::Get,
                &StatusQuery { id: &task.id },
                self.request_timeout,
            )
            .await?;

        if !(response.status.is_success() || response.status.is_redirect()) {
            return Err(LinkError::Status {
                status: response.status,
                context: format!("status of {task}"),
                reason: response.reason(),
            });
        }

        let status = response.body_as::<TaskStatus>()?;
        Ok((status, response))
    }

    /// Poll until the task is terminal or the policy deadline passes.
    ///
    /// A task already terminal is reported on the first query.
    pub async fn poll_until_terminal(&mut self, task: &TaskHandle) -> Result<TaskOutcome> {
        let started = Instant::now();
        if !self.policy.initial_delay.is_zero() {
            tokio::time::sleep(self.policy.initial_delay).await;
        }

        let mut polls = 0u32;
        loop {
            let (status, response) = self.status(task).await?;
            polls += 1;
            tracing::debug!(task = %task, state = %status.state, polls, "task polled");

            match status.state {
                TaskState::Finished => {
                    return Ok(TaskOutcome::Finished {
                        body: response.body,
                    })
                }
                TaskState::Error => {
                    return Ok(TaskOutcome::Failed {
                        reason: status.reason,
                    })
                }
                TaskState::Running => {
                    let elapsed = started.elapsed();
                    if elapsed >= self.policy.timeout {
                        tracing::debug!(task = %task, ?elapsed, polls, "task deadline passed");
                        return Ok(TaskOutcome::TimedOut { elapsed, polls });
                    }
                    let remaining = self.policy.timeout - elapsed;
                    tokio::time::sleep(self.policy.interval.min(remaining)).await;
                }
            }
        }
    }
}
