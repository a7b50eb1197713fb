//! Task queue contract.
//!
//! The queue delivers [`Task`]s to the worker and records their terminal
//! state. It knows nothing about cancellation: a cancelled task simply comes
//! back through [`TaskQueue::acknowledge`] with a `CANCELLED*` outcome.
//!
//! # State Machine
//!
//! ```text
//! waiting ──next()──> active ──acknowledge()──> completed | failed | cancelled
//! ```
//!
//! | Outcome status | Queue state |
//! |----------------|-------------|
//! | `FINISHED` | `completed` |
//! | `FINISHED_WITH_ERROR` | `failed` |
//! | `CANCELLED`, `CANCELLED_WITH_ERROR` | `cancelled` |

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_IMAGE;
use crate::error::QueueError;
use crate::types::{demo_command, OutcomeStatus, Task, TaskOutcome};

pub use memory::InMemoryQueue;
#[cfg(feature = "redis")]
pub use self::redis::RedisQueue;

/// Where a task is in the queue's lifecycle.
///
/// # Examples
///
/// ```
/// use cancelable_worker::queue::QueueState;
/// use cancelable_worker::OutcomeStatus;
///
/// assert_eq!(QueueState::from_outcome(OutcomeStatus::CancelledWithError), QueueState::Cancelled);
/// assert!(QueueState::Failed.is_terminal());
/// assert_eq!(QueueState::parse("active"), Some(QueueState::Active));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    /// Enqueued, not yet claimed by a worker.
    Waiting,
    /// Claimed by a worker and running.
    Active,
    /// Finished without error.
    Completed,
    /// Finished with an error (including start failures).
    Failed,
    /// Stopped by a cancellation request.
    Cancelled,
}

impl QueueState {
    /// Returns `true` once the task can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// The terminal state recorded for an outcome.
    pub fn from_outcome(status: OutcomeStatus) -> Self {
        match status {
            OutcomeStatus::Finished => Self::Completed,
            OutcomeStatus::FinishedWithError => Self::Failed,
            OutcomeStatus::Cancelled | OutcomeStatus::CancelledWithError => Self::Cancelled,
        }
    }

    /// The wire name, as stored by the queue backends.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parses a wire name.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "waiting" => Some(Self::Waiting),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a producer asks for. The queue assigns the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    /// Container image.
    pub image: String,
    /// Command to run; `None` runs the demo loop for the assigned id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
}

impl TaskRequest {
    /// The demo workload on the default image.
    pub fn demo() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            command: None,
        }
    }

    /// Runs `command` in `image`.
    pub fn new(image: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            image: image.into(),
            command: Some(command),
        }
    }

    /// Builds the task once the queue has chosen `id`.
    pub fn into_task(self, id: impl Into<String>) -> Task {
        let id = id.into();
        let command = self.command.unwrap_or_else(|| demo_command(&id));
        Task::new(id, self.image, command)
    }
}

/// A task as the queue sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedTask {
    /// The task definition.
    pub task: Task,
    /// Current lifecycle state.
    pub state: QueueState,
    /// Terminal outcome, once acknowledged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TaskOutcome>,
}

/// Delivers tasks to workers and records their outcomes.
///
/// Implementations must be safe for concurrent use: `next` hands each
/// waiting task to exactly one caller.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Adds a task and returns it with its assigned id.
    ///
    /// Ids are decimal strings from a counter that only goes up.
    async fn enqueue(&self, request: TaskRequest) -> Result<Task, QueueError>;

    /// Claims the oldest waiting task and marks it `active`.
    ///
    /// Returns `Ok(None)` when nothing is waiting.
    async fn next(&self) -> Result<Option<Task>, QueueError>;

    /// Records a task's terminal outcome.
    ///
    /// # Errors
    ///
    /// [`QueueError::NotFound`] if the queue never issued the task.
    async fn acknowledge(&self, outcome: &TaskOutcome) -> Result<(), QueueError>;

    /// Current state of `task_id`.
    ///
    /// # Errors
    ///
    /// [`QueueError::NotFound`] for unknown ids.
    async fn state(&self, task_id: &str) -> Result<QueueState, QueueError>;

    /// Every known task, oldest first.
    async fn list(&self) -> Result<Vec<QueuedTask>, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_mapping() {
        let expected = [
            QueueState::Completed,
            QueueState::Failed,
            QueueState::Cancelled,
            QueueState::Cancelled,
        ];
        for (status, state) in OutcomeStatus::ALL.iter().zip(expected) {
            assert_eq!(QueueState::from_outcome(*status), state, "{status}");
        }
    }

    #[test]
    fn state_names_round_trip_through_parse() {
        for state in [
            QueueState::Waiting,
            QueueState::Active,
            QueueState::Completed,
            QueueState::Failed,
            QueueState::Cancelled,
        ] {
            assert_eq!(QueueState::parse(state.as_str()), Some(state));
            assert_eq!(serde_json::to_value(state).unwrap(), state.as_str());
        }
        assert_eq!(QueueState::parse("paused"), None);
    }

    #[test]
    fn only_finished_states_are_terminal() {
        assert!(!QueueState::Waiting.is_terminal());
        assert!(!QueueState::Active.is_terminal());
        assert!(QueueState::Cancelled.is_terminal());
    }

    #[test]
    fn demo_request_gets_id_specific_command() {
        let task = TaskRequest::demo().into_task("17");
        assert_eq!(task.image(), DEFAULT_IMAGE);
        assert!(task.command().join(" ").contains("[JobID=17]"));

        let task = TaskRequest::new("busybox", vec!["true".to_string()]).into_task("18");
        assert_eq!(task.command(), ["true".to_string()]);
    }
}
